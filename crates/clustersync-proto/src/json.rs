//! CloudEvents structured JSON mode, used on broker topics.

use crate::WireError;
use clustersync_core::Envelope;

/// Encode an envelope as structured JSON bytes.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn to_json(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(envelope).map_err(|e| WireError::Serialize(e.to_string()))
}

/// Decode structured JSON bytes into an envelope.
///
/// # Errors
///
/// Returns error if the bytes are not a structured CloudEvent.
pub fn from_json(bytes: &[u8]) -> Result<Envelope, WireError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| WireError::Deserialize(e.to_string()))?;
    if envelope.spec_version.is_empty() || envelope.id.is_empty() {
        return Err(WireError::Deserialize(
            "specversion and id must be set".to_string(),
        ));
    }
    Ok(envelope)
}
