//! Per-kind codec, lister and status hash contracts.

use crate::envelope::Envelope;
use crate::event_type::{DataType, EventType, TypeError};
use crate::resource::ListOptions;
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Translates one resource kind to and from envelopes.
pub trait Codec<T>: Send + Sync {
    /// The data type this codec handles.
    fn event_data_type(&self) -> DataType;

    /// Encode a resource.
    ///
    /// Deleting resources are encoded without payload and with the
    /// `deletiontimestamp` extension set.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedDataType`] if `event_type` is for
    /// another kind, or a payload error if serialization fails.
    fn encode(&self, source: &str, event_type: &EventType, resource: &T)
        -> Result<Envelope, CodecError>;

    /// Decode an envelope.
    ///
    /// # Errors
    ///
    /// Returns a format error if the type, extensions or payload are invalid.
    fn decode(&self, envelope: &Envelope) -> Result<T, CodecError>;

    /// Reject event types for other kinds.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedDataType`] on mismatch.
    fn check_data_type(&self, event_type: &EventType) -> Result<(), CodecError> {
        let expected = self.event_data_type();
        if event_type.data_type == expected {
            Ok(())
        } else {
            Err(CodecError::UnsupportedDataType {
                expected: expected.to_string(),
                actual: event_type.data_type.to_string(),
            })
        }
    }
}

/// Authoritative state used to answer resync requests.
#[async_trait]
pub trait Lister<T>: Send + Sync {
    /// List resources in scope.
    async fn list(&self, options: &ListOptions) -> Result<Vec<T>, ListError>;
}

/// Content hash of a resource's status.
pub trait StatusHasher<T>: Send + Sync {
    /// Hash the status of `resource`.
    ///
    /// # Errors
    ///
    /// Returns error if the status cannot be serialized.
    fn status_hash(&self, resource: &T) -> Result<String, HashError>;
}

impl<T, F> StatusHasher<T> for F
where
    F: Fn(&T) -> Result<String, HashError> + Send + Sync,
{
    fn status_hash(&self, resource: &T) -> Result<String, HashError> {
        self(resource)
    }
}

/// Hex SHA-256 of the JSON form of `value`.
///
/// # Errors
///
/// Returns error if `value` cannot be serialized.
pub fn json_sha256<S: Serialize>(value: &S) -> Result<String, HashError> {
    let bytes = serde_json::to_vec(value).map_err(|e| HashError(e.to_string()))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Malformed type string
    #[error(transparent)]
    InvalidType(#[from] TypeError),
    /// Event belongs to another resource kind
    #[error("unsupported data type {actual}, expected {expected}")]
    UnsupportedDataType {
        /// Data type of the codec
        expected: String,
        /// Data type of the event
        actual: String,
    },
    /// Required extension absent
    #[error("missing extension '{0}'")]
    MissingExtension(String),
    /// Extension present with the wrong shape
    #[error("malformed extension '{name}': {reason}")]
    MalformedExtension {
        /// Extension name
        name: String,
        /// What was wrong
        reason: String,
    },
    /// Payload could not be (de)serialized
    #[error("payload error: {0}")]
    Payload(String),
}

/// Lister failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("list failed: {0}")]
pub struct ListError(pub String);

/// Status hash failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("status hash failed: {0}")]
pub struct HashError(pub String);
