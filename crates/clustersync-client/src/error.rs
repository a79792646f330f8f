//! Client errors.

use clustersync_core::{AddressError, CodecError, HashError, ListError, TransportError};

/// Error returned by a subscription handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

/// Errors surfaced by the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Encoding or decoding failed
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// No address for the event
    #[error(transparent)]
    Address(#[from] AddressError),
    /// Send or receive failed
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Lister failed while answering a resync
    #[error(transparent)]
    List(#[from] ListError),
    /// Status hash could not be computed
    #[error(transparent)]
    Hash(#[from] HashError),
    /// Handler rejected the resource
    #[error(transparent)]
    Handler(#[from] HandlerError),
    /// Event the client's role does not handle
    #[error("unexpected event: {0}")]
    Unexpected(String),
    /// Client assembled without a required part
    #[error("client misconfigured: {0}")]
    Config(String),
}
