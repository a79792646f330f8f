//! The contract each transport implementation satisfies.
//!
//! A transport contributes two things: an [`AddressResolver`] that maps an
//! outbound event to a topic or channel, and a [`Transport`] that moves
//! envelopes. Everything else is shared.

use crate::envelope::{Envelope, EXTENSION_CLUSTER_NAME, EXTENSION_ORIGINAL_SOURCE};
use crate::event_type::{EventType, TypeError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Inbound envelopes. Malformed messages arrive as `Err` and do not end the stream.
pub type EnvelopeStream = mpsc::Receiver<Result<Envelope, TransportError>>;

/// The parts of an outbound event that decide its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMetadata {
    /// Parsed type
    pub event_type: EventType,
    /// `clustername` extension
    pub cluster_name: Option<String>,
    /// `originalsource` extension
    pub original_source: Option<String>,
    /// Declared source of the event
    pub source: String,
}

impl EventMetadata {
    /// Extract metadata from an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::InvalidType`] if the type string is malformed.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, AddressError> {
        Ok(Self {
            event_type: envelope.parsed_type()?,
            cluster_name: envelope
                .extension_str(EXTENSION_CLUSTER_NAME)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            original_source: envelope
                .extension_str(EXTENSION_ORIGINAL_SOURCE)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            source: envelope.source.clone(),
        })
    }
}

/// Computes the outbound address of an event. Pure; never performs I/O.
pub trait AddressResolver: Send + Sync {
    /// Resolve the topic or channel for `metadata`.
    ///
    /// # Errors
    ///
    /// Returns error if the event lacks what its shape requires.
    fn resolve(&self, metadata: &EventMetadata) -> Result<String, AddressError>;
}

/// Delivers and receives envelopes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an envelope to `address`.
    async fn send(&self, address: &str, envelope: &Envelope) -> Result<(), TransportError>;

    /// Start receiving envelopes addressed to this client.
    async fn subscribe(&self) -> Result<EnvelopeStream, TransportError>;

    /// Stop background work and release the connection.
    async fn close(&self);
}

/// Errors resolving an address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// Malformed type string
    #[error(transparent)]
    InvalidType(#[from] TypeError),
    /// Source-side event without a target cluster
    #[error("missing clustername extension for {0}")]
    MissingClusterName(String),
    /// Agent-side status event without the source to answer
    #[error("missing originalsource extension for {0}")]
    MissingOriginalSource(String),
    /// Broadcast requested but no broadcast template configured
    #[error("no broadcast topic configured for {0}")]
    MissingBroadcastTopic(String),
    /// Event shape the resolver does not route
    #[error("unsupported event {0}")]
    UnsupportedEvent(String),
}

/// Errors moving envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established or was lost
    #[error("connection error: {0}")]
    Connection(String),
    /// Send failed
    #[error("send error: {0}")]
    Send(String),
    /// Subscription failed
    #[error("subscribe error: {0}")]
    Subscribe(String),
    /// Received bytes were not a valid envelope
    #[error("wire format error: {0}")]
    Wire(String),
    /// Transport already closed
    #[error("transport closed")]
    Closed,
}
