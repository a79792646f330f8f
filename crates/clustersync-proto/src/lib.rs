//! # clustersync Protocol
//!
//! Topic templates and wire formats shared by the transports.
//!
//! ## Wire formats
//!
//! - Broker topics carry CloudEvents in structured JSON mode ([`json`])
//! - The streaming RPC channel carries protobuf CloudEvents ([`grpc`])
//!
//! ## Topics
//!
//! Broker templates look like `sources/{source}/clusters/+/sourceevents`,
//! where `+` is the counterpart placeholder ([`topics`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod grpc;
pub mod json;
pub mod topics;

pub use topics::{TopicError, Topics};

/// Errors for wire encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// An attribute had an unusable value
    #[error("invalid attribute: {0}")]
    Attribute(String),
}
