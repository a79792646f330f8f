//! # clustersync Core
//!
//! Transport-independent building blocks shared by sources and agents.
//!
//! This crate provides:
//! - Structured event types (`group/version/resource.subresource.action`)
//! - CloudEvent-shaped envelopes with typed extension attributes
//! - The resource identity contract and list scoping
//! - Codec, lister and status hash traits implemented per resource kind
//! - The address resolver and transport traits implemented per transport

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod envelope;
pub mod event_type;
pub mod resource;
pub mod transport;

pub use codec::{json_sha256, Codec, CodecError, HashError, ListError, Lister, StatusHasher};
pub use envelope::{
    Envelope, EventBuilder, ExtensionValue, APPLICATION_JSON, CLUSTER_ALL,
    EXTENSION_CLUSTER_NAME, EXTENSION_DELETION_TIMESTAMP, EXTENSION_ORIGINAL_SOURCE,
    EXTENSION_RESOURCE_ID, EXTENSION_RESOURCE_VERSION, SOURCE_ALL, SPEC_VERSION,
};
pub use event_type::{
    DataType, EventType, SubResource, TypeError, RESYNC_REQUEST_ACTION, RESYNC_RESPONSE_ACTION,
};
pub use resource::{ListOptions, ResourceAction, ResourceObject};
pub use transport::{
    AddressError, AddressResolver, EnvelopeStream, EventMetadata, Transport, TransportError,
};
