//! # clustersync Client
//!
//! One engine for both sides of the protocol. A [`CloudEventsClient`] is
//! assembled from a transport, its address resolver, a codec for the
//! resource kind and a lister for resync answers:
//!
//! - `publish` encodes, resolves and sends
//! - `subscribe` receives, decodes, gates and dispatches in order
//! - `resync` asks the counterpart to republish; incoming resync requests
//!   are answered from the lister
//!
//! Reconnecting is left to the owner: rebuild the client when the
//! transport reports a lost connection.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod dedup;
pub mod error;
pub mod handler;
mod resync;

pub use client::{
    ClientBuilder, CloudEventsClient, Delivery, Role, Subscription, DISPATCH_CAPACITY,
};
pub use dedup::{DedupGate, ResourceKey, Update, Verdict};
pub use error::{ClientError, HandlerError};
pub use handler::EventHandler;
