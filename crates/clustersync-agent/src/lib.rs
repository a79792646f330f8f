//! # clustersync Runtime
//!
//! Reference source/agent process built on the clustersync client.
//!
//! ## Architecture
//!
//! Manifests live in a `SQLite` store shared by every session:
//! 1. **Source**: publishes authored manifests ahead of their last
//!    published version, records reported status
//! 2. **Agent**: stores received manifests and reports an `Applied` status
//! 3. **Resync**: both sides request a resync after subscribing and answer
//!    the counterpart's requests from the store
//!
//! Configuration is read from `CLUSTERSYNC_*` environment variables; see
//! [`RuntimeConfig::from_env`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod manifest;
pub mod persistence;
pub mod runtime;

pub use config::{RoleKind, RuntimeConfig, TransportConfig, TransportKind};
pub use manifest::{manifest_data_type, manifest_status_hash, ManifestCodec, ManifestResource};
pub use persistence::SqliteStore;
pub use runtime::{publish_pending, Runtime, StoreHandler};
