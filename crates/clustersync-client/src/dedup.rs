//! Duplicate and stale update suppression.
//!
//! One entry per `(resource id, cluster name)`, holding the version and
//! status hash of the last update a handler accepted. Entries change only
//! after a successful dispatch. An update being dispatched is reserved so a
//! concurrent copy of it is reported as a duplicate.

use clustersync_core::{ResourceAction, SubResource};
use std::collections::HashMap;

/// Identity of a resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// Resource id
    pub resource_id: String,
    /// Owning cluster
    pub cluster_name: String,
}

impl ResourceKey {
    /// Create a key.
    #[must_use]
    pub fn new(resource_id: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            cluster_name: cluster_name.into(),
        }
    }
}

/// An inbound update, reduced to what the gate compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    /// Which half of the resource changed
    pub sub_resource: SubResource,
    /// Resource version carried by the event
    pub version: i64,
    /// Status hash, when a hasher is configured
    pub status_hash: Option<String>,
    /// Delete intent
    pub deleting: bool,
}

/// Gate decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the resource to the handler
    Dispatch(ResourceAction),
    /// Nothing changed since the last dispatch
    Duplicate,
    /// Older than what was already accepted
    Stale {
        /// Last accepted version
        accepted: i64,
    },
}

#[derive(Debug, Clone)]
struct Entry {
    version: i64,
    status_hash: Option<String>,
    deleted: bool,
}

/// Per-resource dedup state.
#[derive(Debug, Default)]
pub struct DedupGate {
    entries: HashMap<ResourceKey, Entry>,
    in_flight: HashMap<ResourceKey, Update>,
}

impl DedupGate {
    /// Empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `update` should reach the handler.
    #[must_use]
    pub fn check(&self, key: &ResourceKey, update: &Update) -> Verdict {
        if update.deleting {
            return Verdict::Dispatch(ResourceAction::Deleted);
        }

        let Some(entry) = self.entries.get(key) else {
            return Verdict::Dispatch(ResourceAction::Added);
        };

        if update.version < entry.version {
            return Verdict::Stale {
                accepted: entry.version,
            };
        }

        if entry.deleted {
            return if update.version > entry.version {
                Verdict::Dispatch(ResourceAction::Added)
            } else {
                Verdict::Stale {
                    accepted: entry.version,
                }
            };
        }

        match update.sub_resource {
            SubResource::Spec if update.version == entry.version => Verdict::Duplicate,
            SubResource::Spec => Verdict::Dispatch(ResourceAction::Modified),
            SubResource::Status => match (&update.status_hash, &entry.status_hash) {
                (Some(new), Some(old)) if new == old => Verdict::Duplicate,
                _ => Verdict::Dispatch(ResourceAction::StatusModified),
            },
        }
    }

    /// Like [`check`](Self::check), but a dispatch verdict reserves the
    /// update until [`record`](Self::record) or [`release`](Self::release).
    pub fn reserve(&mut self, key: &ResourceKey, update: &Update) -> Verdict {
        if self.in_flight.get(key) == Some(update) {
            return Verdict::Duplicate;
        }
        let verdict = self.check(key, update);
        if matches!(verdict, Verdict::Dispatch(_)) {
            self.in_flight.insert(key.clone(), update.clone());
        }
        verdict
    }

    /// Drop the reservation of an update whose handler failed.
    pub fn release(&mut self, key: &ResourceKey, update: &Update) {
        if self.in_flight.get(key) == Some(update) {
            self.in_flight.remove(key);
        }
    }

    /// Record an update the handler accepted.
    pub fn record(&mut self, key: ResourceKey, update: &Update) {
        self.release(&key, update);
        let version = self
            .entries
            .get(&key)
            .map_or(update.version, |entry| entry.version.max(update.version));
        self.entries.insert(
            key,
            Entry {
                version,
                status_hash: update.status_hash.clone(),
                deleted: update.deleting,
            },
        );
    }

    /// Number of tracked resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
