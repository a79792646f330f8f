//! Resource identity contract and list scoping.

use crate::envelope::CLUSTER_ALL;
use chrono::{DateTime, Utc};

/// Identity and lifecycle accessors every synchronized resource exposes.
///
/// `(resource_id, cluster_name)` uniquely identifies a resource instance.
pub trait ResourceObject: Clone + Send + Sync + 'static {
    /// Stable identifier
    fn resource_id(&self) -> &str;

    /// Version, strictly increasing on every spec mutation
    fn resource_version(&self) -> i64;

    /// Owning agent
    fn cluster_name(&self) -> &str;

    /// Present when the resource is being deleted
    fn deletion_timestamp(&self) -> Option<DateTime<Utc>>;

    /// Source a status update should be addressed to, if known
    fn original_source(&self) -> Option<&str> {
        None
    }
}

/// Scope of a list call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Restrict to one cluster; `None` lists every cluster
    pub cluster_name: Option<String>,
}

impl ListOptions {
    /// List across all clusters.
    #[must_use]
    pub fn all() -> Self {
        Self { cluster_name: None }
    }

    /// List a single cluster. Empty names and the `+` wildcard mean all clusters.
    #[must_use]
    pub fn cluster(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.is_empty() || name == CLUSTER_ALL {
            Self::all()
        } else {
            Self {
                cluster_name: Some(name),
            }
        }
    }

    /// The cluster filter, if any.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.cluster_name.as_deref()
    }

    /// Whether a resource falls inside this scope.
    #[must_use]
    pub fn matches<T: ResourceObject>(&self, resource: &T) -> bool {
        self.scope()
            .map_or(true, |cluster| resource.cluster_name() == cluster)
    }
}

/// What happened to a resource, as seen by a subscription handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceAction {
    /// First time this resource is seen
    Added,
    /// Spec changed
    Modified,
    /// Status changed
    StatusModified,
    /// Delete intent received
    Deleted,
}
