//! Structured event type strings.
//!
//! Format: `<group>/<version>/<resource>.<subresource>.<action>`
//!
//! The group may contain dots (`io.clustersync.works`), the resource,
//! sub-resource and action may not. No component may contain `/`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Action used to request a resync from the counterpart.
pub const RESYNC_REQUEST_ACTION: &str = "resync_request";

/// Action used when republishing state in answer to a resync request.
pub const RESYNC_RESPONSE_ACTION: &str = "resync_response";

/// Identifies the kind of resource carried by an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataType {
    /// API group, e.g. `io.clustersync.works`
    pub group: String,
    /// API version, e.g. `v1`
    pub version: String,
    /// Plural resource name, e.g. `manifests`
    pub resource: String,
}

impl DataType {
    /// Create a new data type.
    #[must_use]
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.resource)
    }
}

/// Which half of a resource an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubResource {
    /// Desired state, authored by the source
    Spec,
    /// Observed state, authored by the agent
    Status,
}

impl SubResource {
    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for SubResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubResource {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spec" => Ok(Self::Spec),
            "status" => Ok(Self::Status),
            other => Err(TypeError::InvalidTypeFormat(format!(
                "unknown subresource '{other}'"
            ))),
        }
    }
}

/// A fully structured event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType {
    /// Resource kind
    pub data_type: DataType,
    /// Spec or status
    pub sub_resource: SubResource,
    /// Domain verb, or [`RESYNC_REQUEST_ACTION`]
    pub action: String,
}

impl EventType {
    /// Create a new event type.
    #[must_use]
    pub fn new(data_type: DataType, sub_resource: SubResource, action: impl Into<String>) -> Self {
        Self {
            data_type,
            sub_resource,
            action: action.into(),
        }
    }

    /// Resync request for the given data type and sub-resource.
    #[must_use]
    pub fn resync_request(data_type: DataType, sub_resource: SubResource) -> Self {
        Self::new(data_type, sub_resource, RESYNC_REQUEST_ACTION)
    }

    /// Whether the action is the reserved resync verb.
    #[must_use]
    pub fn is_resync_request(&self) -> bool {
        self.action == RESYNC_REQUEST_ACTION
    }

    /// Encode to the wire string.
    #[must_use]
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Decode a wire string.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidTypeFormat`] if the string does not have
    /// exactly three `/`-separated segments, the last of which has exactly
    /// three `.`-separated parts, or if any component is empty.
    pub fn decode(raw: &str) -> Result<Self, TypeError> {
        let invalid = |reason: &str| TypeError::InvalidTypeFormat(format!("{raw}: {reason}"));

        let segments: Vec<&str> = raw.split('/').collect();
        if segments.len() != 3 {
            return Err(invalid("expected <group>/<version>/<resource>.<subresource>.<action>"));
        }

        let tail: Vec<&str> = segments[2].split('.').collect();
        if tail.len() != 3 {
            return Err(invalid("expected <resource>.<subresource>.<action>"));
        }

        let (group, version) = (segments[0], segments[1]);
        let (resource, sub_resource, action) = (tail[0], tail[1], tail[2]);

        if [group, version, resource, action].iter().any(|part| part.is_empty()) {
            return Err(invalid("empty component"));
        }

        let sub_resource = sub_resource
            .parse::<SubResource>()
            .map_err(|_| invalid("subresource must be 'spec' or 'status'"))?;

        Ok(Self {
            data_type: DataType::new(group, version, resource),
            sub_resource,
            action: action.to_string(),
        })
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.data_type, self.sub_resource, self.action)
    }
}

impl FromStr for EventType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Errors for event type parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    /// The type string does not match the positional format
    #[error("invalid event type format: {0}")]
    InvalidTypeFormat(String),
}
