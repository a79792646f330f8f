//! CloudEvent-shaped envelopes and their extension attributes.

use crate::codec::CodecError;
use crate::event_type::{EventType, TypeError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// CloudEvents specification version written on every envelope.
pub const SPEC_VERSION: &str = "1.0";

/// Content type of JSON payloads.
pub const APPLICATION_JSON: &str = "application/json";

/// Extension carrying the resource identifier.
pub const EXTENSION_RESOURCE_ID: &str = "resourceid";
/// Extension carrying the resource version.
pub const EXTENSION_RESOURCE_VERSION: &str = "resourceversion";
/// Extension carrying the owning cluster.
pub const EXTENSION_CLUSTER_NAME: &str = "clustername";
/// Extension naming the source a status event answers.
pub const EXTENSION_ORIGINAL_SOURCE: &str = "originalsource";
/// Extension marking a delete intent (RFC 3339).
pub const EXTENSION_DELETION_TIMESTAMP: &str = "deletiontimestamp";

/// `originalsource` value addressing every source.
pub const SOURCE_ALL: &str = "+";
/// `clustername` value addressing every cluster.
pub const CLUSTER_ALL: &str = "+";

/// A typed extension attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtensionValue {
    /// Boolean attribute
    Boolean(bool),
    /// Integer attribute
    Integer(i64),
    /// String attribute
    String(String),
}

impl From<&str> for ExtensionValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ExtensionValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for ExtensionValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for ExtensionValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// A publish/subscribe envelope.
///
/// Serializes to the CloudEvents structured JSON form, with extension
/// attributes flattened next to the context attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// CloudEvents spec version
    #[serde(rename = "specversion")]
    pub spec_version: String,
    /// Unique event identifier
    pub id: String,
    /// Identity of the publishing client
    pub source: String,
    /// Raw structured type string
    #[serde(rename = "type")]
    pub event_type: String,
    /// Creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Payload content type
    #[serde(
        rename = "datacontenttype",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub data_content_type: Option<String>,
    /// JSON payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Extension attributes
    #[serde(flatten)]
    pub extensions: BTreeMap<String, ExtensionValue>,
}

impl Envelope {
    /// Create an envelope without payload or extensions.
    #[must_use]
    pub fn new(source: impl Into<String>, event_type: &EventType) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.encode(),
            time: Some(Utc::now()),
            data_content_type: None,
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    /// Parse the structured type.
    ///
    /// # Errors
    ///
    /// Returns error if the type string is malformed.
    pub fn parsed_type(&self) -> Result<EventType, TypeError> {
        EventType::decode(&self.event_type)
    }

    /// Set an extension attribute, replacing any previous value.
    pub fn set_extension(&mut self, name: &str, value: impl Into<ExtensionValue>) {
        self.extensions.insert(name.to_string(), value.into());
    }

    /// Get a raw extension attribute.
    #[must_use]
    pub fn extension(&self, name: &str) -> Option<&ExtensionValue> {
        self.extensions.get(name)
    }

    /// Get a string extension, treating other shapes as absent.
    #[must_use]
    pub fn extension_str(&self, name: &str) -> Option<&str> {
        match self.extensions.get(name) {
            Some(ExtensionValue::String(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Get a required string extension.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingExtension`] if absent and
    /// [`CodecError::MalformedExtension`] if not a string.
    pub fn required_string(&self, name: &str) -> Result<String, CodecError> {
        match self.extensions.get(name) {
            None => Err(CodecError::MissingExtension(name.to_string())),
            Some(ExtensionValue::String(value)) => Ok(value.clone()),
            Some(other) => Err(CodecError::MalformedExtension {
                name: name.to_string(),
                reason: format!("expected string, got {other:?}"),
            }),
        }
    }

    /// Get a required integer extension. Stringified integers are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingExtension`] if absent and
    /// [`CodecError::MalformedExtension`] if not an integer.
    pub fn required_integer(&self, name: &str) -> Result<i64, CodecError> {
        match self.extensions.get(name) {
            None => Err(CodecError::MissingExtension(name.to_string())),
            Some(ExtensionValue::Integer(value)) => Ok(*value),
            Some(ExtensionValue::String(value)) => {
                value
                    .trim()
                    .parse()
                    .map_err(|e| CodecError::MalformedExtension {
                        name: name.to_string(),
                        reason: format!("'{value}' is not an integer: {e}"),
                    })
            }
            Some(other) => Err(CodecError::MalformedExtension {
                name: name.to_string(),
                reason: format!("expected integer, got {other:?}"),
            }),
        }
    }

    /// Deletion timestamp, if this envelope marks a delete intent.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedExtension`] if the extension is not RFC 3339.
    pub fn deletion_timestamp(&self) -> Result<Option<DateTime<Utc>>, CodecError> {
        let Some(value) = self.extensions.get(EXTENSION_DELETION_TIMESTAMP) else {
            return Ok(None);
        };
        let ExtensionValue::String(raw) = value else {
            return Err(CodecError::MalformedExtension {
                name: EXTENSION_DELETION_TIMESTAMP.to_string(),
                reason: format!("expected timestamp string, got {value:?}"),
            });
        };
        DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| CodecError::MalformedExtension {
                name: EXTENSION_DELETION_TIMESTAMP.to_string(),
                reason: e.to_string(),
            })
    }

    /// Serialize a value as the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn set_json_data<D: Serialize>(&mut self, data: &D) -> Result<(), CodecError> {
        let value = serde_json::to_value(data).map_err(|e| CodecError::Payload(e.to_string()))?;
        self.data = Some(value);
        self.data_content_type = Some(APPLICATION_JSON.to_string());
        Ok(())
    }

    /// Deserialize the JSON payload. A missing payload decodes as `null`.
    ///
    /// # Errors
    ///
    /// Returns error if the payload does not match `D`.
    pub fn data_as<D: DeserializeOwned>(&self) -> Result<D, CodecError> {
        let value = self.data.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|e| CodecError::Payload(e.to_string()))
    }
}

/// Builder assembling an envelope from resource identity.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    envelope: Envelope,
}

impl EventBuilder {
    /// Start a new envelope for the given source and type.
    #[must_use]
    pub fn new(source: impl Into<String>, event_type: &EventType) -> Self {
        Self {
            envelope: Envelope::new(source, event_type),
        }
    }

    /// Set the `resourceid` extension.
    #[must_use]
    pub fn with_resource_id(mut self, resource_id: &str) -> Self {
        self.envelope
            .set_extension(EXTENSION_RESOURCE_ID, resource_id);
        self
    }

    /// Set the `resourceversion` extension.
    #[must_use]
    pub fn with_resource_version(mut self, version: i64) -> Self {
        self.envelope
            .set_extension(EXTENSION_RESOURCE_VERSION, version);
        self
    }

    /// Set the `clustername` extension.
    #[must_use]
    pub fn with_cluster_name(mut self, cluster_name: &str) -> Self {
        self.envelope
            .set_extension(EXTENSION_CLUSTER_NAME, cluster_name);
        self
    }

    /// Set the `originalsource` extension.
    #[must_use]
    pub fn with_original_source(mut self, original_source: &str) -> Self {
        self.envelope
            .set_extension(EXTENSION_ORIGINAL_SOURCE, original_source);
        self
    }

    /// Mark the envelope as a delete intent.
    #[must_use]
    pub fn with_deletion_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.envelope
            .set_extension(EXTENSION_DELETION_TIMESTAMP, timestamp.to_rfc3339());
        self
    }

    /// Finish the envelope.
    #[must_use]
    pub fn build(self) -> Envelope {
        self.envelope
    }
}
