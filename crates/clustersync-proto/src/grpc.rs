//! Protobuf messages for the `io.cloudevents.v1.CloudEventService` stream.
//!
//! ```proto
//! service CloudEventService {
//!   rpc Publish(PublishRequest) returns (google.protobuf.Empty);
//!   rpc Subscribe(SubscriptionRequest) returns (stream CloudEvent);
//! }
//! ```

use crate::WireError;
use chrono::{DateTime, TimeZone, Utc};
use clustersync_core::{Envelope, ExtensionValue, APPLICATION_JSON};
use std::collections::HashMap;

/// Full path of the unary publish method.
pub const PUBLISH_PATH: &str = "/io.cloudevents.v1.CloudEventService/Publish";

/// Full path of the server-streaming subscribe method.
pub const SUBSCRIBE_PATH: &str = "/io.cloudevents.v1.CloudEventService/Subscribe";

const ATTR_TIME: &str = "time";
const ATTR_DATA_CONTENT_TYPE: &str = "datacontenttype";

/// Protobuf CloudEvent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloudEvent {
    /// Event identifier
    #[prost(string, tag = "1")]
    pub id: String,
    /// Publishing client
    #[prost(string, tag = "2")]
    pub source: String,
    /// CloudEvents spec version
    #[prost(string, tag = "3")]
    pub spec_version: String,
    /// Structured type string
    #[prost(string, tag = "4")]
    pub r#type: String,
    /// Optional and extension attributes
    #[prost(map = "string, message", tag = "5")]
    pub attributes: HashMap<String, CloudEventAttributeValue>,
    /// Payload
    #[prost(oneof = "cloud_event::Data", tags = "6, 7")]
    pub data: Option<cloud_event::Data>,
}

/// Nested types of [`CloudEvent`].
pub mod cloud_event {
    /// Payload variants.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Data {
        /// Binary payload
        #[prost(bytes, tag = "6")]
        BinaryData(Vec<u8>),
        /// Text payload
        #[prost(string, tag = "7")]
        TextData(String),
    }
}

/// Typed attribute value.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloudEventAttributeValue {
    /// The value
    #[prost(oneof = "cloud_event_attribute_value::Attr", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub attr: Option<cloud_event_attribute_value::Attr>,
}

/// Nested types of [`CloudEventAttributeValue`].
pub mod cloud_event_attribute_value {
    /// Attribute variants.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Attr {
        /// Boolean
        #[prost(bool, tag = "1")]
        CeBoolean(bool),
        /// 32-bit integer
        #[prost(int32, tag = "2")]
        CeInteger(i32),
        /// String
        #[prost(string, tag = "3")]
        CeString(String),
        /// Bytes
        #[prost(bytes, tag = "4")]
        CeBytes(Vec<u8>),
        /// Absolute URI
        #[prost(string, tag = "5")]
        CeUri(String),
        /// URI reference
        #[prost(string, tag = "6")]
        CeUriRef(String),
        /// Timestamp
        #[prost(message, tag = "7")]
        CeTimestamp(::prost_types::Timestamp),
    }
}

/// Publish request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublishRequest {
    /// Channel the event is published to
    #[prost(string, tag = "1")]
    pub topic: String,
    /// The event
    #[prost(message, optional, tag = "2")]
    pub event: Option<CloudEvent>,
}

/// Subscription request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionRequest {
    /// Source identity, set by sources
    #[prost(string, tag = "1")]
    pub source: String,
    /// Cluster name, set by agents
    #[prost(string, tag = "2")]
    pub cluster_name: String,
    /// Data type filter
    #[prost(string, tag = "3")]
    pub data_type: String,
}

fn attr(value: cloud_event_attribute_value::Attr) -> CloudEventAttributeValue {
    CloudEventAttributeValue { attr: Some(value) }
}

fn to_proto_timestamp(time: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: i32::try_from(time.timestamp_subsec_nanos()).unwrap_or(0),
    }
}

fn from_proto_timestamp(ts: &prost_types::Timestamp) -> Result<DateTime<Utc>, WireError> {
    let nanos = u32::try_from(ts.nanos)
        .map_err(|_| WireError::Attribute(format!("negative nanos in timestamp {ts:?}")))?;
    Utc.timestamp_opt(ts.seconds, nanos)
        .single()
        .ok_or_else(|| WireError::Attribute(format!("timestamp out of range {ts:?}")))
}

impl From<&Envelope> for CloudEvent {
    fn from(envelope: &Envelope) -> Self {
        use cloud_event_attribute_value::Attr;

        let mut attributes = HashMap::new();
        if let Some(time) = envelope.time {
            attributes.insert(
                ATTR_TIME.to_string(),
                attr(Attr::CeTimestamp(to_proto_timestamp(time))),
            );
        }
        if let Some(content_type) = &envelope.data_content_type {
            attributes.insert(
                ATTR_DATA_CONTENT_TYPE.to_string(),
                attr(Attr::CeString(content_type.clone())),
            );
        }
        for (name, value) in &envelope.extensions {
            let value = match value {
                ExtensionValue::Boolean(b) => Attr::CeBoolean(*b),
                ExtensionValue::Integer(i) => match i32::try_from(*i) {
                    Ok(small) => Attr::CeInteger(small),
                    Err(_) => Attr::CeString(i.to_string()),
                },
                ExtensionValue::String(s) => Attr::CeString(s.clone()),
            };
            attributes.insert(name.clone(), attr(value));
        }

        let data = envelope
            .data
            .as_ref()
            .map(|value| cloud_event::Data::BinaryData(value.to_string().into_bytes()));

        Self {
            id: envelope.id.clone(),
            source: envelope.source.clone(),
            spec_version: envelope.spec_version.clone(),
            r#type: envelope.event_type.clone(),
            attributes,
            data,
        }
    }
}

impl TryFrom<CloudEvent> for Envelope {
    type Error = WireError;

    fn try_from(event: CloudEvent) -> Result<Self, Self::Error> {
        use cloud_event_attribute_value::Attr;

        let mut envelope = Envelope {
            spec_version: event.spec_version,
            id: event.id,
            source: event.source,
            event_type: event.r#type,
            time: None,
            data_content_type: None,
            data: None,
            extensions: Default::default(),
        };

        for (name, value) in event.attributes {
            let Some(value) = value.attr else { continue };
            match (name.as_str(), value) {
                (ATTR_TIME, Attr::CeTimestamp(ts)) => envelope.time = Some(from_proto_timestamp(&ts)?),
                (ATTR_TIME, Attr::CeString(raw)) => {
                    let time = DateTime::parse_from_rfc3339(&raw)
                        .map_err(|e| WireError::Attribute(format!("time '{raw}': {e}")))?;
                    envelope.time = Some(time.with_timezone(&Utc));
                }
                (ATTR_DATA_CONTENT_TYPE, Attr::CeString(content_type)) => {
                    envelope.data_content_type = Some(content_type);
                }
                (_, Attr::CeBoolean(b)) => envelope.set_extension(&name, b),
                (_, Attr::CeInteger(i)) => envelope.set_extension(&name, i64::from(i)),
                (_, Attr::CeString(s) | Attr::CeUri(s) | Attr::CeUriRef(s)) => {
                    envelope.set_extension(&name, s);
                }
                (_, Attr::CeTimestamp(ts)) => {
                    envelope.set_extension(&name, from_proto_timestamp(&ts)?.to_rfc3339());
                }
                (_, Attr::CeBytes(_)) => {
                    return Err(WireError::Attribute(format!(
                        "unsupported bytes attribute '{name}'"
                    )));
                }
            }
        }

        let payload = match event.data {
            None => None,
            Some(cloud_event::Data::BinaryData(bytes)) if bytes.is_empty() => None,
            Some(cloud_event::Data::BinaryData(bytes)) => Some(
                serde_json::from_slice(&bytes).map_err(|e| WireError::Deserialize(e.to_string()))?,
            ),
            Some(cloud_event::Data::TextData(text)) if text.is_empty() => None,
            Some(cloud_event::Data::TextData(text)) => Some(
                serde_json::from_str(&text).map_err(|e| WireError::Deserialize(e.to_string()))?,
            ),
        };
        if payload.is_some() && envelope.data_content_type.is_none() {
            envelope.data_content_type = Some(APPLICATION_JSON.to_string());
        }
        envelope.data = payload;

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clustersync_core::{DataType, EventBuilder, EventType, SubResource};
    use prost::Message;

    fn envelope() -> Envelope {
        let t = EventType::new(
            DataType::new("io.clustersync.works", "v1", "manifests"),
            SubResource::Status,
            "update_request",
        );
        let mut envelope = EventBuilder::new("agent-1", &t)
            .with_resource_id("r1")
            .with_resource_version(5_000_000_000)
            .with_cluster_name("cluster1")
            .with_original_source("hub1")
            .build();
        envelope
            .set_json_data(&serde_json::json!({"conditions": [{"type": "Applied"}]}))
            .unwrap();
        envelope
    }

    #[test]
    fn protobuf_bytes_roundtrip() {
        let original = envelope();
        let bytes = CloudEvent::from(&original).encode_to_vec();
        let decoded = Envelope::try_from(CloudEvent::decode(bytes.as_slice()).unwrap()).unwrap();

        assert_eq!(decoded.event_type, original.event_type);
        assert_eq!(decoded.data, original.data);
        assert_eq!(decoded.extension_str("clustername"), Some("cluster1"));
        assert_eq!(decoded.required_integer("resourceversion").unwrap(), 5_000_000_000);
        assert_eq!(
            decoded.time.map(|t| t.timestamp_micros()),
            original.time.map(|t| t.timestamp_micros())
        );
    }

    #[test]
    fn text_data_and_small_integers() {
        let mut event = CloudEvent::from(&envelope());
        event.data = Some(cloud_event::Data::TextData(r#"{"a":1}"#.to_string()));
        event.attributes.insert(
            "resourceversion".to_string(),
            attr(cloud_event_attribute_value::Attr::CeInteger(7)),
        );

        let decoded = Envelope::try_from(event).unwrap();
        assert_eq!(decoded.data, Some(serde_json::json!({"a": 1})));
        assert_eq!(decoded.required_integer("resourceversion").unwrap(), 7);
    }

    #[test]
    fn payload_without_content_type_is_json() {
        let mut event = CloudEvent::from(&envelope());
        event.attributes.remove(ATTR_DATA_CONTENT_TYPE);

        let decoded = Envelope::try_from(event).unwrap();
        assert_eq!(decoded.data_content_type.as_deref(), Some(APPLICATION_JSON));
        assert_eq!(decoded.spec_version, clustersync_core::SPEC_VERSION);
    }

    #[test]
    fn reject_bytes_attribute() {
        let mut event = CloudEvent::from(&envelope());
        event.attributes.insert(
            "blob".to_string(),
            attr(cloud_event_attribute_value::Attr::CeBytes(vec![1, 2])),
        );
        assert!(matches!(
            Envelope::try_from(event),
            Err(WireError::Attribute(_))
        ));
    }
}
