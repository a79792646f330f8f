//! Topic resolution for sources and agents.

use clustersync_core::{
    AddressError, AddressResolver, EventMetadata, SubResource, CLUSTER_ALL, SOURCE_ALL,
};
use clustersync_proto::topics::{fill_last, instantiate};
use clustersync_proto::Topics;

/// Resolves topics for events published by a source.
#[derive(Debug, Clone)]
pub struct MqttSourceResolver {
    topics: Topics,
    source_id: String,
}

impl MqttSourceResolver {
    /// Create a resolver for `source_id`.
    #[must_use]
    pub fn new(topics: Topics, source_id: impl Into<String>) -> Self {
        Self {
            topics,
            source_id: source_id.into(),
        }
    }
}

impl AddressResolver for MqttSourceResolver {
    fn resolve(&self, metadata: &EventMetadata) -> Result<String, AddressError> {
        let event_type = &metadata.event_type;
        let cluster_name = metadata
            .cluster_name
            .as_deref()
            .ok_or_else(|| AddressError::MissingClusterName(event_type.to_string()))?;

        let status_resync =
            event_type.sub_resource == SubResource::Status && event_type.is_resync_request();
        if status_resync && cluster_name == CLUSTER_ALL {
            // ask every agent for its status
            let broadcast = self
                .topics
                .source_broadcast
                .as_deref()
                .ok_or_else(|| AddressError::MissingBroadcastTopic(event_type.to_string()))?;
            return Ok(fill_last(broadcast, &self.source_id));
        }

        Ok(instantiate(
            &self.topics.source_events,
            cluster_name,
            &self.source_id,
        ))
    }
}

/// Resolves topics for events published by an agent.
#[derive(Debug, Clone)]
pub struct MqttAgentResolver {
    topics: Topics,
    cluster_name: String,
}

impl MqttAgentResolver {
    /// Create a resolver for the agent of `cluster_name`.
    #[must_use]
    pub fn new(topics: Topics, cluster_name: impl Into<String>) -> Self {
        Self {
            topics,
            cluster_name: cluster_name.into(),
        }
    }
}

impl AddressResolver for MqttAgentResolver {
    fn resolve(&self, metadata: &EventMetadata) -> Result<String, AddressError> {
        let event_type = &metadata.event_type;
        let original_source = metadata.original_source.as_deref();

        let spec_resync =
            event_type.sub_resource == SubResource::Spec && event_type.is_resync_request();
        if spec_resync && original_source == Some(SOURCE_ALL) {
            // ask every source for the spec of this cluster
            let broadcast = self
                .topics
                .agent_broadcast
                .as_deref()
                .ok_or_else(|| AddressError::MissingBroadcastTopic(event_type.to_string()))?;
            return Ok(fill_last(broadcast, &self.cluster_name));
        }

        let original_source = original_source
            .ok_or_else(|| AddressError::MissingOriginalSource(event_type.to_string()))?;
        Ok(instantiate(
            &self.topics.agent_events,
            &self.cluster_name,
            original_source,
        ))
    }
}
