//! Channel resolution for the gRPC broker.
//!
//! Channels use fixed templates; the first `+` is the source and the last
//! `+` is the cluster.

use clustersync_core::{
    AddressError, AddressResolver, EventMetadata, SubResource, CLUSTER_ALL, SOURCE_ALL,
};
use clustersync_proto::topics::{fill_first, fill_last, instantiate};

/// Spec events from a source to one cluster.
pub const SPEC_CHANNEL: &str = "sources/+/clusters/+/spec";

/// Status events from an agent back to a source.
pub const STATUS_CHANNEL: &str = "sources/+/clusters/+/status";

/// Spec resync requests from an agent to every source.
pub const SPEC_RESYNC_CHANNEL: &str = "sources/clusters/+/specresync";

/// Status resync requests from a source to every cluster.
pub const STATUS_RESYNC_CHANNEL: &str = "sources/+/clusters/statusresync";

/// Resolves channels for events published by a source.
#[derive(Debug, Clone)]
pub struct GrpcSourceResolver {
    source_id: String,
}

impl GrpcSourceResolver {
    /// Create a resolver for `source_id`.
    #[must_use]
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }
}

impl AddressResolver for GrpcSourceResolver {
    fn resolve(&self, metadata: &EventMetadata) -> Result<String, AddressError> {
        let event_type = &metadata.event_type;
        let cluster_name = metadata
            .cluster_name
            .as_deref()
            .ok_or_else(|| AddressError::MissingClusterName(event_type.to_string()))?;

        if event_type.sub_resource == SubResource::Status
            && event_type.is_resync_request()
            && cluster_name == CLUSTER_ALL
        {
            return Ok(fill_first(STATUS_RESYNC_CHANNEL, &self.source_id));
        }

        Ok(instantiate(SPEC_CHANNEL, cluster_name, &self.source_id))
    }
}

/// Resolves channels for events published by an agent.
#[derive(Debug, Clone)]
pub struct GrpcAgentResolver {
    cluster_name: String,
}

impl GrpcAgentResolver {
    /// Create a resolver for the agent of `cluster_name`.
    #[must_use]
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
        }
    }
}

impl AddressResolver for GrpcAgentResolver {
    fn resolve(&self, metadata: &EventMetadata) -> Result<String, AddressError> {
        let event_type = &metadata.event_type;
        let original_source = metadata.original_source.as_deref();

        if event_type.sub_resource == SubResource::Spec
            && event_type.is_resync_request()
            && original_source == Some(SOURCE_ALL)
        {
            return Ok(fill_last(SPEC_RESYNC_CHANNEL, &self.cluster_name));
        }

        let original_source = original_source
            .ok_or_else(|| AddressError::MissingOriginalSource(event_type.to_string()))?;
        Ok(instantiate(
            STATUS_CHANNEL,
            &self.cluster_name,
            original_source,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clustersync_core::{DataType, EventBuilder, EventType, RESYNC_REQUEST_ACTION};

    fn metadata(
        sub_resource: SubResource,
        action: &str,
        cluster: Option<&str>,
        original_source: Option<&str>,
    ) -> EventMetadata {
        let mut builder = EventBuilder::new(
            "source1",
            &EventType::new(
                DataType::new("resources.test", "v1", "mockresources"),
                sub_resource,
                action,
            ),
        );
        if let Some(cluster) = cluster {
            builder = builder.with_cluster_name(cluster);
        }
        if let Some(source) = original_source {
            builder = builder.with_original_source(source);
        }
        EventMetadata::from_envelope(&builder.build()).unwrap()
    }

    #[test]
    fn source_publishes_spec() {
        let resolver = GrpcSourceResolver::new("source1");
        let channel = resolver
            .resolve(&metadata(SubResource::Spec, "create_request", Some("cluster1"), None))
            .unwrap();
        assert_eq!(channel, "sources/source1/clusters/cluster1/spec");
    }

    #[test]
    fn source_resyncs_one_cluster() {
        let resolver = GrpcSourceResolver::new("source1");
        let channel = resolver
            .resolve(&metadata(
                SubResource::Status,
                RESYNC_REQUEST_ACTION,
                Some("cluster1"),
                None,
            ))
            .unwrap();
        assert_eq!(channel, "sources/source1/clusters/cluster1/spec");
    }

    #[test]
    fn source_resyncs_all_clusters() {
        let resolver = GrpcSourceResolver::new("source1");
        let channel = resolver
            .resolve(&metadata(
                SubResource::Status,
                RESYNC_REQUEST_ACTION,
                Some(CLUSTER_ALL),
                None,
            ))
            .unwrap();
        assert_eq!(channel, "sources/source1/clusters/statusresync");
    }

    #[test]
    fn source_requires_cluster() {
        let resolver = GrpcSourceResolver::new("source1");
        assert!(matches!(
            resolver.resolve(&metadata(SubResource::Spec, "create_request", None, None)),
            Err(AddressError::MissingClusterName(_))
        ));
    }

    #[test]
    fn agent_publishes_status() {
        let resolver = GrpcAgentResolver::new("cluster1");
        let channel = resolver
            .resolve(&metadata(
                SubResource::Status,
                "update_request",
                Some("cluster1"),
                Some("source1"),
            ))
            .unwrap();
        assert_eq!(channel, "sources/source1/clusters/cluster1/status");
    }

    #[test]
    fn agent_resyncs_from_all_sources() {
        let resolver = GrpcAgentResolver::new("cluster1");
        let channel = resolver
            .resolve(&metadata(
                SubResource::Spec,
                RESYNC_REQUEST_ACTION,
                Some("cluster1"),
                Some(SOURCE_ALL),
            ))
            .unwrap();
        assert_eq!(channel, "sources/clusters/cluster1/specresync");
    }

    #[test]
    fn agent_requires_original_source() {
        let resolver = GrpcAgentResolver::new("cluster1");
        assert!(matches!(
            resolver.resolve(&metadata(SubResource::Status, "update_request", None, None)),
            Err(AddressError::MissingOriginalSource(_))
        ));
    }
}
