//! Manifest resources and their codec.

use chrono::{DateTime, Utc};
use clustersync_core::{
    json_sha256, Codec, CodecError, DataType, Envelope, EventBuilder, EventType, HashError,
    ResourceObject, SubResource, EXTENSION_CLUSTER_NAME, EXTENSION_ORIGINAL_SOURCE,
    EXTENSION_RESOURCE_ID, EXTENSION_RESOURCE_VERSION,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// API group of manifests.
pub const MANIFEST_GROUP: &str = "io.clustersync.works";

/// API version of manifests.
pub const MANIFEST_VERSION: &str = "v1";

/// Plural resource name of manifests.
pub const MANIFEST_RESOURCE: &str = "manifests";

/// Action for a newly created resource.
pub const CREATE_REQUEST_ACTION: &str = "create_request";

/// Action for a changed resource.
pub const UPDATE_REQUEST_ACTION: &str = "update_request";

/// Action for a resource being deleted.
pub const DELETE_REQUEST_ACTION: &str = "delete_request";

/// The manifest data type.
#[must_use]
pub fn manifest_data_type() -> DataType {
    DataType::new(MANIFEST_GROUP, MANIFEST_VERSION, MANIFEST_RESOURCE)
}

/// A manifest assigned to one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResource {
    /// Resource id
    pub id: String,
    /// Cluster the manifest is for
    pub cluster_name: String,
    /// Spec version
    pub version: i64,
    /// Desired state
    pub spec: Value,
    /// Observed state
    pub status: Value,
    /// Set once deletion was requested
    pub deleted_at: Option<DateTime<Utc>>,
    /// Source that owns the manifest
    pub original_source: Option<String>,
}

impl ManifestResource {
    /// A live manifest with empty status.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        cluster_name: impl Into<String>,
        version: i64,
        spec: Value,
    ) -> Self {
        Self {
            id: id.into(),
            cluster_name: cluster_name.into(),
            version,
            spec,
            status: Value::Null,
            deleted_at: None,
            original_source: None,
        }
    }

    /// Whether deletion was requested.
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl ResourceObject for ManifestResource {
    fn resource_id(&self) -> &str {
        &self.id
    }

    fn resource_version(&self) -> i64 {
        self.version
    }

    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn deletion_timestamp(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn original_source(&self) -> Option<&str> {
        self.original_source.as_deref()
    }
}

/// Codec for [`ManifestResource`].
///
/// Spec events carry the spec; status events carry the status. Delete
/// events carry no payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestCodec;

impl Codec<ManifestResource> for ManifestCodec {
    fn event_data_type(&self) -> DataType {
        manifest_data_type()
    }

    fn encode(
        &self,
        source: &str,
        event_type: &EventType,
        manifest: &ManifestResource,
    ) -> Result<Envelope, CodecError> {
        self.check_data_type(event_type)?;

        let builder = EventBuilder::new(source, event_type)
            .with_resource_id(&manifest.id)
            .with_resource_version(manifest.version)
            .with_cluster_name(&manifest.cluster_name);

        if let Some(deleted_at) = manifest.deleted_at {
            return Ok(builder.with_deletion_timestamp(deleted_at).build());
        }

        let mut envelope = builder.build();
        match event_type.sub_resource {
            SubResource::Spec => envelope.set_json_data(&manifest.spec)?,
            SubResource::Status => envelope.set_json_data(&manifest.status)?,
        }
        Ok(envelope)
    }

    fn decode(&self, envelope: &Envelope) -> Result<ManifestResource, CodecError> {
        let event_type = envelope.parsed_type()?;
        self.check_data_type(&event_type)?;

        let mut manifest = ManifestResource::new(
            envelope.required_string(EXTENSION_RESOURCE_ID)?,
            envelope.required_string(EXTENSION_CLUSTER_NAME)?,
            envelope.required_integer(EXTENSION_RESOURCE_VERSION)?,
            Value::Null,
        );
        manifest.deleted_at = envelope.deletion_timestamp()?;

        let original_source = envelope.extension_str(EXTENSION_ORIGINAL_SOURCE);
        match event_type.sub_resource {
            SubResource::Spec => {
                manifest.spec = envelope.data_as()?;
                manifest.original_source =
                    Some(original_source.unwrap_or(&envelope.source).to_string());
            }
            SubResource::Status => {
                manifest.status = envelope.data_as()?;
                manifest.original_source = original_source.map(str::to_string);
            }
        }

        Ok(manifest)
    }
}

/// Hex SHA-256 of the manifest's status JSON.
///
/// # Errors
///
/// Returns error if the status cannot be serialized.
pub fn manifest_status_hash(manifest: &ManifestResource) -> Result<String, HashError> {
    json_sha256(&manifest.status)
}
