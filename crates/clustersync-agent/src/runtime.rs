//! Runtime orchestration.
//!
//! A session connects the configured transport, builds a client, subscribes
//! and requests an initial resync. A session ends on shutdown or when the
//! connection supervisor reports the connection lost; in the latter case a
//! fresh session is started after the reconnect delay.

use crate::config::{RoleKind, RuntimeConfig, TransportConfig};
use crate::manifest::{
    manifest_data_type, manifest_status_hash, ManifestCodec, ManifestResource,
    CREATE_REQUEST_ACTION, DELETE_REQUEST_ACTION, UPDATE_REQUEST_ACTION,
};
use crate::persistence::SqliteStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use clustersync_client::{ClientBuilder, CloudEventsClient, EventHandler, HandlerError, Role};
use clustersync_core::{
    AddressResolver, EventType, ListOptions, Lister, ResourceAction, SubResource, Transport,
    TransportError,
};
use clustersync_grpc::ConnectionSupervisor;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

type ManifestClient = CloudEventsClient<ManifestResource>;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Lost,
}

/// The reference runtime.
pub struct Runtime {
    config: RuntimeConfig,
    store: Arc<SqliteStore>,
}

impl Runtime {
    /// Create a runtime and open its store.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.db_path).context("Failed to open SQLite database")?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Create a runtime over an existing store.
    #[must_use]
    pub fn with_store(config: RuntimeConfig, store: Arc<SqliteStore>) -> Self {
        Self { config, store }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Run until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns error if the transport configuration cannot be loaded.
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
            }
            signal.cancel();
        });

        self.run_until(shutdown).await
    }

    /// Run sessions until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns error if the transport configuration cannot be loaded.
    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<()> {
        let transport = self.config.load_transport()?;
        let role = self.config.client_role()?;

        tracing::info!(
            role = role.identity(),
            db_path = %self.config.db_path.display(),
            "Runtime started"
        );

        loop {
            match self.run_session(&transport, &role, &shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Lost) => {
                    tracing::warn!(
                        delay_secs = self.config.reconnect_delay.as_secs(),
                        "Connection lost, reconnecting"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        error = %format!("{err:#}"),
                        delay_secs = self.config.reconnect_delay.as_secs(),
                        "Session failed, retrying"
                    );
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        tracing::info!("Runtime stopped");
        Ok(())
    }

    async fn run_session(
        &self,
        transport: &TransportConfig,
        role: &Role,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd> {
        let cancel = shutdown.child_token();
        let (lost_tx, lost_rx) = oneshot::channel::<TransportError>();
        let (client, supervisor) = self
            .connect(transport, role, cancel.clone(), lost_tx)
            .await?;

        let handler = StoreHandler {
            store: Arc::clone(&self.store),
            role: self.config.role,
            reporter: (self.config.role == RoleKind::Agent).then(|| client.clone()),
        };
        let subscription = client
            .subscribe(handler)
            .await
            .context("Failed to subscribe")?;

        if let Err(err) = client.resync(&ListOptions::all()).await {
            tracing::warn!(error = %err, "Initial resync request failed");
        }

        let publisher = (self.config.role == RoleKind::Source).then(|| {
            tokio::spawn(publish_loop(
                client.clone(),
                Arc::clone(&self.store),
                self.config.poll_interval,
                cancel.clone(),
            ))
        });

        tracing::info!("Session established");

        let end = tokio::select! {
            () = shutdown.cancelled() => SessionEnd::Shutdown,
            err = wait_lost(lost_rx) => {
                tracing::warn!(error = %err, "Transport reported connection loss");
                SessionEnd::Lost
            }
        };

        cancel.cancel();
        client.close().await;
        subscription.join().await;
        if let Some(publisher) = publisher {
            if let Err(err) = publisher.await {
                tracing::error!(error = %err, "Publish loop failed");
            }
        }
        if let Some(supervisor) = supervisor {
            supervisor.stop();
            let outcome = supervisor.join().await;
            tracing::debug!(?outcome, "Supervisor stopped");
        }

        Ok(end)
    }

    async fn connect(
        &self,
        transport: &TransportConfig,
        role: &Role,
        cancel: CancellationToken,
        lost: oneshot::Sender<TransportError>,
    ) -> Result<(ManifestClient, Option<ConnectionSupervisor>)> {
        let on_error = move |err: TransportError| {
            let _ = lost.send(err);
        };

        match (transport, role) {
            (TransportConfig::Mqtt(options), Role::Source { source_id }) => {
                let (resolver, transport) = clustersync_mqtt::connect_source(
                    options,
                    &self.config.client_id,
                    source_id,
                    cancel.clone(),
                )
                .await
                .context("Failed to connect to MQTT broker")?;
                Ok((self.build_client(role, transport, resolver, cancel)?, None))
            }
            (TransportConfig::Mqtt(options), Role::Agent { cluster_name }) => {
                let (resolver, transport) = clustersync_mqtt::connect_agent(
                    options,
                    &self.config.client_id,
                    cluster_name,
                    cancel.clone(),
                )
                .await
                .context("Failed to connect to MQTT broker")?;
                Ok((self.build_client(role, transport, resolver, cancel)?, None))
            }
            (TransportConfig::Grpc(options), Role::Source { source_id }) => {
                let (resolver, transport, supervisor) = clustersync_grpc::connect_source(
                    options,
                    source_id,
                    &manifest_data_type(),
                    cancel.clone(),
                    on_error,
                )
                .await
                .context("Failed to connect to gRPC server")?;
                let client = self.build_client(role, transport, resolver, cancel)?;
                Ok((client, Some(supervisor)))
            }
            (TransportConfig::Grpc(options), Role::Agent { cluster_name }) => {
                let (resolver, transport, supervisor) = clustersync_grpc::connect_agent(
                    options,
                    cluster_name,
                    &manifest_data_type(),
                    cancel.clone(),
                    on_error,
                )
                .await
                .context("Failed to connect to gRPC server")?;
                let client = self.build_client(role, transport, resolver, cancel)?;
                Ok((client, Some(supervisor)))
            }
        }
    }

    fn build_client(
        &self,
        role: &Role,
        transport: impl Transport + 'static,
        resolver: impl AddressResolver + 'static,
        cancel: CancellationToken,
    ) -> Result<ManifestClient> {
        let lister: Arc<dyn Lister<ManifestResource>> = Arc::clone(&self.store) as _;
        let client = ClientBuilder::new(role.clone())
            .transport(transport)
            .resolver(resolver)
            .codec(ManifestCodec)
            .lister(lister)
            .status_hasher(manifest_status_hash)
            .cancel(cancel)
            .build()?;
        Ok(client)
    }
}

/// Resolves when the supervisor reports a loss. A dropped sender means the
/// transport has no supervisor, so this never resolves.
async fn wait_lost(lost: oneshot::Receiver<TransportError>) -> TransportError {
    match lost.await {
        Ok(err) => err,
        Err(_) => std::future::pending().await,
    }
}

/// Publish manifests whose version is ahead of what was last published.
async fn publish_loop(
    client: ManifestClient,
    store: Arc<SqliteStore>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(err) = publish_pending(&client, &store).await {
            tracing::warn!(error = %err, "Publishing pending manifests failed");
        }
    }
    tracing::debug!("Publish loop stopped");
}

/// Publish every pending manifest, stopping at the first failure.
///
/// Returns how many were published.
///
/// # Errors
///
/// Returns error if the store cannot be read or a publish fails.
pub async fn publish_pending(client: &ManifestClient, store: &SqliteStore) -> Result<usize> {
    let pending = store.pending().context("Failed to read pending manifests")?;
    let mut published = 0;

    for (manifest, published_version) in pending {
        let action = if manifest.is_deleting() {
            DELETE_REQUEST_ACTION
        } else if published_version == 0 {
            CREATE_REQUEST_ACTION
        } else {
            UPDATE_REQUEST_ACTION
        };
        let event_type = EventType::new(manifest_data_type(), SubResource::Spec, action);

        client
            .publish(&event_type, &manifest)
            .await
            .with_context(|| format!("Failed to publish manifest {}", manifest.id))?;
        store
            .mark_published(&manifest.id, &manifest.cluster_name, manifest.version)
            .context("Failed to record published version")?;

        tracing::info!(
            resource_id = %manifest.id,
            cluster_name = %manifest.cluster_name,
            version = manifest.version,
            action,
            "Published manifest"
        );
        published += 1;
    }

    Ok(published)
}

/// Applies inbound manifests to the store.
///
/// A source records reported status and forgets manifests whose deletion
/// the agent confirmed. An agent stores specs and reports back an
/// `Applied` status through `reporter`.
pub struct StoreHandler {
    store: Arc<SqliteStore>,
    role: RoleKind,
    reporter: Option<ManifestClient>,
}

impl StoreHandler {
    /// Handler for a source.
    #[must_use]
    pub fn source(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            role: RoleKind::Source,
            reporter: None,
        }
    }

    /// Handler for an agent, reporting status through `reporter`.
    #[must_use]
    pub fn agent(store: Arc<SqliteStore>, reporter: ManifestClient) -> Self {
        Self {
            store,
            role: RoleKind::Agent,
            reporter: Some(reporter),
        }
    }

    fn on_status(&self, action: ResourceAction, manifest: &ManifestResource) -> Result<(), HandlerError> {
        if action == ResourceAction::Deleted {
            let removed = self
                .store
                .forget(&manifest.id, &manifest.cluster_name, manifest.version)
                .map_err(|e| HandlerError(e.to_string()))?;
            tracing::info!(
                resource_id = %manifest.id,
                cluster_name = %manifest.cluster_name,
                removed,
                "Agent confirmed deletion"
            );
            return Ok(());
        }

        let known = self
            .store
            .update_status(&manifest.id, &manifest.cluster_name, &manifest.status)
            .map_err(|e| HandlerError(e.to_string()))?;
        if !known {
            tracing::warn!(
                resource_id = %manifest.id,
                cluster_name = %manifest.cluster_name,
                "Status for unknown manifest"
            );
        }
        Ok(())
    }

    async fn on_spec(
        &self,
        action: ResourceAction,
        mut manifest: ManifestResource,
    ) -> Result<(), HandlerError> {
        let report_action = match action {
            ResourceAction::Added | ResourceAction::Modified => {
                manifest.status = json!({
                    "phase": "Applied",
                    "observedVersion": manifest.version,
                });
                self.store
                    .upsert(&manifest)
                    .and_then(|()| {
                        self.store.update_status(
                            &manifest.id,
                            &manifest.cluster_name,
                            &manifest.status,
                        )
                    })
                    .map_err(|e| HandlerError(e.to_string()))?;
                UPDATE_REQUEST_ACTION
            }
            ResourceAction::Deleted => {
                self.store
                    .delete(&manifest.id, &manifest.cluster_name)
                    .map_err(|e| HandlerError(e.to_string()))?;
                DELETE_REQUEST_ACTION
            }
            ResourceAction::StatusModified => return Ok(()),
        };

        tracing::info!(
            resource_id = %manifest.id,
            cluster_name = %manifest.cluster_name,
            version = manifest.version,
            ?action,
            "Applied manifest"
        );

        if let Some(reporter) = &self.reporter {
            let event_type =
                EventType::new(manifest_data_type(), SubResource::Status, report_action);
            // status is re-sent on the next resync if this fails
            if let Err(err) = reporter.publish(&event_type, &manifest).await {
                tracing::warn!(
                    error = %err,
                    resource_id = %manifest.id,
                    "Failed to report status"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<ManifestResource> for StoreHandler {
    async fn handle(
        &self,
        action: ResourceAction,
        manifest: ManifestResource,
    ) -> Result<(), HandlerError> {
        match self.role {
            RoleKind::Source => self.on_status(action, &manifest),
            RoleKind::Agent => self.on_spec(action, manifest).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clustersync_client::Delivery;
    use clustersync_core::{AddressError, Envelope, EnvelopeStream, EventMetadata};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<(String, Envelope)>>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, address: &str, envelope: &Envelope) -> Result<(), TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push((address.to_string(), envelope.clone()));
            Ok(())
        }

        async fn subscribe(&self) -> Result<EnvelopeStream, TransportError> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(rx)
        }

        async fn close(&self) {}
    }

    struct FlatResolver;

    impl AddressResolver for FlatResolver {
        fn resolve(&self, metadata: &EventMetadata) -> Result<String, AddressError> {
            Ok(format!(
                "{}/{}",
                metadata.cluster_name.as_deref().unwrap_or("-"),
                metadata.event_type
            ))
        }
    }

    fn client(role: Role, store: &Arc<SqliteStore>, transport: &RecordingTransport) -> ManifestClient {
        let lister: Arc<dyn Lister<ManifestResource>> = Arc::clone(store) as _;
        ClientBuilder::new(role)
            .transport(transport.clone())
            .resolver(FlatResolver)
            .codec(ManifestCodec)
            .lister(lister)
            .status_hasher(manifest_status_hash)
            .build()
            .unwrap()
    }

    /// Deliver everything `from` has sent so far to `to`.
    async fn relay(
        from: &RecordingTransport,
        to: &ManifestClient,
        handler: &StoreHandler,
    ) -> Vec<Delivery> {
        let envelopes: Vec<Envelope> = from
            .sent
            .lock()
            .unwrap()
            .drain(..)
            .map(|(_, envelope)| envelope)
            .collect();
        let mut deliveries = Vec::new();
        for envelope in &envelopes {
            deliveries.push(to.deliver(envelope, handler).await.unwrap());
        }
        deliveries
    }

    #[tokio::test]
    async fn recreate_after_confirmed_delete_reaches_agent() {
        let source_store = Arc::new(SqliteStore::in_memory().unwrap());
        let source_wire = RecordingTransport::default();
        let source = client(Role::source("hub1"), &source_store, &source_wire);
        let source_handler = StoreHandler::source(Arc::clone(&source_store));

        let agent_store = Arc::new(SqliteStore::in_memory().unwrap());
        let agent_wire = RecordingTransport::default();
        let agent = client(Role::agent("c1"), &agent_store, &agent_wire);
        let agent_handler = StoreHandler::agent(Arc::clone(&agent_store), agent.clone());

        let added = Delivery::Dispatched(ResourceAction::Added);
        let deleted = Delivery::Dispatched(ResourceAction::Deleted);

        // create
        source_store.apply_spec("m1", "c1", &json!({"a": 1})).unwrap();
        publish_pending(&source, &source_store).await.unwrap();
        assert_eq!(relay(&source_wire, &agent, &agent_handler).await, vec![added]);
        assert_eq!(relay(&agent_wire, &source, &source_handler).await, vec![added]);

        // delete and confirm
        source_store.mark_deleted("m1", "c1").unwrap();
        publish_pending(&source, &source_store).await.unwrap();
        assert_eq!(relay(&source_wire, &agent, &agent_handler).await, vec![deleted]);
        assert_eq!(relay(&agent_wire, &source, &source_handler).await, vec![deleted]);
        assert!(source_store.get("m1", "c1").unwrap().is_none());
        assert!(agent_store.get("m1", "c1").unwrap().is_none());

        // re-create
        assert_eq!(source_store.apply_spec("m1", "c1", &json!({"a": 1})).unwrap(), 3);
        publish_pending(&source, &source_store).await.unwrap();
        assert_eq!(relay(&source_wire, &agent, &agent_handler).await, vec![added]);
        assert_eq!(agent_store.get("m1", "c1").unwrap().unwrap().version, 3);

        assert_eq!(relay(&agent_wire, &source, &source_handler).await, vec![added]);
        assert_eq!(
            source_store.get("m1", "c1").unwrap().unwrap().status["observedVersion"],
            3
        );
    }

    #[tokio::test]
    async fn source_publishes_pending_once() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let transport = RecordingTransport::default();
        let client = client(Role::source("hub1"), &store, &transport);

        store.apply_spec("m1", "c1", &json!({"a": 1})).unwrap();
        assert_eq!(publish_pending(&client, &store).await.unwrap(), 1);
        assert_eq!(publish_pending(&client, &store).await.unwrap(), 0);

        store.apply_spec("m1", "c1", &json!({"a": 2})).unwrap();
        store.mark_deleted("m1", "c1").unwrap();
        assert_eq!(publish_pending(&client, &store).await.unwrap(), 1);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.event_type.ends_with(".spec.create_request"));
        assert!(sent[1].1.event_type.ends_with(".spec.delete_request"));
        assert!(sent[1].1.data.is_none());
    }

    #[tokio::test]
    async fn agent_applies_and_reports() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let transport = RecordingTransport::default();
        let reporter = client(Role::agent("c1"), &store, &transport);
        let handler = StoreHandler::agent(Arc::clone(&store), reporter);

        let mut manifest = ManifestResource::new("m1", "c1", 2, json!({"a": 1}));
        manifest.original_source = Some("hub1".to_string());
        handler
            .handle(ResourceAction::Added, manifest.clone())
            .await
            .unwrap();

        let stored = store.get("m1", "c1").unwrap().unwrap();
        assert_eq!(stored.status["phase"], "Applied");
        assert_eq!(stored.status["observedVersion"], 2);

        manifest.deleted_at = Some(Utc::now());
        handler
            .handle(ResourceAction::Deleted, manifest)
            .await
            .unwrap();
        assert!(store.get("m1", "c1").unwrap().is_none());

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.event_type.ends_with(".status.update_request"));
        assert_eq!(sent[0].1.data, Some(json!({"phase": "Applied", "observedVersion": 2})));
        assert!(sent[1].1.event_type.ends_with(".status.delete_request"));
    }

    #[tokio::test]
    async fn source_records_status_and_confirmed_deletes() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.apply_spec("m1", "c1", &json!({})).unwrap();
        let handler = StoreHandler::source(Arc::clone(&store));

        let mut reported = ManifestResource::new("m1", "c1", 1, json!(null));
        reported.status = json!({"phase": "Applied"});
        handler
            .handle(ResourceAction::Added, reported.clone())
            .await
            .unwrap();
        assert_eq!(
            store.get("m1", "c1").unwrap().unwrap().status,
            json!({"phase": "Applied"})
        );

        reported.deleted_at = Some(Utc::now());
        handler
            .handle(ResourceAction::Deleted, reported)
            .await
            .unwrap();
        assert!(store.get("m1", "c1").unwrap().is_none());
    }
}
