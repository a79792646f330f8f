//! The generic client shared by sources and agents.

use crate::dedup::{DedupGate, ResourceKey, Update, Verdict};
use crate::error::ClientError;
use crate::handler::EventHandler;
use clustersync_core::{
    AddressResolver, Codec, CodecError, Envelope, EventMetadata, EventType, Lister,
    ResourceAction, ResourceObject, StatusHasher, SubResource, Transport, TransportError,
    EXTENSION_ORIGINAL_SOURCE,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Envelopes buffered between the receiver and dispatcher tasks.
pub const DISPATCH_CAPACITY: usize = 100;

/// Which side of the protocol a client plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Publishes spec, consumes status
    Source {
        /// Identity of this source
        source_id: String,
    },
    /// Publishes status, consumes spec
    Agent {
        /// Cluster served by this agent
        cluster_name: String,
    },
}

impl Role {
    /// A source role.
    #[must_use]
    pub fn source(source_id: impl Into<String>) -> Self {
        Self::Source {
            source_id: source_id.into(),
        }
    }

    /// An agent role.
    #[must_use]
    pub fn agent(cluster_name: impl Into<String>) -> Self {
        Self::Agent {
            cluster_name: cluster_name.into(),
        }
    }

    /// The `source` attribute of published events.
    #[must_use]
    pub fn identity(&self) -> &str {
        match self {
            Self::Source { source_id } => source_id,
            Self::Agent { cluster_name } => cluster_name,
        }
    }

    /// Sub-resource this role publishes.
    #[must_use]
    pub fn publishes(&self) -> SubResource {
        match self {
            Self::Source { .. } => SubResource::Spec,
            Self::Agent { .. } => SubResource::Status,
        }
    }

    /// Sub-resource this role consumes.
    #[must_use]
    pub fn consumes(&self) -> SubResource {
        match self {
            Self::Source { .. } => SubResource::Status,
            Self::Agent { .. } => SubResource::Spec,
        }
    }
}

/// Result of delivering one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handler ran with this action
    Dispatched(ResourceAction),
    /// Suppressed by the dedup gate
    Duplicate,
    /// Older than the accepted version; flagged and dropped
    Stale,
    /// Not for this role
    Ignored,
    /// Answered a resync request by republishing this many resources
    Resynced(usize),
}

pub(crate) struct Shared<T> {
    pub(crate) role: Role,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) resolver: Arc<dyn AddressResolver>,
    pub(crate) codec: Arc<dyn Codec<T>>,
    pub(crate) lister: Arc<dyn Lister<T>>,
    pub(crate) hasher: Option<Arc<dyn StatusHasher<T>>>,
    gate: Mutex<DedupGate>,
    cancel: CancellationToken,
}

/// Typed client over any transport.
///
/// Cheap to clone; clones share the transport and the dedup state.
pub struct CloudEventsClient<T> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T> Clone for CloudEventsClient<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Assembles a [`CloudEventsClient`].
pub struct ClientBuilder<T> {
    role: Role,
    transport: Option<Arc<dyn Transport>>,
    resolver: Option<Arc<dyn AddressResolver>>,
    codec: Option<Arc<dyn Codec<T>>>,
    lister: Option<Arc<dyn Lister<T>>>,
    hasher: Option<Arc<dyn StatusHasher<T>>>,
    cancel: CancellationToken,
}

impl<T: ResourceObject> ClientBuilder<T> {
    /// Start a builder for `role`.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            transport: None,
            resolver: None,
            codec: None,
            lister: None,
            hasher: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Transport used to send and receive.
    #[must_use]
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Address resolver matching the transport.
    #[must_use]
    pub fn resolver(mut self, resolver: impl AddressResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Codec for the resource kind.
    #[must_use]
    pub fn codec(mut self, codec: impl Codec<T> + 'static) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Lister answering resync requests.
    #[must_use]
    pub fn lister(mut self, lister: Arc<dyn Lister<T>>) -> Self {
        self.lister = Some(lister);
        self
    }

    /// Status hasher enabling duplicate suppression of status updates.
    #[must_use]
    pub fn status_hasher(mut self, hasher: impl StatusHasher<T> + 'static) -> Self {
        self.hasher = Some(Arc::new(hasher));
        self
    }

    /// Parent cancellation for every task the client starts.
    #[must_use]
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the transport, resolver, codec or
    /// lister is missing.
    pub fn build(self) -> Result<CloudEventsClient<T>, ClientError> {
        let missing = |part: &str| ClientError::Config(format!("{part} is required"));
        Ok(CloudEventsClient {
            shared: Arc::new(Shared {
                role: self.role,
                transport: self.transport.ok_or_else(|| missing("transport"))?,
                resolver: self.resolver.ok_or_else(|| missing("resolver"))?,
                codec: self.codec.ok_or_else(|| missing("codec"))?,
                lister: self.lister.ok_or_else(|| missing("lister"))?,
                hasher: self.hasher,
                gate: Mutex::new(DedupGate::new()),
                cancel: self.cancel,
            }),
        })
    }
}

impl<T: ResourceObject> CloudEventsClient<T> {
    /// The role this client plays.
    #[must_use]
    pub fn role(&self) -> &Role {
        &self.shared.role
    }

    /// Encode `resource`, resolve its address and send it.
    ///
    /// Send failures are returned, not retried.
    ///
    /// # Errors
    ///
    /// Returns codec, address or transport errors unchanged.
    pub async fn publish(&self, event_type: &EventType, resource: &T) -> Result<(), ClientError> {
        self.publish_to(event_type, resource, None).await
    }

    /// Publish with an optional `originalsource` override.
    pub(crate) async fn publish_to(
        &self,
        event_type: &EventType,
        resource: &T,
        reply_to: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut envelope = self
            .shared
            .codec
            .encode(self.shared.role.identity(), event_type, resource)?;

        if let Some(reply_to) = reply_to {
            envelope.set_extension(EXTENSION_ORIGINAL_SOURCE, reply_to);
        } else if envelope.extension(EXTENSION_ORIGINAL_SOURCE).is_none() {
            if let Some(original) = resource.original_source() {
                envelope.set_extension(EXTENSION_ORIGINAL_SOURCE, original);
            }
        }

        self.send(&envelope).await
    }

    /// Resolve and send a ready envelope.
    pub(crate) async fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let metadata = EventMetadata::from_envelope(envelope)?;
        let address = self.shared.resolver.resolve(&metadata)?;

        tracing::debug!(
            address,
            event_type = %envelope.event_type,
            id = %envelope.id,
            "Sending event"
        );

        self.shared.transport.send(&address, envelope).await?;
        Ok(())
    }

    /// Process one inbound envelope.
    ///
    /// Resync requests go to the resync path; everything else is decoded,
    /// passed through the dedup gate and, if accepted, handed to `handler`.
    ///
    /// # Errors
    ///
    /// Returns format, protocol and handler errors. Dedup state is updated
    /// only when the handler succeeds. A copy of an update that is still
    /// being handled, for example by a subscription on a clone of this
    /// client, is reported as [`Delivery::Duplicate`].
    pub async fn deliver<H>(&self, envelope: &Envelope, handler: &H) -> Result<Delivery, ClientError>
    where
        H: EventHandler<T> + ?Sized,
    {
        let event_type = envelope.parsed_type().map_err(CodecError::from)?;
        self.shared.codec.check_data_type(&event_type)?;

        if event_type.is_resync_request() {
            let count = self.handle_resync_request(envelope).await?;
            return Ok(Delivery::Resynced(count));
        }

        if event_type.sub_resource != self.shared.role.consumes() {
            tracing::debug!(event_type = %event_type, "Ignoring event for the other side");
            return Ok(Delivery::Ignored);
        }

        let resource = self.shared.codec.decode(envelope)?;
        let status_hash = match (&self.shared.hasher, event_type.sub_resource) {
            (Some(hasher), SubResource::Status) => Some(hasher.status_hash(&resource)?),
            _ => None,
        };

        let key = ResourceKey::new(resource.resource_id(), resource.cluster_name());
        let update = Update {
            sub_resource: event_type.sub_resource,
            version: resource.resource_version(),
            status_hash,
            deleting: resource.deletion_timestamp().is_some(),
        };

        let verdict = self.gate().reserve(&key, &update);
        match verdict {
            Verdict::Duplicate => {
                tracing::debug!(
                    resource_id = %key.resource_id,
                    cluster_name = %key.cluster_name,
                    "Skipping unchanged update"
                );
                Ok(Delivery::Duplicate)
            }
            Verdict::Stale { accepted } => {
                tracing::warn!(
                    resource_id = %key.resource_id,
                    cluster_name = %key.cluster_name,
                    version = update.version,
                    accepted,
                    "Ignoring update older than accepted version"
                );
                Ok(Delivery::Stale)
            }
            Verdict::Dispatch(action) => {
                let result = self.dispatch(handler, action, resource).await;
                {
                    let mut gate = self.gate();
                    if result.is_ok() {
                        gate.record(key, &update);
                    } else {
                        gate.release(&key, &update);
                    }
                }
                result.map(|()| Delivery::Dispatched(action))
            }
        }
    }

    async fn dispatch<H>(&self, handler: &H, action: ResourceAction, resource: T) -> Result<(), ClientError>
    where
        H: EventHandler<T> + ?Sized,
    {
        tracing::debug!(
            ?action,
            resource_id = resource.resource_id(),
            cluster_name = resource.cluster_name(),
            version = resource.resource_version(),
            "Dispatching resource"
        );
        handler.handle(action, resource).await?;
        Ok(())
    }

    /// Subscribe and dispatch inbound resources to `handler`.
    ///
    /// Receiving and dispatching run on separate tasks joined by a queue of
    /// [`DISPATCH_CAPACITY`] envelopes. Dispatch keeps receive order; once
    /// the queue is full a slow handler holds back the transport.
    /// Failures on one envelope are logged and do not end the subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the transport subscription fails.
    pub async fn subscribe<H>(&self, handler: H) -> Result<Subscription, ClientError>
    where
        H: EventHandler<T> + 'static,
    {
        let mut stream = self.shared.transport.subscribe().await?;
        let cancel = self.shared.cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<Result<Envelope, TransportError>>(DISPATCH_CAPACITY);

        let receive_cancel = cancel.clone();
        let receiver = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    () = receive_cancel.cancelled() => break,
                    received = stream.recv() => received,
                };
                let Some(received) = received else {
                    tracing::info!("Event stream closed");
                    break;
                };
                let sent = tokio::select! {
                    () = receive_cancel.cancelled() => break,
                    sent = tx.send(received) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
        });

        let client = self.clone();
        let dispatch_cancel = cancel.clone();
        let dispatcher = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    () = dispatch_cancel.cancelled() => break,
                    next = rx.recv() => next,
                };
                match next {
                    Some(Ok(envelope)) => {
                        if let Err(err) = client.deliver(&envelope, &handler).await {
                            tracing::warn!(
                                error = %err,
                                id = %envelope.id,
                                event_type = %envelope.event_type,
                                "Failed to handle event"
                            );
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "Dropping undecodable message");
                    }
                    None => break,
                }
            }
            tracing::debug!("Dispatch worker stopped");
        });

        Ok(Subscription {
            cancel,
            receiver,
            dispatcher,
        })
    }

    /// Stop every task the client started and close the transport.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.transport.close().await;
    }

    fn gate(&self) -> MutexGuard<'_, DedupGate> {
        self.shared
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running subscription.
#[derive(Debug)]
pub struct Subscription {
    cancel: CancellationToken,
    receiver: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Subscription {
    /// Stop receiving and dispatching.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether both tasks have exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.receiver.is_finished() && self.dispatcher.is_finished()
    }

    /// Wait for both tasks to exit.
    pub async fn join(self) {
        for (name, handle) in [("receiver", self.receiver), ("dispatcher", self.dispatcher)] {
            if let Err(err) = handle.await {
                tracing::error!(task = name, error = %err, "Subscription task failed");
            }
        }
    }
}
