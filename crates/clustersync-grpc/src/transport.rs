//! CloudEvent service transport over tonic.

use crate::connection::{Connection, ConnectivityState, GrpcConnection};
use async_trait::async_trait;
use clustersync_core::{
    Envelope, EnvelopeStream, Transport, TransportError, EXTENSION_CLUSTER_NAME,
};
use clustersync_proto::grpc::{
    CloudEvent, PublishRequest, SubscriptionRequest, PUBLISH_PATH, SUBSCRIBE_PATH,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::{Code, Status};

const CHANNEL_CAPACITY: usize = 100;

/// gRPC transport.
///
/// Stream and call failures that indicate a lost connection are reported
/// on the shared [`GrpcConnection`] state for the supervisor to act on.
pub struct GrpcTransport {
    connection: GrpcConnection,
    subscription: SubscriptionRequest,
    cancel: CancellationToken,
}

impl GrpcTransport {
    /// Transport for a source: receives status from every cluster.
    #[must_use]
    pub fn for_source(
        connection: GrpcConnection,
        source_id: &str,
        data_type: &str,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection,
            subscription: SubscriptionRequest {
                source: source_id.to_string(),
                cluster_name: String::new(),
                data_type: data_type.to_string(),
            },
            cancel,
        }
    }

    /// Transport for an agent: receives spec for its cluster.
    #[must_use]
    pub fn for_agent(
        connection: GrpcConnection,
        cluster_name: &str,
        data_type: &str,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection,
            subscription: SubscriptionRequest {
                source: String::new(),
                cluster_name: cluster_name.to_string(),
                data_type: data_type.to_string(),
            },
            cancel,
        }
    }

    fn client(&self) -> tonic::client::Grpc<tonic::transport::Channel> {
        tonic::client::Grpc::new(self.connection.channel())
    }

    fn fail(&self, status: &Status) {
        if is_connection_loss(status) {
            self.connection.report(ConnectivityState::TransientFailure);
        }
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn send(&self, address: &str, envelope: &Envelope) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() || self.connection.state() == ConnectivityState::Shutdown {
            return Err(TransportError::Closed);
        }

        tracing::debug!(
            channel = address,
            event_type = %envelope.event_type,
            "Publishing event"
        );

        let request = PublishRequest {
            topic: address.to_string(),
            event: Some(CloudEvent::from(envelope)),
        };

        let mut client = self.client();
        client.ready().await.map_err(|e| {
            self.connection.report(ConnectivityState::TransientFailure);
            TransportError::Connection(e.to_string())
        })?;

        let codec: ProstCodec<PublishRequest, ()> = ProstCodec::default();
        client
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(PUBLISH_PATH),
                codec,
            )
            .await
            .map_err(|status| {
                self.fail(&status);
                TransportError::Send(status.to_string())
            })?;

        Ok(())
    }

    async fn subscribe(&self) -> Result<EnvelopeStream, TransportError> {
        let mut client = self.client();
        client.ready().await.map_err(|e| {
            self.connection.report(ConnectivityState::TransientFailure);
            TransportError::Connection(e.to_string())
        })?;

        tracing::info!(
            source = %self.subscription.source,
            cluster_name = %self.subscription.cluster_name,
            data_type = %self.subscription.data_type,
            "Subscribing to CloudEvent stream"
        );

        let codec: ProstCodec<SubscriptionRequest, CloudEvent> = ProstCodec::default();
        let stream = client
            .server_streaming(
                tonic::Request::new(self.subscription.clone()),
                PathAndQuery::from_static(SUBSCRIBE_PATH),
                codec,
            )
            .await
            .map_err(|status| {
                self.fail(&status);
                TransportError::Subscribe(status.to_string())
            })?
            .into_inner();

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let expected_cluster = Some(self.subscription.cluster_name.clone())
            .filter(|name| !name.is_empty());

        tokio::spawn(receive_loop(
            stream,
            expected_cluster,
            self.connection.clone(),
            tx,
            self.cancel.clone(),
        ));

        Ok(rx)
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.connection.close();
    }
}

/// A server stream of CloudEvents.
#[async_trait]
trait EventSource: Send {
    /// Next event, `Ok(None)` once the server ends the stream.
    async fn next_event(&mut self) -> Result<Option<CloudEvent>, Status>;
}

#[async_trait]
impl EventSource for tonic::Streaming<CloudEvent> {
    async fn next_event(&mut self) -> Result<Option<CloudEvent>, Status> {
        self.message().await
    }
}

async fn receive_loop<S: EventSource>(
    mut stream: S,
    expected_cluster: Option<String>,
    connection: GrpcConnection,
    tx: mpsc::Sender<Result<Envelope, TransportError>>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next_event() => message,
        };

        match message {
            Ok(Some(event)) => {
                let envelope = decode_event(event, expected_cluster.as_deref());
                if let Err(err) = &envelope {
                    tracing::warn!(error = %err, "Failed to decode event");
                }
                if tx.send(envelope).await.is_err() {
                    tracing::debug!("Event receiver dropped, stopping stream");
                    break;
                }
            }
            Ok(None) => {
                tracing::warn!("CloudEvent stream ended by server");
                connection.report(ConnectivityState::TransientFailure);
                break;
            }
            Err(status) => {
                tracing::error!(code = ?status.code(), error = %status.message(), "CloudEvent stream failed");
                connection.report(ConnectivityState::TransientFailure);
                break;
            }
        }
    }

    tracing::info!("CloudEvent stream stopped");
}

fn decode_event(event: CloudEvent, expected_cluster: Option<&str>) -> Result<Envelope, TransportError> {
    let envelope = Envelope::try_from(event).map_err(|e| TransportError::Wire(e.to_string()))?;

    if let (Some(expected), Some(claimed)) =
        (expected_cluster, envelope.extension_str(EXTENSION_CLUSTER_NAME))
    {
        if expected != claimed {
            return Err(TransportError::Wire(format!(
                "subscribed for cluster {expected}, event claims {claimed}"
            )));
        }
    }

    Ok(envelope)
}

fn is_connection_loss(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::Cancelled | Code::Unknown
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clustersync_core::{DataType, EventBuilder, EventType, SubResource};
    use std::collections::VecDeque;

    struct ScriptedStream {
        items: VecDeque<Result<Option<CloudEvent>, Status>>,
    }

    #[async_trait]
    impl EventSource for ScriptedStream {
        async fn next_event(&mut self) -> Result<Option<CloudEvent>, Status> {
            match self.items.pop_front() {
                Some(item) => item,
                // an exhausted script behaves like an idle server
                None => std::future::pending().await,
            }
        }
    }

    fn scripted(items: Vec<Result<Option<CloudEvent>, Status>>) -> ScriptedStream {
        ScriptedStream {
            items: items.into(),
        }
    }

    fn lazy_connection() -> GrpcConnection {
        GrpcConnection::new(
            tonic::transport::Endpoint::from_static("http://127.0.0.1:1").connect_lazy(),
        )
    }

    fn event(cluster: &str) -> CloudEvent {
        let envelope = EventBuilder::new(
            "source1",
            &EventType::new(
                DataType::new("io.clustersync.works", "v1", "manifests"),
                SubResource::Spec,
                "create_request",
            ),
        )
        .with_resource_id("r1")
        .with_resource_version(1)
        .with_cluster_name(cluster)
        .build();
        CloudEvent::from(&envelope)
    }

    #[test]
    fn decode_for_own_cluster() {
        let envelope = decode_event(event("cluster1"), Some("cluster1")).unwrap();
        assert_eq!(envelope.extension_str(EXTENSION_CLUSTER_NAME), Some("cluster1"));
    }

    #[test]
    fn decode_rejects_other_cluster() {
        assert!(matches!(
            decode_event(event("cluster2"), Some("cluster1")),
            Err(TransportError::Wire(_))
        ));
    }

    #[test]
    fn source_accepts_any_cluster() {
        assert!(decode_event(event("cluster2"), None).is_ok());
    }

    #[test]
    fn unavailable_is_connection_loss() {
        assert!(is_connection_loss(&Status::unavailable("gone")));
        assert!(!is_connection_loss(&Status::invalid_argument("bad topic")));
    }

    #[tokio::test]
    async fn closed_transport_refuses_to_send() {
        let channel = tonic::transport::Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let transport = GrpcTransport::for_agent(
            GrpcConnection::new(channel),
            "cluster1",
            "io.clustersync.works/v1/manifests",
            CancellationToken::new(),
        );
        transport.close().await;

        let envelope = EventBuilder::new(
            "cluster1",
            &EventType::new(
                DataType::new("io.clustersync.works", "v1", "manifests"),
                SubResource::Status,
                "update_request",
            ),
        )
        .build();
        assert_eq!(
            transport.send("sources/s/clusters/cluster1/status", &envelope).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn stream_end_reports_transient_failure() {
        let connection = lazy_connection();
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);

        receive_loop(
            scripted(vec![Ok(Some(event("cluster1"))), Ok(None)]),
            Some("cluster1".to_string()),
            connection.clone(),
            tx,
            CancellationToken::new(),
        )
        .await;

        let delivered = rx.recv().await.unwrap().unwrap();
        assert_eq!(delivered.extension_str(EXTENSION_CLUSTER_NAME), Some("cluster1"));
        assert!(rx.recv().await.is_none());
        assert_eq!(connection.state(), ConnectivityState::TransientFailure);
    }

    #[tokio::test]
    async fn stream_error_reports_transient_failure() {
        let connection = lazy_connection();
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);

        receive_loop(
            scripted(vec![
                Ok(Some(event("cluster2"))),
                Err(Status::unavailable("broker gone")),
            ]),
            Some("cluster1".to_string()),
            connection.clone(),
            tx,
            CancellationToken::new(),
        )
        .await;

        // decode failures are forwarded, the stream error is not
        assert!(matches!(rx.recv().await, Some(Err(TransportError::Wire(_)))));
        assert!(rx.recv().await.is_none());
        assert_eq!(connection.state(), ConnectivityState::TransientFailure);
    }

    #[tokio::test]
    async fn cancelled_stream_leaves_connection_ready() {
        let connection = lazy_connection();
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(receive_loop(
            scripted(vec![Ok(Some(event("cluster1")))]),
            Some("cluster1".to_string()),
            connection.clone(),
            tx,
            cancel.clone(),
        ));

        assert!(rx.recv().await.unwrap().is_ok());
        cancel.cancel();
        handle.await.unwrap();

        assert!(rx.recv().await.is_none());
        assert_eq!(connection.state(), ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn dropped_receiver_stops_stream() {
        let connection = lazy_connection();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        drop(rx);

        receive_loop(
            scripted(vec![Ok(Some(event("cluster1")))]),
            None,
            connection.clone(),
            tx,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(connection.state(), ConnectivityState::Ready);
    }
}
