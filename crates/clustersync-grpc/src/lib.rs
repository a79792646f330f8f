//! # gRPC Transport
//!
//! Streaming transport against a `io.cloudevents.v1.CloudEventService`
//! broker. Events are published with a unary call and received on a
//! server stream.
//!
//! ## Health
//!
//! Every connection is watched by a [`ConnectionSupervisor`] that polls
//! its state and reports a lost connection exactly once, so the owner can
//! rebuild the client.
//!
//! ```yaml
//! url: grpc.example.com:8443
//! caFile: /etc/clustersync/ca.pem
//! clientCertFile: /etc/clustersync/client.pem
//! clientKeyFile: /etc/clustersync/client.key
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod resolver;
pub mod supervisor;
pub mod transport;

pub use config::{ConfigError, GrpcOptions};
pub use connection::{Connection, ConnectionProvider, ConnectivityState, GrpcConnection};
pub use resolver::{GrpcAgentResolver, GrpcSourceResolver};
pub use supervisor::{connect_supervised, ConnectionSupervisor, SupervisorOutcome, SupervisorState};
pub use transport::GrpcTransport;

use clustersync_core::{DataType, TransportError};
use tokio_util::sync::CancellationToken;

/// A connected, supervised source.
pub type SourceParts = (GrpcSourceResolver, GrpcTransport, ConnectionSupervisor);

/// A connected, supervised agent.
pub type AgentParts = (GrpcAgentResolver, GrpcTransport, ConnectionSupervisor);

/// Connect a source and start supervising its connection.
///
/// `on_error` fires at most once, when the connection is lost.
///
/// # Errors
///
/// Returns error if the server cannot be reached.
pub async fn connect_source<F>(
    options: &GrpcOptions,
    source_id: &str,
    data_type: &DataType,
    cancel: CancellationToken,
    on_error: F,
) -> Result<SourceParts, TransportError>
where
    F: FnOnce(TransportError) + Send + 'static,
{
    let (connection, supervisor) = connect_supervised(
        options,
        options.health_poll_interval,
        cancel.child_token(),
        on_error,
    )
    .await?;
    let transport =
        GrpcTransport::for_source(connection, source_id, &data_type.to_string(), cancel);
    Ok((GrpcSourceResolver::new(source_id), transport, supervisor))
}

/// Connect an agent and start supervising its connection.
///
/// `on_error` fires at most once, when the connection is lost.
///
/// # Errors
///
/// Returns error if the server cannot be reached.
pub async fn connect_agent<F>(
    options: &GrpcOptions,
    cluster_name: &str,
    data_type: &DataType,
    cancel: CancellationToken,
    on_error: F,
) -> Result<AgentParts, TransportError>
where
    F: FnOnce(TransportError) + Send + 'static,
{
    let (connection, supervisor) = connect_supervised(
        options,
        options.health_poll_interval,
        cancel.child_token(),
        on_error,
    )
    .await?;
    let transport =
        GrpcTransport::for_agent(connection, cluster_name, &data_type.to_string(), cancel);
    Ok((GrpcAgentResolver::new(cluster_name), transport, supervisor))
}
