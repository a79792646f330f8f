//! # MQTT Transport
//!
//! Broker transport for clustersync clients.
//!
//! ## Topics
//!
//! Sources publish on `sourceEvents` and subscribe to `agentEvents` (plus
//! `agentBroadcast`); agents do the reverse. See
//! [`clustersync_proto::topics`] for the template rules.
//!
//! ```yaml
//! brokerHost: 127.0.0.1:1883
//! topics:
//!   sourceEvents: sources/hub1/clusters/+/sourceevents
//!   agentEvents: sources/hub1/clusters/+/agentevents
//!   agentBroadcast: clusters/+/agentbroadcast
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod resolver;
pub mod transport;

pub use config::{ConfigError, MqttOptions};
pub use resolver::{MqttAgentResolver, MqttSourceResolver};
pub use transport::MqttTransport;

use clustersync_core::TransportError;
use tokio_util::sync::CancellationToken;

/// Connect a source: resolver plus transport subscribed to agent topics.
///
/// # Errors
///
/// Returns error if the broker cannot be reached.
pub async fn connect_source(
    options: &MqttOptions,
    client_id: &str,
    source_id: &str,
    cancel: CancellationToken,
) -> Result<(MqttSourceResolver, MqttTransport), TransportError> {
    let subscriptions = options.topics.source_subscriptions(source_id);
    let transport = MqttTransport::connect(options, client_id, subscriptions, cancel).await?;
    Ok((
        MqttSourceResolver::new(options.topics.clone(), source_id),
        transport,
    ))
}

/// Connect an agent: resolver plus transport subscribed to its cluster's topics.
///
/// # Errors
///
/// Returns error if the broker cannot be reached.
pub async fn connect_agent(
    options: &MqttOptions,
    client_id: &str,
    cluster_name: &str,
    cancel: CancellationToken,
) -> Result<(MqttAgentResolver, MqttTransport), TransportError> {
    let subscriptions = options.topics.agent_subscriptions(cluster_name);
    let transport = MqttTransport::connect(options, client_id, subscriptions, cancel).await?;
    Ok((
        MqttAgentResolver::new(options.topics.clone(), cluster_name),
        transport,
    ))
}
