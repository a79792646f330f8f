//! Runtime configuration.

use anyhow::{bail, Context, Result};
use clustersync_client::Role;
use clustersync_grpc::GrpcOptions;
use clustersync_mqtt::MqttOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Which side of the protocol this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    /// Authors specs, collects status
    Source,
    /// Receives specs, reports status
    Agent,
}

impl FromStr for RoleKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "source" => Ok(Self::Source),
            "agent" => Ok(Self::Agent),
            other => bail!("unknown role {other:?}, expected source or agent"),
        }
    }
}

/// Transport to connect with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// MQTT broker
    Mqtt,
    /// gRPC CloudEvent service
    Grpc,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mqtt" => Ok(Self::Mqtt),
            "grpc" => Ok(Self::Grpc),
            other => bail!("unknown transport {other:?}, expected mqtt or grpc"),
        }
    }
}

/// Loaded transport options.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// MQTT options
    Mqtt(MqttOptions),
    /// gRPC options
    Grpc(GrpcOptions),
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Role of this process
    pub role: RoleKind,

    /// Transport kind
    pub transport: TransportKind,

    /// Path to the transport's YAML file
    pub transport_config: PathBuf,

    /// Source identity (source role)
    pub source_id: String,

    /// Cluster name (agent role)
    pub cluster_name: Option<String>,

    /// MQTT client id
    pub client_id: String,

    /// Database path
    pub db_path: PathBuf,

    /// Delay before rebuilding a lost client
    pub reconnect_delay: Duration,

    /// How often a source checks its store for unpublished changes
    pub poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            role: RoleKind::Source,
            transport: TransportKind::Mqtt,
            transport_config: PathBuf::from("./transport.yaml"),
            source_id: "clustersync-source".to_string(),
            cluster_name: None,
            client_id: format!("clustersync-{}", Uuid::new_v4()),
            db_path: PathBuf::from("./clustersync.db"),
            reconnect_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CLUSTERSYNC_ROLE`: "source" or "agent"
    /// - `CLUSTERSYNC_TRANSPORT`: "mqtt" or "grpc"
    /// - `CLUSTERSYNC_TRANSPORT_CONFIG`: transport YAML path
    /// - `CLUSTERSYNC_SOURCE_ID`: source identity
    /// - `CLUSTERSYNC_CLUSTER_NAME`: cluster name, required for agents
    /// - `CLUSTERSYNC_CLIENT_ID`: MQTT client id
    /// - `CLUSTERSYNC_DB_PATH`: SQLite database path
    /// - `CLUSTERSYNC_RECONNECT_DELAY_SECS`: delay before reconnecting
    /// - `CLUSTERSYNC_POLL_INTERVAL_SECS`: source publish poll interval
    ///
    /// # Errors
    ///
    /// Returns error if a value is invalid or a required one is missing.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a value is invalid or a required one is missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(role) = lookup("CLUSTERSYNC_ROLE") {
            config.role = role.parse().context("Invalid CLUSTERSYNC_ROLE")?;
        }

        if let Some(transport) = lookup("CLUSTERSYNC_TRANSPORT") {
            config.transport = transport.parse().context("Invalid CLUSTERSYNC_TRANSPORT")?;
        }

        if let Some(path) = lookup("CLUSTERSYNC_TRANSPORT_CONFIG") {
            config.transport_config = PathBuf::from(path);
        }

        if let Some(source_id) = lookup("CLUSTERSYNC_SOURCE_ID") {
            config.source_id = source_id;
        }

        config.cluster_name = lookup("CLUSTERSYNC_CLUSTER_NAME").filter(|name| !name.is_empty());

        if let Some(client_id) = lookup("CLUSTERSYNC_CLIENT_ID") {
            config.client_id = client_id;
        }

        if let Some(db_path) = lookup("CLUSTERSYNC_DB_PATH") {
            config.db_path = PathBuf::from(db_path);
        }

        if let Some(secs) = lookup("CLUSTERSYNC_RECONNECT_DELAY_SECS") {
            config.reconnect_delay = Duration::from_secs(
                secs.parse()
                    .context("Invalid CLUSTERSYNC_RECONNECT_DELAY_SECS")?,
            );
        }

        if let Some(secs) = lookup("CLUSTERSYNC_POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(
                secs.parse()
                    .context("Invalid CLUSTERSYNC_POLL_INTERVAL_SECS")?,
            );
        }

        if config.role == RoleKind::Agent && config.cluster_name.is_none() {
            bail!("CLUSTERSYNC_CLUSTER_NAME is required for the agent role");
        }

        Ok(config)
    }

    /// The client role.
    ///
    /// # Errors
    ///
    /// Returns error if an agent has no cluster name.
    pub fn client_role(&self) -> Result<Role> {
        match self.role {
            RoleKind::Source => Ok(Role::source(self.source_id.as_str())),
            RoleKind::Agent => self
                .cluster_name
                .as_deref()
                .map(Role::agent)
                .context("agent role requires a cluster name"),
        }
    }

    /// Load the transport's YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is invalid.
    pub fn load_transport(&self) -> Result<TransportConfig> {
        let path = &self.transport_config;
        match self.transport {
            TransportKind::Mqtt => MqttOptions::from_file(path)
                .map(TransportConfig::Mqtt)
                .with_context(|| format!("Failed to load MQTT config {}", path.display())),
            TransportKind::Grpc => GrpcOptions::from_file(path)
                .map(TransportConfig::Grpc)
                .with_context(|| format!("Failed to load gRPC config {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_to_mqtt_source() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.role, RoleKind::Source);
        assert_eq!(config.transport, TransportKind::Mqtt);
        assert_eq!(config.source_id, "clustersync-source");
        assert!(config.client_id.starts_with("clustersync-"));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(
            config.client_role().unwrap(),
            Role::source("clustersync-source")
        );
    }

    #[test]
    fn agent_from_env() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("CLUSTERSYNC_ROLE", "agent"),
            ("CLUSTERSYNC_TRANSPORT", "grpc"),
            ("CLUSTERSYNC_CLUSTER_NAME", "cluster1"),
            ("CLUSTERSYNC_DB_PATH", "/tmp/agent.db"),
            ("CLUSTERSYNC_RECONNECT_DELAY_SECS", "2"),
        ]))
        .unwrap();

        assert_eq!(config.transport, TransportKind::Grpc);
        assert_eq!(config.db_path, PathBuf::from("/tmp/agent.db"));
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.client_role().unwrap(), Role::agent("cluster1"));
    }

    #[test]
    fn agent_requires_cluster_name() {
        assert!(RuntimeConfig::from_lookup(lookup(&[("CLUSTERSYNC_ROLE", "agent")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[
            ("CLUSTERSYNC_ROLE", "agent"),
            ("CLUSTERSYNC_CLUSTER_NAME", ""),
        ]))
        .is_err());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(RuntimeConfig::from_lookup(lookup(&[("CLUSTERSYNC_ROLE", "hub")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[("CLUSTERSYNC_TRANSPORT", "amqp")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[(
            "CLUSTERSYNC_POLL_INTERVAL_SECS",
            "soon"
        )]))
        .is_err());
    }

    #[test]
    fn loads_mqtt_transport_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "brokerHost: 127.0.0.1:1883\ntopics:\n  sourceEvents: sources/hub1/clusters/+/sourceevents\n  agentEvents: sources/hub1/clusters/+/agentevents\n  agentBroadcast: clusters/+/agentbroadcast"
        )
        .unwrap();

        let mut config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        config.transport_config = file.path().to_path_buf();

        match config.load_transport().unwrap() {
            TransportConfig::Mqtt(options) => assert_eq!(options.broker_port, 1883),
            TransportConfig::Grpc(_) => panic!("expected MQTT options"),
        }

        config.transport_config = PathBuf::from("/nonexistent/transport.yaml");
        assert!(config.load_transport().is_err());
    }
}
