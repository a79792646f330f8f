//! MQTT transport configuration.

use clustersync_proto::Topics;
use rumqttc::QoS;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

const DEFAULT_PORT: u16 = 1883;

/// Resolved MQTT options.
#[derive(Debug, Clone)]
pub struct MqttOptions {
    /// Broker host name
    pub broker_host: String,
    /// Broker port
    pub broker_port: u16,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// QoS for publishes
    pub pub_qos: QoS,
    /// QoS for subscriptions
    pub sub_qos: QoS,
    /// How long to wait for the initial connection
    pub dial_timeout: Duration,
    /// Delay before polling again after an event loop error
    pub reconnect_delay: Duration,
    /// Topic templates
    pub topics: Topics,
}

/// On-disk YAML form.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MqttConfig {
    broker_host: Option<String>,
    keep_alive: Option<u64>,
    #[serde(rename = "pubQoS")]
    pub_qos: Option<u8>,
    #[serde(rename = "subQoS")]
    sub_qos: Option<u8>,
    dial_timeout: Option<u64>,
    topics: Option<Topics>,
}

impl MqttOptions {
    /// Options with defaults for everything but host and topics.
    #[must_use]
    pub fn new(broker_host: impl Into<String>, broker_port: u16, topics: Topics) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port,
            keep_alive: Duration::from_secs(60),
            pub_qos: QoS::AtLeastOnce,
            sub_qos: QoS::AtLeastOnce,
            dial_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            topics,
        }
    }

    /// Load options from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is invalid.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    /// Parse options from YAML.
    ///
    /// # Errors
    ///
    /// Returns error if required fields are missing or values are invalid.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: MqttConfig =
            serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let broker_host = config
            .broker_host
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::Missing("brokerHost".to_string()))?;
        let (host, port) = parse_mqtt_url(&broker_host)?;

        let topics = config
            .topics
            .ok_or_else(|| ConfigError::Missing("topics".to_string()))?;
        topics
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut options = Self::new(host, port, topics);
        if let Some(keep_alive) = config.keep_alive {
            options.keep_alive = Duration::from_secs(keep_alive);
        }
        if let Some(qos) = config.pub_qos {
            options.pub_qos = parse_qos("pubQoS", qos)?;
        }
        if let Some(qos) = config.sub_qos {
            options.sub_qos = parse_qos("subQoS", qos)?;
        }
        if let Some(dial_timeout) = config.dial_timeout {
            options.dial_timeout = Duration::from_secs(dial_timeout);
        }

        Ok(options)
    }
}

fn parse_qos(field: &str, value: u8) -> Result<QoS, ConfigError> {
    match value {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ConfigError::Invalid(format!(
            "{field}: QoS must be 0, 1 or 2, got {other}"
        ))),
    }
}

/// Parse MQTT URL into host and port.
pub(crate) fn parse_mqtt_url(input: &str) -> Result<(String, u16), ConfigError> {
    if input.contains("://") {
        let url =
            Url::parse(input).map_err(|e| ConfigError::InvalidUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(ConfigError::InvalidUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::InvalidUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => DEFAULT_PORT,
        Some(port) => port
            .parse()
            .map_err(|_| ConfigError::InvalidUrl(format!("{input}: invalid port '{port}'")))?,
    };
    if parts.next().is_some() {
        return Err(ConfigError::InvalidUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Configuration errors. Reported before any connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config {0}")]
    Read(String),
    /// YAML could not be parsed
    #[error("failed to parse config: {0}")]
    Parse(String),
    /// Required field absent
    #[error("{0} is required")]
    Missing(String),
    /// Field present but invalid
    #[error("invalid config: {0}")]
    Invalid(String),
    /// Broker address could not be parsed
    #[error("invalid MQTT broker URL: {0}")]
    InvalidUrl(String),
}
