//! gRPC transport configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved gRPC options.
#[derive(Debug, Clone)]
pub struct GrpcOptions {
    /// Server address, `host:port` or a full URL
    pub url: String,
    /// CA certificate for the server (PEM)
    pub ca_file: Option<PathBuf>,
    /// Client certificate for mTLS (PEM)
    pub client_cert_file: Option<PathBuf>,
    /// Client private key for mTLS (PEM)
    pub client_key_file: Option<PathBuf>,
    /// Connect timeout
    pub dial_timeout: Duration,
    /// How often the supervisor checks connection health
    pub health_poll_interval: Duration,
}

/// On-disk YAML form.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrpcConfig {
    #[serde(default)]
    url: String,
    ca_file: Option<PathBuf>,
    client_cert_file: Option<PathBuf>,
    client_key_file: Option<PathBuf>,
    dial_timeout: Option<u64>,
    health_poll_interval_ms: Option<u64>,
}

impl GrpcOptions {
    /// Plain-text options for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ca_file: None,
            client_cert_file: None,
            client_key_file: None,
            dial_timeout: Duration::from_secs(5),
            health_poll_interval: Duration::from_millis(100),
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
    /// Returns error if `url` is missing or the TLS files are inconsistent.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: GrpcConfig =
            serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut options = Self::new(config.url);
        options.ca_file = config.ca_file;
        options.client_cert_file = config.client_cert_file;
        options.client_key_file = config.client_key_file;
        if let Some(secs) = config.dial_timeout {
            options.dial_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = config.health_poll_interval_ms {
            options.health_poll_interval = Duration::from_millis(ms);
        }

        options.validate()?;
        Ok(options)
    }

    /// Check required fields and the TLS file combination.
    ///
    /// # Errors
    ///
    /// Returns error if `url` is empty, only one of the client cert/key is
    /// set, or a client cert/key is set without a CA.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Missing("url".to_string()));
        }

        match (&self.client_cert_file, &self.client_key_file) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "either both or none of clientCertFile and clientKeyFile must be set"
                        .to_string(),
                ));
            }
            (Some(_), Some(_)) if self.ca_file.is_none() => {
                return Err(ConfigError::Invalid(
                    "setting clientCertFile and clientKeyFile requires caFile".to_string(),
                ));
            }
            _ => {}
        }

        if self.health_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "healthPollIntervalMs must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether the connection uses TLS.
    #[must_use]
    pub fn uses_tls(&self) -> bool {
        self.ca_file.is_some()
    }

    /// The endpoint URL with a scheme.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        if self.url.contains("://") {
            self.url.clone()
        } else if self.uses_tls() {
            format!("https://{}", self.url)
        } else {
            format!("http://{}", self.url)
        }
    }
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
    /// Inconsistent or invalid values
    #[error("invalid config: {0}")]
    Invalid(String),
}
