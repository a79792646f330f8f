//! Connections and their observable health.
//!
//! A tonic [`Channel`] does not expose its connectivity state, so every
//! [`GrpcConnection`] carries a `watch` cell that the streaming tasks
//! update. The supervisor reads it and nothing else.

use crate::config::GrpcOptions;
use async_trait::async_trait;
use clustersync_core::TransportError;
use std::sync::Arc;
use tokio::sync::watch;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};

/// Health of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Dialing
    Connecting,
    /// Established and serving calls
    Ready,
    /// Lost; will not recover on its own
    TransientFailure,
    /// Closed locally
    Shutdown,
}

/// A connection whose health can be polled.
pub trait Connection: Send + Sync + 'static {
    /// Current connectivity state.
    fn state(&self) -> ConnectivityState;

    /// Release the connection.
    fn close(&self);
}

/// Produces connections.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Connection type produced.
    type Conn: Connection + Clone;

    /// Dial a new connection.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint cannot be reached.
    async fn connect(&self) -> Result<Self::Conn, TransportError>;
}

/// A tonic channel plus its reported state.
#[derive(Debug, Clone)]
pub struct GrpcConnection {
    channel: Channel,
    state: Arc<watch::Sender<ConnectivityState>>,
}

impl GrpcConnection {
    /// Wrap an established channel.
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Ready);
        Self {
            channel,
            state: Arc::new(state),
        }
    }

    /// A handle to the underlying channel.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Record a state change observed by a call or stream.
    ///
    /// A shut down connection stays shut down.
    pub fn report(&self, state: ConnectivityState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectivityState::Shutdown || *current == state {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?state, "gRPC connectivity changed");
            *current = state;
            true
        });
    }
}

impl Connection for GrpcConnection {
    fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    fn close(&self) {
        self.report(ConnectivityState::Shutdown);
    }
}

#[async_trait]
impl ConnectionProvider for GrpcOptions {
    type Conn = GrpcConnection;

    async fn connect(&self) -> Result<GrpcConnection, TransportError> {
        let url = self.endpoint_url();
        let mut endpoint = Endpoint::from_shared(url.clone())
            .map_err(|e| TransportError::Connection(format!("invalid url {url}: {e}")))?
            .connect_timeout(self.dial_timeout);

        if let Some(ca_file) = &self.ca_file {
            let ca = std::fs::read(ca_file).map_err(|e| {
                TransportError::Connection(format!("failed to read {}: {e}", ca_file.display()))
            })?;
            let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca));

            if let (Some(cert_file), Some(key_file)) =
                (&self.client_cert_file, &self.client_key_file)
            {
                let cert = std::fs::read(cert_file).map_err(|e| {
                    TransportError::Connection(format!(
                        "failed to read {}: {e}",
                        cert_file.display()
                    ))
                })?;
                let key = std::fs::read(key_file).map_err(|e| {
                    TransportError::Connection(format!(
                        "failed to read {}: {e}",
                        key_file.display()
                    ))
                })?;
                tls = tls.identity(Identity::from_pem(cert, key));
            }

            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| TransportError::Connection(format!("invalid TLS config: {e}")))?;
        }

        tracing::info!(url, tls = self.uses_tls(), "Connecting to gRPC server");

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| TransportError::Connection(format!("failed to connect to {url}: {e}")))?;

        tracing::info!(url, "Connected to gRPC server");
        Ok(GrpcConnection::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn report_and_close() {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let connection = GrpcConnection::new(channel);
        assert_eq!(connection.state(), ConnectivityState::Ready);

        connection.report(ConnectivityState::TransientFailure);
        assert_eq!(connection.state(), ConnectivityState::TransientFailure);

        connection.close();
        assert_eq!(connection.state(), ConnectivityState::Shutdown);

        connection.report(ConnectivityState::Ready);
        assert_eq!(connection.state(), ConnectivityState::Shutdown);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let connection = GrpcConnection::new(channel);
        let clone = connection.clone();
        clone.report(ConnectivityState::TransientFailure);
        assert_eq!(connection.state(), ConnectivityState::TransientFailure);
    }

    #[tokio::test]
    async fn missing_ca_file_fails_before_dialing() {
        let mut options = GrpcOptions::new("127.0.0.1:1");
        options.ca_file = Some(PathBuf::from("/nonexistent/ca.pem"));
        let err = options.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(msg) if msg.contains("ca.pem")));
    }
}
