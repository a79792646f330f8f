//! Connection health supervision.
//!
//! The supervisor polls a connection at a fixed interval. On the first
//! observed `TransientFailure` it reports once through the error callback,
//! closes the connection and stops. Cancellation closes the connection
//! without reporting.

use crate::connection::{Connection, ConnectionProvider, ConnectivityState};
use clustersync_core::TransportError;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Dialing the first connection
    Connecting,
    /// Polling a healthy connection
    Connected,
    /// Failure observed, reporting
    Degraded,
    /// Stopped; the connection is closed
    Closed,
}

/// How supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// A failure was reported through the callback
    Failed,
    /// Stopped by cancellation
    Cancelled,
}

/// Handle to a running supervisor task.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    state: watch::Receiver<SupervisorState>,
    handle: JoinHandle<SupervisorOutcome>,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    /// Start supervising `connection`.
    ///
    /// `on_error` runs at most once, on the supervisor task.
    pub fn spawn<C, F>(
        connection: C,
        poll_interval: Duration,
        cancel: CancellationToken,
        on_error: F,
    ) -> Self
    where
        C: Connection,
        F: FnOnce(TransportError) + Send + 'static,
    {
        let (state_tx, state) = watch::channel(SupervisorState::Connected);
        let handle = tokio::spawn(supervise(
            connection,
            poll_interval,
            cancel.clone(),
            state_tx,
            on_error,
        ));
        Self {
            state,
            handle,
            cancel,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Stop supervising and close the connection.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the supervisor to finish.
    pub async fn join(self) -> SupervisorOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "Connection supervisor task failed");
                SupervisorOutcome::Cancelled
            }
        }
    }
}

/// Dial a connection from `provider` and start supervising it.
///
/// Returns the connection for the caller to build a transport on.
///
/// # Errors
///
/// Returns error if the initial dial fails; no supervisor is started.
pub async fn connect_supervised<P, F>(
    provider: &P,
    poll_interval: Duration,
    cancel: CancellationToken,
    on_error: F,
) -> Result<(P::Conn, ConnectionSupervisor), TransportError>
where
    P: ConnectionProvider,
    F: FnOnce(TransportError) + Send + 'static,
{
    tracing::debug!(state = ?SupervisorState::Connecting, "Starting connection supervisor");
    let connection = provider.connect().await?;
    let supervisor =
        ConnectionSupervisor::spawn(connection.clone(), poll_interval, cancel, on_error);
    Ok((connection, supervisor))
}

async fn supervise<C, F>(
    connection: C,
    poll_interval: Duration,
    cancel: CancellationToken,
    state: watch::Sender<SupervisorState>,
    on_error: F,
) -> SupervisorOutcome
where
    C: Connection,
    F: FnOnce(TransportError),
{
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("Connection supervisor cancelled");
                connection.close();
                state.send_replace(SupervisorState::Closed);
                return SupervisorOutcome::Cancelled;
            }
            _ = ticker.tick() => {
                if connection.state() == ConnectivityState::TransientFailure {
                    state.send_replace(SupervisorState::Degraded);
                    tracing::warn!("gRPC connection is disconnected");
                    on_error(TransportError::Connection(
                        "the grpc connection is disconnected".to_string(),
                    ));
                    connection.close();
                    state.send_replace(SupervisorState::Closed);
                    return SupervisorOutcome::Failed;
                }
            }
        }
    }
}
