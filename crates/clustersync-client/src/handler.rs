//! Subscription handlers.

use crate::error::HandlerError;
use async_trait::async_trait;
use clustersync_core::ResourceAction;
use std::future::Future;

/// Receives accepted inbound resources.
#[async_trait]
pub trait EventHandler<T>: Send + Sync {
    /// Apply one resource change.
    ///
    /// # Errors
    ///
    /// A failed handler leaves the dedup state untouched, so a redelivery
    /// of the same update is dispatched again.
    async fn handle(&self, action: ResourceAction, resource: T) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> EventHandler<T> for F
where
    T: Send + 'static,
    F: Fn(ResourceAction, T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, action: ResourceAction, resource: T) -> Result<(), HandlerError> {
        self(action, resource).await
    }
}
