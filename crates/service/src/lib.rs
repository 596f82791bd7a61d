//! Abstract interface for services with an observable, asynchronous lifecycle.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod managed;
mod monitor;
mod state;

pub use error::{BoxError, Error, Result, SharedError};
pub use managed::ManagedService;
pub use monitor::StateMonitor;
pub use state::{ServiceState, Transition};

use std::sync::Arc;

use async_trait::async_trait;

/// Trait for bootable services.
///
/// A bootable holds the actual work of a service. Wrap it in a
/// [`ManagedService`] to give it a [`Service`] lifecycle.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// Get the name of the bootable service.
    fn bootable_name(&self) -> &str;

    /// Start the bootable service.
    async fn start(&self) -> std::result::Result<(), BoxError>;

    /// Shutdown the bootable service.
    async fn shutdown(&self) -> std::result::Result<(), BoxError>;

    /// Wait for the bootable service to exit.
    async fn wait(&self);
}

/// Receives state-change notifications from a [`Service`].
pub trait StateListener: Send + Sync {
    /// Called once for every transition, in the order they happen.
    fn on_state_change(&self, transition: &Transition);
}

impl<F> StateListener for F
where
    F: Fn(&Transition) + Send + Sync,
{
    fn on_state_change(&self, transition: &Transition) {
        self(transition);
    }
}

/// A runnable component with an asynchronous start/stop lifecycle.
///
/// `start` and `stop` return immediately; progress is reported through
/// [`StateListener`]s. Both are idempotent: only the first meaningful call
/// has an effect.
pub trait Service: Send + Sync + 'static {
    /// Human readable name.
    fn name(&self) -> &str;

    /// Requests the service to start.
    fn start(&self);

    /// Requests the service to stop.
    fn stop(&self);

    /// Current lifecycle state.
    fn state(&self) -> ServiceState;

    /// Cause of the failure, once the service is [`ServiceState::Failed`].
    fn failure(&self) -> Option<Error>;

    /// Subscribes `listener` to every future state change.
    fn add_listener(&self, listener: Arc<dyn StateListener>);
}
