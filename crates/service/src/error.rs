use std::sync::Arc;

use thiserror::Error;

use crate::ServiceState;

/// Boxed error returned across the [`Bootable`](crate::Bootable) seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared, cloneable failure cause.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while driving a service through its lifecycle.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The service's start routine returned an error.
    #[error("{service} failed to start: {cause}")]
    StartFailed {
        /// Name of the service.
        service: String,
        /// Underlying cause.
        cause: SharedError,
    },

    /// The service's shutdown routine returned an error.
    #[error("{service} failed to shut down: {cause}")]
    ShutdownFailed {
        /// Name of the service.
        service: String,
        /// Underlying cause.
        cause: SharedError,
    },

    /// The service stopped on its own while it was expected to be running.
    #[error("{service} exited unexpectedly while running")]
    ExitedUnexpectedly {
        /// Name of the service.
        service: String,
    },

    /// A transition was requested from a state the service is not in.
    #[error("{service} cannot move from {from} to {to} while {actual}")]
    IllegalTransition {
        /// Name of the service.
        service: String,
        /// Expected current state.
        from: ServiceState,
        /// Requested state.
        to: ServiceState,
        /// Actual current state.
        actual: ServiceState,
    },

    /// The service settled in a state other than the one awaited.
    #[error("{service} reached {actual} while waiting for {expected}")]
    UnexpectedState {
        /// Name of the service.
        service: String,
        /// State being awaited.
        expected: ServiceState,
        /// State reached instead.
        actual: ServiceState,
    },
}
