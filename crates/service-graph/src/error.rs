//! Error types for building and running a service graph

use std::fmt::Write;

use proven_service::ServiceState;
use thiserror::Error;

use crate::ServiceKey;

/// Result type for service graph operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or awaiting a service graph
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// An edge was added to a service that has already left NEW.
    #[error("Cannot add dependencies to {key} after the service graph has been built")]
    GraphFrozen {
        /// Service that is no longer NEW
        key: ServiceKey,
    },

    /// An enhancement was attached to more than one target.
    #[error("Enhancement {enhancement} cannot be applied more than once (enhances {existing_target}, requested for {target})")]
    DuplicateEnhancement {
        /// The enhancement
        enhancement: ServiceKey,
        /// Target it already enhances
        existing_target: ServiceKey,
        /// Target it was attached to again
        target: ServiceKey,
    },

    /// An edge references a key with no registered service.
    #[error("{}", unknown_service_message(.missing, .required_by))]
    UnknownService {
        /// The unregistered key
        missing: ServiceKey,
        /// Services whose edges require the missing key
        required_by: Vec<ServiceKey>,
    },

    /// The graph is not a DAG.
    #[error("Detected cycle: {}", cycle_path(.cycle))]
    Cycle {
        /// Nodes forming the cycle, in edge order
        cycle: Vec<ServiceKey>,
    },

    /// A service failed while it was being awaited.
    #[error("{key} failed: {}", failure_message(.cause))]
    ServiceFailed {
        /// Failed service
        key: ServiceKey,
        /// Failure reported by the service
        cause: Option<proven_service::Error>,
    },

    /// Services did not settle in time.
    #[error("Timed out waiting for services to reach {waiting_for}: {}", pending_list(.pending))]
    Timeout {
        /// State being awaited
        waiting_for: ServiceState,
        /// Services not there yet, with their current state
        pending: Vec<(ServiceKey, ServiceState)>,
    },

    /// The graph was dropped while being awaited.
    #[error("Service graph closed")]
    Closed,
}

fn unknown_service_message(missing: &ServiceKey, required_by: &[ServiceKey]) -> String {
    if required_by.is_empty() {
        return format!(
            "{missing} has declared edges but no such service was registered with the builder"
        );
    }

    let requirers = required_by
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    format!("{requirers} requires {missing} but no such service was registered with the builder")
}

fn failure_message(cause: &Option<proven_service::Error>) -> String {
    cause
        .as_ref()
        .map_or_else(|| "unknown cause".to_string(), ToString::to_string)
}

fn cycle_path(cycle: &[ServiceKey]) -> String {
    let mut path = String::new();

    for key in cycle {
        let _ = write!(path, "{key} -> ");
    }
    if let Some(first) = cycle.first() {
        let _ = write!(path, "{first}");
    }

    path
}

fn pending_list(pending: &[(ServiceKey, ServiceState)]) -> String {
    pending
        .iter()
        .map(|(key, state)| format!("{key} [{state}]"))
        .collect::<Vec<_>>()
        .join(", ")
}
