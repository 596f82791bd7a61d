//! Service manager configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`ServiceManager`](crate::ServiceManager)
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceManagerConfig {
    /// Upper bound for `await_all_running`; unbounded when `None`
    pub startup_timeout: Option<Duration>,

    /// Upper bound for `await_all_terminated`; unbounded when `None`
    pub shutdown_timeout: Option<Duration>,

    /// What a failed service means for the services it depends on
    pub failure_policy: FailurePolicy,
}

/// How a FAILED node affects shutdown of its dependencies
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// A failed node is neither running nor terminated, so everything it
    /// depends on stays blocked until the process exits.
    #[default]
    Block,

    /// A failed node counts as gone: its dependencies may stop once every
    /// other dependent has terminated.
    ReleaseDependencies,
}
