use std::fmt;

use crate::Error;

/// Lifecycle state shared by services and the nodes coordinating them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// Created but never started.
    New,

    /// Start requested, not yet running.
    Starting,

    /// Fully operational.
    Running,

    /// Stop requested, not yet terminated.
    Stopping,

    /// Stopped cleanly.
    Terminated,

    /// Stopped because of an error.
    Failed,
}

impl ServiceState {
    /// Whether no further transition can leave this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Whether `self -> to` is a legal lifecycle transition.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::New, Self::Starting | Self::Terminated)
                | (Self::Starting, Self::Running | Self::Stopping | Self::Failed)
                | (Self::Running, Self::Stopping | Self::Failed)
                | (Self::Stopping, Self::Terminated | Self::Failed)
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
        };

        f.write_str(name)
    }
}

/// A single observed state change of a service.
#[derive(Clone, Debug)]
pub struct Transition {
    /// State before the change.
    pub from: ServiceState,

    /// State after the change.
    pub to: ServiceState,

    /// Cause of the failure when `to` is [`ServiceState::Failed`].
    pub failure: Option<Error>,
}

impl Transition {
    /// Whether this transition ends in [`ServiceState::Failed`].
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self.to, ServiceState::Failed)
    }
}
