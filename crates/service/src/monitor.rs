//! Thread-safe lifecycle state machine with ordered listener dispatch.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{Error, Result, ServiceState, StateListener, Transition};

/// Tracks the state of one service and notifies its listeners.
///
/// Notifications are queued while the state lock is held and delivered
/// afterwards, one transition at a time and in the order they happened.
/// Listeners may therefore call back into the monitor (or into other
/// services) without deadlocking.
pub struct StateMonitor {
    name: String,
    inner: Mutex<MonitorInner>,
    state_tx: watch::Sender<ServiceState>,
}

struct MonitorInner {
    state: ServiceState,
    failure: Option<Error>,
    listeners: Vec<Arc<dyn StateListener>>,
    pending: VecDeque<Transition>,
    dispatching: bool,
}

impl StateMonitor {
    /// Creates a monitor in [`ServiceState::New`].
    pub fn new(name: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(ServiceState::New);

        Self {
            name: name.into(),
            inner: Mutex::new(MonitorInner {
                state: ServiceState::New,
                failure: None,
                listeners: Vec::new(),
                pending: VecDeque::new(),
                dispatching: false,
            }),
            state_tx,
        }
    }

    /// Name of the monitored service.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> ServiceState {
        self.inner.lock().state
    }

    /// Failure cause, once the service has failed.
    pub fn failure(&self) -> Option<Error> {
        self.inner.lock().failure.clone()
    }

    /// Registers a listener for all future transitions.
    pub fn add_listener(&self, listener: Arc<dyn StateListener>) {
        self.inner.lock().listeners.push(listener);
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    /// Moves from `from` to `to`, failing if the service is not in `from`
    /// or the move is not a legal lifecycle transition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalTransition`] when the transition is rejected.
    pub fn transition(&self, from: ServiceState, to: ServiceState) -> Result<Transition> {
        self.apply(from, to, None)
    }

    /// Moves from `from` to [`ServiceState::Failed`], recording `cause`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalTransition`] when the service is not in `from`.
    pub fn fail(&self, from: ServiceState, cause: Error) -> Result<Transition> {
        self.apply(from, ServiceState::Failed, Some(cause))
    }

    /// Waits until the service reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns the failure cause if the service fails first, or
    /// [`Error::UnexpectedState`] if it settles in another terminal state.
    pub async fn await_state(&self, target: ServiceState) -> Result<()> {
        let mut rx = self.subscribe();
        let reached = rx
            .wait_for(|state| *state == target || state.is_terminal())
            .await
            .map(|state| *state)
            .unwrap_or(ServiceState::Failed);

        if reached == target {
            return Ok(());
        }

        match (reached, self.failure()) {
            (ServiceState::Failed, Some(cause)) => Err(cause),
            (actual, _) => Err(Error::UnexpectedState {
                service: self.name.clone(),
                expected: target,
                actual,
            }),
        }
    }

    fn apply(
        &self,
        from: ServiceState,
        to: ServiceState,
        failure: Option<Error>,
    ) -> Result<Transition> {
        let transition = {
            let mut inner = self.inner.lock();

            if inner.state != from || !from.can_transition_to(to) {
                return Err(Error::IllegalTransition {
                    service: self.name.clone(),
                    from,
                    to,
                    actual: inner.state,
                });
            }

            inner.state = to;
            if failure.is_some() {
                inner.failure.clone_from(&failure);
            }

            let transition = Transition { from, to, failure };
            inner.pending.push_back(transition.clone());
            self.state_tx.send_replace(to);

            transition
        };

        match &transition.failure {
            Some(cause) => warn!("{} {} -> {}: {}", self.name, from, to, cause),
            None => debug!("{} {} -> {}", self.name, from, to),
        }

        self.dispatch();

        Ok(transition)
    }

    fn dispatch(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.dispatching {
                // Whoever is dispatching will drain what we queued.
                return;
            }
            inner.dispatching = true;
        }

        loop {
            let (transition, listeners) = {
                let mut inner = self.inner.lock();
                match inner.pending.pop_front() {
                    Some(transition) => (transition, inner.listeners.clone()),
                    None => {
                        inner.dispatching = false;
                        return;
                    }
                }
            };

            for listener in &listeners {
                listener.on_state_change(&transition);
            }
        }
    }
}

impl std::fmt::Debug for StateMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMonitor")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn test_listeners_see_transitions_in_order() {
        let monitor = StateMonitor::new("db");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let recorder = Arc::clone(&seen);
        monitor.add_listener(Arc::new(move |t: &Transition| {
            recorder.lock().push((t.from, t.to));
        }));

        monitor
            .transition(ServiceState::New, ServiceState::Starting)
            .unwrap();
        monitor
            .transition(ServiceState::Starting, ServiceState::Running)
            .unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (ServiceState::New, ServiceState::Starting),
                (ServiceState::Starting, ServiceState::Running),
            ]
        );
    }

    #[test]
    fn test_rejects_transition_from_wrong_state() {
        let monitor = StateMonitor::new("db");

        let result = monitor.transition(ServiceState::Running, ServiceState::Stopping);

        assert_matches!(
            result,
            Err(Error::IllegalTransition {
                actual: ServiceState::New,
                ..
            })
        );
        assert_eq!(monitor.state(), ServiceState::New);
    }

    #[test]
    fn test_rejects_illegal_transition() {
        let monitor = StateMonitor::new("db");

        assert!(
            monitor
                .transition(ServiceState::New, ServiceState::Running)
                .is_err()
        );
    }

    #[test]
    fn test_reentrant_listener_is_queued_not_deadlocked() {
        let monitor = Arc::new(StateMonitor::new("db"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&monitor);
        let recorder = Arc::clone(&seen);
        monitor.add_listener(Arc::new(move |t: &Transition| {
            recorder.lock().push(t.to);
            if t.to == ServiceState::Starting {
                if let Some(monitor) = weak.upgrade() {
                    // Nested transition while the first one is being delivered.
                    monitor
                        .transition(ServiceState::Starting, ServiceState::Running)
                        .unwrap();
                    recorder.lock().push(ServiceState::Starting);
                }
            }
        }));

        monitor
            .transition(ServiceState::New, ServiceState::Starting)
            .unwrap();

        // RUNNING is delivered after the STARTING listener returned.
        assert_eq!(
            *seen.lock(),
            vec![
                ServiceState::Starting,
                ServiceState::Starting,
                ServiceState::Running
            ]
        );
    }

    #[test]
    fn test_failure_is_recorded() {
        let monitor = StateMonitor::new("db");
        monitor
            .transition(ServiceState::New, ServiceState::Starting)
            .unwrap();

        let transition = monitor
            .fail(
                ServiceState::Starting,
                Error::ExitedUnexpectedly {
                    service: "db".to_string(),
                },
            )
            .unwrap();

        assert!(transition.is_failure());
        assert_eq!(monitor.state(), ServiceState::Failed);
        assert_matches!(monitor.failure(), Some(Error::ExitedUnexpectedly { .. }));
    }

    #[tokio::test]
    async fn test_await_state_reports_failure() {
        let monitor = Arc::new(StateMonitor::new("db"));
        monitor
            .transition(ServiceState::New, ServiceState::Starting)
            .unwrap();

        let waiter = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.await_state(ServiceState::Running).await })
        };

        monitor
            .fail(
                ServiceState::Starting,
                Error::ExitedUnexpectedly {
                    service: "db".to_string(),
                },
            )
            .unwrap();

        assert_matches!(
            waiter.await.unwrap(),
            Err(Error::ExitedUnexpectedly { .. })
        );
    }

    #[tokio::test]
    async fn test_await_state_reports_unexpected_terminal_state() {
        let monitor = StateMonitor::new("db");
        monitor
            .transition(ServiceState::New, ServiceState::Terminated)
            .unwrap();

        assert_matches!(
            monitor.await_state(ServiceState::Running).await,
            Err(Error::UnexpectedState {
                actual: ServiceState::Terminated,
                ..
            })
        );
    }
}
