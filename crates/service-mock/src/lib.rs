//! Mock services for exercising service coordination in tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use proven_service::{
    Bootable, BoxError, Error, ManagedService, Service, ServiceState, StateListener, StateMonitor,
};
use tokio::sync::watch;

/// Shared, ordered record of what mock services did.
#[derive(Clone, Debug, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Snapshot of all entries so far.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Index of the first entry equal to `entry`.
    #[must_use]
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e == entry)
    }

    /// Whether `first` was recorded before `second`. False if either is missing.
    #[must_use]
    pub fn happened_before(&self, first: &str, second: &str) -> bool {
        match (self.position(first), self.position(second)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }
}

/// Bootable that records `starting <name>` / `stopping <name>` and runs
/// until shut down.
#[derive(Debug)]
pub struct RecordingService {
    name: String,
    log: EventLog,
    stopped: watch::Sender<bool>,
}

impl RecordingService {
    /// Creates a recording bootable.
    pub fn new(name: impl Into<String>, log: &EventLog) -> Self {
        let (stopped, _) = watch::channel(false);

        Self {
            name: name.into(),
            log: log.clone(),
            stopped,
        }
    }

    /// Wraps a recording bootable into a managed service.
    pub fn managed(name: impl Into<String>, log: &EventLog) -> ManagedService<Self> {
        ManagedService::new(Self::new(name, log))
    }
}

#[async_trait]
impl Bootable for RecordingService {
    fn bootable_name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), BoxError> {
        self.log.push(format!("starting {}", self.name));
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BoxError> {
        self.log.push(format!("stopping {}", self.name));
        self.stopped.send_replace(true);
        Ok(())
    }

    async fn wait(&self) {
        let mut rx = self.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Bootable whose start or shutdown fails with `boom!`.
#[derive(Debug)]
pub struct FailingService {
    name: String,
    log: EventLog,
    fail_on_start: bool,
    stopped: watch::Sender<bool>,
}

impl FailingService {
    /// Fails as soon as it is started.
    pub fn on_start(name: impl Into<String>, log: &EventLog) -> Self {
        Self::new(name.into(), log, true)
    }

    /// Starts fine, fails when shut down.
    pub fn on_shutdown(name: impl Into<String>, log: &EventLog) -> Self {
        Self::new(name.into(), log, false)
    }

    fn new(name: String, log: &EventLog, fail_on_start: bool) -> Self {
        let (stopped, _) = watch::channel(false);

        Self {
            name,
            log: log.clone(),
            fail_on_start,
            stopped,
        }
    }
}

#[async_trait]
impl Bootable for FailingService {
    fn bootable_name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), BoxError> {
        self.log.push(format!("starting {}", self.name));
        if self.fail_on_start {
            return Err("boom!".into());
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BoxError> {
        self.log.push(format!("stopping {}", self.name));
        self.stopped.send_replace(true);
        Err("boom!".into())
    }

    async fn wait(&self) {
        let mut rx = self.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Service driven by hand from the test.
///
/// `start` and `stop` only move the service to STARTING / STOPPING and count
/// the call; the test completes the transition with [`complete_start`],
/// [`complete_stop`] or [`fail`]. Listeners are notified synchronously on the
/// calling thread.
///
/// [`complete_start`]: ManualService::complete_start
/// [`complete_stop`]: ManualService::complete_stop
/// [`fail`]: ManualService::fail
#[derive(Debug)]
pub struct ManualService {
    monitor: StateMonitor,
    log: EventLog,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl ManualService {
    /// Creates a manual service in NEW.
    pub fn new(name: impl Into<String>, log: &EventLog) -> Self {
        Self {
            monitor: StateMonitor::new(name),
            log: log.clone(),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// How many times `start` was called while NEW.
    pub fn start_calls(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// How many times `stop` was called while RUNNING.
    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// STARTING -> RUNNING.
    ///
    /// # Errors
    ///
    /// Fails if the service is not starting.
    pub fn complete_start(&self) -> proven_service::Result<()> {
        self.monitor
            .transition(ServiceState::Starting, ServiceState::Running)
            .map(|_| ())
    }

    /// STOPPING -> TERMINATED.
    ///
    /// # Errors
    ///
    /// Fails if the service is not stopping.
    pub fn complete_stop(&self) -> proven_service::Result<()> {
        self.monitor
            .transition(ServiceState::Stopping, ServiceState::Terminated)
            .map(|_| ())
    }

    /// Current state -> FAILED with an unexpected-exit cause.
    ///
    /// # Errors
    ///
    /// Fails if the service cannot fail from its current state.
    pub fn fail(&self) -> proven_service::Result<()> {
        let cause = Error::ExitedUnexpectedly {
            service: self.monitor.name().to_string(),
        };
        self.monitor.fail(self.monitor.state(), cause).map(|_| ())
    }
}

impl Service for ManualService {
    fn name(&self) -> &str {
        self.monitor.name()
    }

    fn start(&self) {
        if self
            .monitor
            .transition(ServiceState::New, ServiceState::Starting)
            .is_ok()
        {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.log.push(format!("starting {}", self.name()));
        }
    }

    fn stop(&self) {
        if self
            .monitor
            .transition(ServiceState::Running, ServiceState::Stopping)
            .is_ok()
        {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.log.push(format!("stopping {}", self.name()));
        }
    }

    fn state(&self) -> ServiceState {
        self.monitor.state()
    }

    fn failure(&self) -> Option<Error> {
        self.monitor.failure()
    }

    fn add_listener(&self, listener: Arc<dyn StateListener>) {
        self.monitor.add_listener(listener);
    }
}
