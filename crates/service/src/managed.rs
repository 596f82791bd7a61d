//! [`Service`] adapter driving a [`Bootable`] on the Tokio runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info};

use crate::{Bootable, Error, Result, Service, ServiceState, StateListener, StateMonitor};

/// Gives a [`Bootable`] a [`Service`] lifecycle.
///
/// `start` and `stop` spawn the bootable's async routines with
/// [`tokio::spawn`], so they must be called from within a Tokio runtime.
/// Once running, the bootable's [`Bootable::wait`] is watched: if it returns
/// before a stop was requested the service is marked failed.
pub struct ManagedService<B: Bootable> {
    shared: Arc<Shared<B>>,
}

struct Shared<B: Bootable> {
    bootable: B,
    monitor: StateMonitor,
    stop_requested: AtomicBool,
}

impl<B: Bootable> ManagedService<B> {
    /// Wraps `bootable`. The service starts in [`ServiceState::New`].
    pub fn new(bootable: B) -> Self {
        let monitor = StateMonitor::new(bootable.bootable_name());

        Self {
            shared: Arc::new(Shared {
                bootable,
                monitor,
                stop_requested: AtomicBool::new(false),
            }),
        }
    }

    /// The wrapped bootable.
    pub fn bootable(&self) -> &B {
        &self.shared.bootable
    }

    /// Waits until the service is running.
    ///
    /// # Errors
    ///
    /// Returns the failure cause if the service fails or stops first.
    pub async fn await_running(&self) -> Result<()> {
        self.shared.monitor.await_state(ServiceState::Running).await
    }

    /// Waits until the service has terminated.
    ///
    /// # Errors
    ///
    /// Returns the failure cause if the service fails instead.
    pub async fn await_terminated(&self) -> Result<()> {
        self.shared.monitor.await_state(ServiceState::Terminated).await
    }
}

impl<B: Bootable> Shared<B> {
    fn name(&self) -> &str {
        self.monitor.name()
    }

    async fn run_start(self: Arc<Self>) {
        info!("Starting service: {}", self.name());

        if let Err(e) = self.bootable.start().await {
            error!("Failed to start service {}: {}", self.name(), e);
            let _ = self.monitor.fail(
                ServiceState::Starting,
                Error::StartFailed {
                    service: self.name().to_string(),
                    cause: Arc::from(e),
                },
            );
            return;
        }

        if self
            .monitor
            .transition(ServiceState::Starting, ServiceState::Running)
            .is_err()
        {
            return;
        }

        info!("Service {} started successfully", self.name());
        self.spawn_exit_watcher();

        // A stop may have arrived while we were still starting.
        if self.stop_requested.load(Ordering::SeqCst) {
            self.stop_if_running();
        }
    }

    async fn run_shutdown(self: Arc<Self>) {
        info!("Stopping service: {}", self.name());

        match self.bootable.shutdown().await {
            Ok(()) => {
                if self
                    .monitor
                    .transition(ServiceState::Stopping, ServiceState::Terminated)
                    .is_ok()
                {
                    info!("Service {} stopped successfully", self.name());
                }
            }
            Err(e) => {
                error!("Failed to stop service {}: {}", self.name(), e);
                let _ = self.monitor.fail(
                    ServiceState::Stopping,
                    Error::ShutdownFailed {
                        service: self.name().to_string(),
                        cause: Arc::from(e),
                    },
                );
            }
        }
    }

    fn spawn_exit_watcher(self: &Arc<Self>) {
        let shared = Arc::clone(self);

        tokio::spawn(async move {
            shared.bootable.wait().await;

            if shared.stop_requested.load(Ordering::SeqCst) {
                return;
            }

            error!("Service {} exited unexpectedly", shared.name());
            let _ = shared.monitor.fail(
                ServiceState::Running,
                Error::ExitedUnexpectedly {
                    service: shared.name().to_string(),
                },
            );
        });
    }

    fn stop_if_running(self: &Arc<Self>) {
        if self
            .monitor
            .transition(ServiceState::Running, ServiceState::Stopping)
            .is_ok()
        {
            let shared = Arc::clone(self);
            tokio::spawn(shared.run_shutdown());
        }
    }
}

impl<B: Bootable> Service for ManagedService<B> {
    fn name(&self) -> &str {
        self.shared.name()
    }

    fn start(&self) {
        if self
            .shared
            .monitor
            .transition(ServiceState::New, ServiceState::Starting)
            .is_err()
        {
            debug!("Ignoring start of {}: already started", self.name());
            return;
        }

        tokio::spawn(Arc::clone(&self.shared).run_start());
    }

    fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        match self.shared.monitor.state() {
            ServiceState::New => {
                let never_started = self
                    .shared
                    .monitor
                    .transition(ServiceState::New, ServiceState::Terminated)
                    .is_ok();

                // Lost a race with `start`; the start task sees the request.
                if !never_started {
                    self.shared.stop_if_running();
                }
            }
            ServiceState::Running => self.shared.stop_if_running(),
            // Starting: applied once running. Otherwise already stopping or stopped.
            _ => {}
        }
    }

    fn state(&self) -> ServiceState {
        self.shared.monitor.state()
    }

    fn failure(&self) -> Option<Error> {
        self.shared.monitor.failure()
    }

    fn add_listener(&self, listener: Arc<dyn StateListener>) {
        self.shared.monitor.add_listener(listener);
    }
}

impl<B: Bootable> std::fmt::Debug for ManagedService<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedService")
            .field("monitor", &self.shared.monitor)
            .finish_non_exhaustive()
    }
}
