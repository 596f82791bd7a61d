//! Services created only when the graph starts them.

use std::sync::Arc;

use parking_lot::Mutex;
use proven_service::{Service, ServiceState, StateListener};
use tracing::{debug, warn};

type Factory = Box<dyn FnOnce() -> Arc<dyn Service> + Send>;

/// Stands in for a service until its node starts it.
///
/// Reports NEW until then; listeners registered before creation are handed
/// to the real service once it exists.
pub struct LazyService {
    name: String,
    inner: Mutex<Lazy>,
}

struct Lazy {
    factory: Option<Factory>,
    service: Option<Arc<dyn Service>>,
    listeners: Vec<Arc<dyn StateListener>>,
}

impl LazyService {
    pub fn new<S, F>(name: impl Into<String>, factory: F) -> Self
    where
        S: Service,
        F: FnOnce() -> S + Send + 'static,
    {
        Self {
            name: name.into(),
            inner: Mutex::new(Lazy {
                factory: Some(Box::new(move || Arc::new(factory()) as Arc<dyn Service>)),
                service: None,
                listeners: Vec::new(),
            }),
        }
    }

    fn created(&self) -> Option<Arc<dyn Service>> {
        self.inner.lock().service.clone()
    }

    fn get_or_create(&self) -> Option<Arc<dyn Service>> {
        let mut inner = self.inner.lock();

        if let Some(service) = &inner.service {
            return Some(Arc::clone(service));
        }

        let factory = inner.factory.take()?;
        let service = factory();
        debug!("Created service {}", self.name);

        if service.state() != ServiceState::New {
            warn!(
                "Service {} was already {} when created",
                self.name,
                service.state()
            );
        }

        for listener in inner.listeners.drain(..) {
            service.add_listener(listener);
        }
        inner.service = Some(Arc::clone(&service));

        Some(service)
    }

    /// Whether the real service has been created yet.
    pub fn is_created(&self) -> bool {
        self.inner.lock().service.is_some()
    }
}

impl Service for LazyService {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) {
        if let Some(service) = self.get_or_create() {
            service.start();
        }
    }

    fn stop(&self) {
        if let Some(service) = self.created() {
            service.stop();
        }
    }

    fn state(&self) -> ServiceState {
        self.created()
            .map_or(ServiceState::New, |service| service.state())
    }

    fn failure(&self) -> Option<proven_service::Error> {
        self.created().and_then(|service| service.failure())
    }

    fn add_listener(&self, listener: Arc<dyn StateListener>) {
        let mut inner = self.inner.lock();

        match &inner.service {
            Some(service) => service.add_listener(listener),
            None => inner.listeners.push(listener),
        }
    }
}
