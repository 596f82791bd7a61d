//! Collects services and their relationships, then builds a [`ServiceManager`].

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use proven_service::Service;
use tracing::{info, warn};

use crate::lazy::LazyService;
use crate::link::Linker;
use crate::{Error, Result, ServiceKey, ServiceManager, ServiceManagerConfig};

/// Builds a graph of services which defer start up and shut down until the
/// services around them are ready.
///
/// Relationships may be declared in any order relative to registration; they
/// are only resolved by [`build`](Self::build).
#[derive(Default)]
pub struct ServiceGraphBuilder {
    services: IndexMap<ServiceKey, Arc<dyn Service>>,
    /// (dependent, depends on)
    dependencies: IndexSet<(ServiceKey, ServiceKey)>,
    /// enhancement -> target
    enhancements: IndexMap<ServiceKey, ServiceKey>,
    config: ServiceManagerConfig,
}

impl ServiceGraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration of the built manager.
    #[must_use]
    pub fn with_config(mut self, config: ServiceManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers `service` under `key`. Registering a key again replaces the
    /// earlier service but keeps the relationships declared for the key.
    pub fn add_service<S: Service>(&mut self, key: impl Into<ServiceKey>, service: S) -> &mut Self {
        self.add_shared_service(key, Arc::new(service))
    }

    /// Registers an already shared service under `key`.
    pub fn add_shared_service(
        &mut self,
        key: impl Into<ServiceKey>,
        service: Arc<dyn Service>,
    ) -> &mut Self {
        let key = key.into();

        if self.services.insert(key.clone(), service).is_some() {
            warn!("Service {} registered more than once, replacing it", key);
        }

        self
    }

    /// Registers a service under `key` that is only created by `factory`
    /// when its node starts it. Until then it reports NEW under `name`.
    pub fn add_lazy_service<S, F>(
        &mut self,
        key: impl Into<ServiceKey>,
        name: impl Into<String>,
        factory: F,
    ) -> &mut Self
    where
        S: Service,
        F: FnOnce() -> S + Send + 'static,
    {
        self.add_service(key, LazyService::new(name, factory))
    }

    /// `dependent` must start after `depends_on`, and stop before it.
    pub fn add_dependency(
        &mut self,
        dependent: impl Into<ServiceKey>,
        depends_on: impl Into<ServiceKey>,
    ) -> &mut Self {
        self.dependencies
            .insert((dependent.into(), depends_on.into()));
        self
    }

    /// `enhancement` starts right after `target` and stops right before it.
    /// Anything depending on `target` also waits for `enhancement`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateEnhancement`] if `enhancement` already
    /// enhances a different service.
    pub fn enhance_service(
        &mut self,
        target: impl Into<ServiceKey>,
        enhancement: impl Into<ServiceKey>,
    ) -> Result<&mut Self> {
        let target = target.into();
        let enhancement = enhancement.into();

        if let Some(existing_target) = self.enhancements.get(&enhancement) {
            if *existing_target != target {
                return Err(Error::DuplicateEnhancement {
                    enhancement,
                    existing_target: existing_target.clone(),
                    target,
                });
            }
            return Ok(self);
        }

        self.enhancements.insert(enhancement, target);
        Ok(self)
    }

    /// Validates the graph and freezes it into a [`ServiceManager`].
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownService`] if a relationship names an unregistered key
    /// - [`Error::GraphFrozen`] if a registered service is no longer NEW
    /// - [`Error::Cycle`] if the relationships do not form a DAG
    pub fn build(self) -> Result<ServiceManager> {
        self.validate()?;

        let mut linker = Linker::new();
        for (key, service) in &self.services {
            linker.push(key.clone(), Arc::clone(service))?;
        }

        let id_of = |key: &ServiceKey| {
            linker.id_of(key).ok_or_else(|| Error::UnknownService {
                missing: key.clone(),
                required_by: Vec::new(),
            })
        };

        let mut dependents: IndexMap<usize, Vec<usize>> = IndexMap::new();
        for (dependent, depends_on) in &self.dependencies {
            dependents
                .entry(id_of(depends_on)?)
                .or_default()
                .push(id_of(dependent)?);
        }

        let mut enhancements: IndexMap<usize, Vec<usize>> = IndexMap::new();
        for (enhancement, target) in &self.enhancements {
            enhancements
                .entry(id_of(target)?)
                .or_default()
                .push(id_of(enhancement)?);
        }

        for (node, enhancements) in enhancements {
            linker.add_enhancements(node, &enhancements)?;
        }
        for (node, dependents) in dependents {
            linker.add_dependents(node, &dependents)?;
        }

        let graph = linker.freeze(self.config.failure_policy)?;
        info!("Built service graph with {} services", graph.nodes.len());

        Ok(ServiceManager::new(graph, self.config))
    }

    /// Every key named by a relationship must be registered.
    fn validate(&self) -> Result<()> {
        // missing key -> keys that need it
        let mut missing: IndexMap<&ServiceKey, Vec<ServiceKey>> = IndexMap::new();

        for (dependent, depends_on) in &self.dependencies {
            if !self.services.contains_key(depends_on) {
                missing.entry(depends_on).or_default().push(dependent.clone());
            }
            if !self.services.contains_key(dependent) {
                missing.entry(dependent).or_default();
            }
        }

        for (enhancement, target) in &self.enhancements {
            if !self.services.contains_key(target) {
                missing.entry(target).or_default().push(enhancement.clone());
            }
            if !self.services.contains_key(enhancement) {
                missing.entry(enhancement).or_default();
            }
        }

        match missing.into_iter().next() {
            Some((key, required_by)) => Err(Error::UnknownService {
                missing: key.clone(),
                required_by,
            }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ServiceGraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceGraphBuilder")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("dependencies", &self.dependencies)
            .field("enhancements", &self.enhancements)
            .field("config", &self.config)
            .finish()
    }
}
