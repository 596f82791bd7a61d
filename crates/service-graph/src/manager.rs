//! Facade over a frozen service graph.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use proven_service::ServiceState;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::metadata::{self, GraphMetadata};
use crate::node::{CoordinatedNode, Graph, NodeEvent, NodeId};
use crate::{Error, Result, ServiceKey, ServiceManagerConfig};

/// Starts and stops every service of a frozen graph in dependency order.
///
/// There is no way to change the graph once built.
#[derive(Debug)]
pub struct ServiceManager {
    graph: Arc<Graph>,
    config: ServiceManagerConfig,
}

impl ServiceManager {
    pub(crate) const fn new(graph: Arc<Graph>, config: ServiceManagerConfig) -> Self {
        Self { graph, config }
    }

    /// Starts every service. Services with nothing upstream start right
    /// away, the rest as soon as what they need is running.
    pub fn start_all(&self) {
        info!("Starting {} services", self.graph.nodes.len());

        for node in &self.graph.nodes {
            node.start(&self.graph);
        }
    }

    /// Stops every service. Each one stops once nothing downstream of it is
    /// still running.
    pub fn stop_all(&self) {
        info!("Stopping {} services", self.graph.nodes.len());

        for node in &self.graph.nodes {
            node.stop(&self.graph);
        }
    }

    /// Waits until every service runs, bounded by the configured startup
    /// timeout.
    ///
    /// Returns early once any service fails. The graph itself stays
    /// fail-stop: whatever depends on the failed service keeps waiting in
    /// STARTING, so without this the wait could only end at the timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceFailed`] as soon as any service fails
    /// - [`Error::Timeout`] if the startup timeout elapses first
    pub async fn await_all_running(&self) -> Result<()> {
        self.await_state(ServiceState::Running, self.config.startup_timeout)
            .await
    }

    /// Same as [`await_all_running`](Self::await_all_running) with an
    /// explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`await_all_running`](Self::await_all_running).
    pub async fn await_all_running_for(&self, timeout: Duration) -> Result<()> {
        self.await_state(ServiceState::Running, Some(timeout)).await
    }

    /// Waits until every service has terminated or failed, bounded by the
    /// configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceFailed`] for the first failed service, once all
    ///   services have settled
    /// - [`Error::Timeout`] if the shutdown timeout elapses first
    pub async fn await_all_terminated(&self) -> Result<()> {
        self.await_state(ServiceState::Terminated, self.config.shutdown_timeout)
            .await
    }

    /// Same as [`await_all_terminated`](Self::await_all_terminated) with an
    /// explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`await_all_terminated`](Self::await_all_terminated).
    pub async fn await_all_terminated_for(&self, timeout: Duration) -> Result<()> {
        self.await_state(ServiceState::Terminated, Some(timeout))
            .await
    }

    async fn await_state(&self, goal: ServiceState, timeout: Option<Duration>) -> Result<()> {
        let settled = async {
            let mut revision = self.graph.subscribe_revision();

            loop {
                if let Some(outcome) = self.graph.outcome(goal) {
                    return outcome;
                }

                if revision.changed().await.is_err() {
                    return Err(Error::Closed);
                }
            }
        };

        let Some(timeout) = timeout else {
            return settled.await;
        };

        if let Ok(outcome) = tokio::time::timeout(timeout, settled).await {
            outcome
        } else {
            let pending = self.graph.pending(goal);
            warn!(
                "Timed out after {:?} waiting for {} services to reach {}",
                timeout,
                pending.len(),
                goal
            );

            Err(Error::Timeout {
                waiting_for: goal,
                pending,
            })
        }
    }

    /// Handle to the node registered under `key`.
    #[must_use]
    pub fn node(&self, key: &ServiceKey) -> Option<NodeHandle<'_>> {
        self.graph
            .index
            .get(key)
            .map(|&id| NodeHandle { graph: &self.graph, id })
    }

    /// Current state of every node, in registration order.
    #[must_use]
    pub fn states(&self) -> IndexMap<ServiceKey, ServiceState> {
        self.graph
            .nodes
            .iter()
            .map(|node| (node.key.clone(), node.state()))
            .collect()
    }

    /// Failure cause of every failed node.
    #[must_use]
    pub fn failures(&self) -> IndexMap<ServiceKey, Option<proven_service::Error>> {
        self.graph
            .nodes
            .iter()
            .filter(|node| node.state() == ServiceState::Failed)
            .map(|node| (node.key.clone(), node.failure()))
            .collect()
    }

    /// Stream of every node state change from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.graph.subscribe_events()
    }

    /// Registered keys, in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &ServiceKey> {
        self.graph.index.keys()
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.nodes.len()
    }

    /// Whether the graph has no services.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.nodes.is_empty()
    }

    /// Serializable description of the graph.
    #[must_use]
    pub fn metadata(&self) -> GraphMetadata {
        metadata::describe(&self.graph)
    }
}

impl fmt::Display for ServiceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&metadata::render(&self.graph))
    }
}

/// Borrowed view of one node of a [`ServiceManager`].
#[derive(Clone, Copy)]
pub struct NodeHandle<'a> {
    graph: &'a Graph,
    id: NodeId,
}

impl NodeHandle<'_> {
    fn node(&self) -> &CoordinatedNode {
        &self.graph.nodes[self.id]
    }

    fn keys(&self, ids: impl IntoIterator<Item = NodeId>) -> Vec<ServiceKey> {
        ids.into_iter()
            .map(|id| self.graph.nodes[id].key.clone())
            .collect()
    }

    /// Key the node is registered under.
    #[must_use]
    pub fn key(&self) -> &ServiceKey {
        &self.graph.nodes[self.id].key
    }

    /// Node state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.node().state()
    }

    /// State of the wrapped service.
    #[must_use]
    pub fn service_state(&self) -> ServiceState {
        self.node().service.state()
    }

    /// Failure cause once the node has failed.
    #[must_use]
    pub fn failure(&self) -> Option<proven_service::Error> {
        self.node().failure()
    }

    /// Moves the node to STARTING and starts it when upstream allows.
    pub fn start(&self) {
        self.node().start(self.graph);
    }

    /// Stops the node once nothing downstream needs it.
    pub fn stop(&self) {
        self.node().stop(self.graph);
    }

    /// Starts the wrapped service if everything upstream is running.
    pub fn try_start(&self) {
        self.node().try_start(self.graph);
    }

    /// Stops the wrapped service if everything downstream has terminated.
    pub fn try_stop(&self) {
        self.node().try_stop(self.graph);
    }

    /// Nodes that must run before this one starts.
    #[must_use]
    pub fn upstream(&self) -> Vec<ServiceKey> {
        self.keys(self.node().upstream.iter().copied())
    }

    /// Nodes that must terminate before this one stops.
    #[must_use]
    pub fn downstream(&self) -> Vec<ServiceKey> {
        self.keys(self.node().downstream.iter().copied())
    }
}

impl fmt::Debug for NodeHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.node(), f)
    }
}
