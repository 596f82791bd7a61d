//! Coordinated nodes and the frozen graph they live in.

use std::sync::{Arc, Weak};

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use proven_service::{Service, ServiceState, StateListener, Transition};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use crate::config::FailurePolicy;
use crate::{Error, Result, ServiceKey};

/// Index of a node in the graph arena.
pub type NodeId = usize;

/// Capacity of the node event channel.
const EVENT_CAPACITY: usize = 256;

/// A node changed state.
#[derive(Clone, Debug)]
pub struct NodeEvent {
    /// Node that changed
    pub key: ServiceKey,
    /// Previous state
    pub from: ServiceState,
    /// New state
    pub to: ServiceState,
    /// Failure cause when `to` is FAILED
    pub failure: Option<proven_service::Error>,
}

/// Mutable lifecycle bookkeeping of a node. Only touched under the node lock.
#[derive(Debug, Default)]
struct Control {
    /// `start()` has been issued to the wrapped service.
    inner_started: bool,
    /// `stop()` has been issued to the wrapped service.
    inner_stop_issued: bool,
    /// Stop arrived while the wrapped service was starting.
    stop_requested: bool,
    failure: Option<proven_service::Error>,
}

/// Wraps one service and gates its start and stop on the rest of the graph.
pub struct CoordinatedNode {
    pub(crate) key: ServiceKey,
    pub(crate) service: Arc<dyn Service>,
    pub(crate) depends_on: IndexSet<NodeId>,
    pub(crate) dependents: IndexSet<NodeId>,
    pub(crate) enhancements: IndexSet<NodeId>,
    pub(crate) enhancement_target: Option<NodeId>,
    pub(crate) upstream: IndexSet<NodeId>,
    pub(crate) downstream: IndexSet<NodeId>,
    control: Mutex<Control>,
    state: watch::Sender<ServiceState>,
}

impl CoordinatedNode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: ServiceKey,
        service: Arc<dyn Service>,
        depends_on: IndexSet<NodeId>,
        dependents: IndexSet<NodeId>,
        enhancements: IndexSet<NodeId>,
        enhancement_target: Option<NodeId>,
        upstream: IndexSet<NodeId>,
        downstream: IndexSet<NodeId>,
    ) -> Self {
        let (state, _) = watch::channel(ServiceState::New);

        Self {
            key,
            service,
            depends_on,
            dependents,
            enhancements,
            enhancement_target,
            upstream,
            downstream,
            control: Mutex::new(Control::default()),
            state,
        }
    }

    /// Current node state. Never takes the node lock.
    pub(crate) fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub(crate) fn failure(&self) -> Option<proven_service::Error> {
        self.control.lock().failure.clone()
    }

    fn set_state(&self, graph: &Graph, control: &Control, to: ServiceState) {
        let from = self.state.send_replace(to);
        debug!("{} {} -> {}", self.key, from, to);

        // Nobody listening is fine.
        let _ = graph.events.send(NodeEvent {
            key: self.key.clone(),
            from,
            to,
            failure: control.failure.clone(),
        });
        graph.revision.send_modify(|revision| *revision += 1);
    }

    /// NEW -> STARTING, then tries to start the wrapped service.
    pub(crate) fn start(&self, graph: &Graph) {
        {
            let control = self.control.lock();
            if self.state() != ServiceState::New {
                return;
            }
            self.set_state(graph, &control, ServiceState::Starting);
        }

        self.try_start(graph);
    }

    /// Starts the wrapped service once every upstream node is running.
    pub(crate) fn try_start(&self, graph: &Graph) {
        {
            let mut control = self.control.lock();

            if self.state() != ServiceState::Starting
                || control.inner_started
                || self.service.state() != ServiceState::New
            {
                return;
            }

            if !self
                .upstream
                .iter()
                .all(|&id| graph.nodes[id].state() == ServiceState::Running)
            {
                return;
            }

            control.inner_started = true;
        }

        info!("Starting service: {}", self.key);
        self.service.start();
    }

    /// Stops the wrapped service once every downstream node is gone.
    pub(crate) fn try_stop(&self, graph: &Graph) {
        {
            let mut control = self.control.lock();

            if self.state() != ServiceState::Stopping
                || control.inner_stop_issued
                || self.service.state() != ServiceState::Running
            {
                return;
            }

            if !self
                .downstream
                .iter()
                .all(|&id| graph.released(graph.nodes[id].state()))
            {
                return;
            }

            control.inner_stop_issued = true;
        }

        info!("Stopping service: {}", self.key);
        self.service.stop();
    }

    /// Requests this node to stop, whatever it is doing.
    pub(crate) fn stop(&self, graph: &Graph) {
        let cancelled = {
            let mut control = self.control.lock();

            match self.state() {
                ServiceState::New => {
                    self.set_state(graph, &control, ServiceState::Terminated);
                    true
                }
                ServiceState::Starting if !control.inner_started => {
                    debug!("{} cancelled before its service started", self.key);
                    self.set_state(graph, &control, ServiceState::Terminated);
                    true
                }
                ServiceState::Starting => {
                    control.stop_requested = true;
                    return;
                }
                ServiceState::Running => {
                    self.set_state(graph, &control, ServiceState::Stopping);
                    false
                }
                ServiceState::Stopping | ServiceState::Terminated | ServiceState::Failed => {
                    return;
                }
            }
        };

        if cancelled {
            graph.try_stop_all(&self.upstream);
        } else {
            self.try_stop(graph);
        }
    }

    fn on_service_transition(&self, graph: &Graph, transition: &Transition) {
        match transition.to {
            ServiceState::Running => {
                let stopping = {
                    let control = self.control.lock();
                    if self.state() != ServiceState::Starting {
                        return;
                    }

                    if control.stop_requested {
                        self.set_state(graph, &control, ServiceState::Stopping);
                        true
                    } else {
                        self.set_state(graph, &control, ServiceState::Running);
                        false
                    }
                };

                if stopping {
                    self.try_stop(graph);
                } else {
                    info!("Service {} started successfully", self.key);
                    graph.try_start_all(&self.downstream);
                }
            }
            ServiceState::Terminated => {
                {
                    let control = self.control.lock();
                    if self.state().is_terminal() {
                        return;
                    }
                    self.set_state(graph, &control, ServiceState::Terminated);
                }

                info!("Service {} stopped", self.key);
                graph.try_stop_all(&self.upstream);
            }
            ServiceState::Failed => {
                {
                    let mut control = self.control.lock();
                    if self.state().is_terminal() {
                        return;
                    }
                    control.failure.clone_from(&transition.failure);
                    self.set_state(graph, &control, ServiceState::Failed);
                }

                match &transition.failure {
                    Some(cause) => error!("Service {} failed: {}", self.key, cause),
                    None => error!("Service {} failed", self.key),
                }

                if graph.policy == FailurePolicy::ReleaseDependencies {
                    graph.try_stop_all(&self.upstream);
                }
            }
            ServiceState::New | ServiceState::Starting | ServiceState::Stopping => {
                debug!("Service {} is {}", self.key, transition.to);
            }
        }
    }
}

impl std::fmt::Debug for CoordinatedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatedNode")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("service", &self.service.state())
            .field("upstream", &self.upstream)
            .field("downstream", &self.downstream)
            .finish_non_exhaustive()
    }
}

/// Frozen node arena. Nothing in here changes shape after `build()`.
#[derive(Debug)]
pub struct Graph {
    pub(crate) nodes: Vec<CoordinatedNode>,
    pub(crate) index: IndexMap<ServiceKey, NodeId>,
    events: broadcast::Sender<NodeEvent>,
    revision: watch::Sender<u64>,
    policy: FailurePolicy,
}

impl Graph {
    pub(crate) fn new(
        nodes: Vec<CoordinatedNode>,
        index: IndexMap<ServiceKey, NodeId>,
        policy: FailurePolicy,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (revision, _) = watch::channel(0);

        let graph = Arc::new(Self {
            nodes,
            index,
            events,
            revision,
            policy,
        });

        for (id, node) in graph.nodes.iter().enumerate() {
            node.service.add_listener(Arc::new(NodeListener {
                graph: Arc::downgrade(&graph),
                id,
            }));
        }

        graph
    }

    /// Whether a downstream node in `state` no longer holds its upstream.
    const fn released(&self, state: ServiceState) -> bool {
        match state {
            ServiceState::Terminated => true,
            ServiceState::Failed => matches!(self.policy, FailurePolicy::ReleaseDependencies),
            _ => false,
        }
    }

    fn try_start_all(&self, ids: &IndexSet<NodeId>) {
        for &id in ids {
            self.nodes[id].try_start(self);
        }
    }

    fn try_stop_all(&self, ids: &IndexSet<NodeId>) {
        for &id in ids {
            self.nodes[id].try_stop(self);
        }
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub(crate) fn subscribe_revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Settled result of waiting for every node to reach `goal`, or `None`
    /// while nodes are still moving.
    pub(crate) fn outcome(&self, goal: ServiceState) -> Option<Result<()>> {
        let first_failure = self
            .nodes
            .iter()
            .find(|node| node.state() == ServiceState::Failed)
            .map(|node| Error::ServiceFailed {
                key: node.key.clone(),
                cause: node.failure(),
            });

        match goal {
            ServiceState::Running => {
                if let Some(error) = first_failure {
                    return Some(Err(error));
                }
                self.nodes
                    .iter()
                    .all(|node| node.state() == ServiceState::Running)
                    .then_some(Ok(()))
            }
            _ => {
                if !self.nodes.iter().all(|node| node.state().is_terminal()) {
                    return None;
                }
                Some(first_failure.map_or(Ok(()), Err))
            }
        }
    }

    /// Nodes that have not reached `goal`, with their current state.
    pub(crate) fn pending(&self, goal: ServiceState) -> Vec<(ServiceKey, ServiceState)> {
        self.nodes
            .iter()
            .map(|node| (node.key.clone(), node.state()))
            .filter(|(_, state)| match goal {
                ServiceState::Running => *state != ServiceState::Running,
                _ => !state.is_terminal(),
            })
            .collect()
    }
}

/// Forwards a service's transitions to its node.
struct NodeListener {
    graph: Weak<Graph>,
    id: NodeId,
}

impl StateListener for NodeListener {
    fn on_state_change(&self, transition: &Transition) {
        if let Some(graph) = self.graph.upgrade() {
            graph.nodes[self.id].on_service_transition(&graph, transition);
        }
    }
}
