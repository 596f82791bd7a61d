//! Edge bookkeeping between nodes before the graph is frozen.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use proven_service::{Service, ServiceState};

use crate::config::FailurePolicy;
use crate::node::{CoordinatedNode, Graph, NodeId};
use crate::{Error, Result, ServiceKey};

/// A node whose edges are still being recorded.
struct PendingNode {
    key: ServiceKey,
    service: Arc<dyn Service>,
    depends_on: IndexSet<NodeId>,
    dependents: IndexSet<NodeId>,
    enhancements: IndexSet<NodeId>,
    enhancement_target: Option<NodeId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Records edges between nodes, checks the result is a DAG and freezes it.
#[derive(Default)]
pub struct Linker {
    nodes: Vec<PendingNode>,
    index: IndexMap<ServiceKey, NodeId>,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node for `service`, which must still be NEW.
    pub fn push(&mut self, key: ServiceKey, service: Arc<dyn Service>) -> Result<NodeId> {
        if service.state() != ServiceState::New {
            return Err(Error::GraphFrozen { key });
        }

        let id = self.nodes.len();
        self.index.insert(key.clone(), id);
        self.nodes.push(PendingNode {
            key,
            service,
            depends_on: IndexSet::new(),
            dependents: IndexSet::new(),
            enhancements: IndexSet::new(),
            enhancement_target: None,
        });

        Ok(id)
    }

    pub fn id_of(&self, key: &ServiceKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    fn ensure_new(&self, id: NodeId) -> Result<()> {
        let node = &self.nodes[id];
        if node.service.state() == ServiceState::New {
            Ok(())
        } else {
            Err(Error::GraphFrozen {
                key: node.key.clone(),
            })
        }
    }

    /// `dependents` start after `node` and stop before it.
    pub fn add_dependents(&mut self, node: NodeId, dependents: &[NodeId]) -> Result<()> {
        self.ensure_new(node)?;
        for &dependent in dependents {
            self.ensure_new(dependent)?;
        }

        for &dependent in dependents {
            self.nodes[node].dependents.insert(dependent);
            self.nodes[dependent].depends_on.insert(node);
        }

        Ok(())
    }

    /// `enhancements` start right after `node` and stop right before it.
    pub fn add_enhancements(&mut self, node: NodeId, enhancements: &[NodeId]) -> Result<()> {
        self.ensure_new(node)?;
        for &enhancement in enhancements {
            self.ensure_new(enhancement)?;

            if let Some(existing) = self.nodes[enhancement].enhancement_target {
                if existing != node {
                    return Err(Error::DuplicateEnhancement {
                        enhancement: self.nodes[enhancement].key.clone(),
                        existing_target: self.nodes[existing].key.clone(),
                        target: self.nodes[node].key.clone(),
                    });
                }
            }
        }

        for &enhancement in enhancements {
            self.nodes[node].enhancements.insert(enhancement);
            self.nodes[enhancement].enhancement_target = Some(node);
        }

        Ok(())
    }

    /// Nodes that may only start once `id` runs: its enhancements, its
    /// dependents, and the dependents of every target up its enhancement chain.
    fn downstream_of(&self, id: NodeId) -> IndexSet<NodeId> {
        let node = &self.nodes[id];
        let mut downstream: IndexSet<NodeId> = node
            .enhancements
            .iter()
            .chain(&node.dependents)
            .copied()
            .collect();

        let mut seen = IndexSet::from([id]);
        let mut target = node.enhancement_target;
        while let Some(current) = target {
            if !seen.insert(current) {
                break;
            }
            downstream.extend(self.nodes[current].dependents.iter().copied());
            target = self.nodes[current].enhancement_target;
        }

        downstream
    }

    /// Nodes that must run before `id` starts: its target, its dependencies,
    /// and every enhancement hanging off those dependencies.
    fn upstream_of(&self, id: NodeId) -> IndexSet<NodeId> {
        let node = &self.nodes[id];
        let mut upstream: IndexSet<NodeId> = node
            .enhancement_target
            .iter()
            .chain(&node.depends_on)
            .copied()
            .collect();

        let mut stack: Vec<NodeId> = node.depends_on.iter().copied().collect();
        let mut seen: IndexSet<NodeId> = stack.iter().copied().collect();
        while let Some(current) = stack.pop() {
            for &enhancement in &self.nodes[current].enhancements {
                if seen.insert(enhancement) {
                    upstream.insert(enhancement);
                    stack.push(enhancement);
                }
            }
        }

        upstream
    }

    /// First cycle in the must-start-before relation, listed in depends-on
    /// order starting from the node where it was detected.
    fn find_cycle(&self, downstream: &[IndexSet<NodeId>]) -> Option<Vec<NodeId>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path = Vec::new();

        (0..self.nodes.len()).find_map(|id| visit(id, downstream, &mut marks, &mut path))
    }

    /// Validates the linked graph and freezes it.
    pub fn freeze(self, policy: FailurePolicy) -> Result<Arc<Graph>> {
        let downstream: Vec<IndexSet<NodeId>> =
            (0..self.nodes.len()).map(|id| self.downstream_of(id)).collect();

        if let Some(cycle) = self.find_cycle(&downstream) {
            return Err(Error::Cycle {
                cycle: cycle
                    .into_iter()
                    .map(|id| self.nodes[id].key.clone())
                    .collect(),
            });
        }

        let upstream: Vec<IndexSet<NodeId>> =
            (0..self.nodes.len()).map(|id| self.upstream_of(id)).collect();

        let nodes = self
            .nodes
            .into_iter()
            .zip(upstream.into_iter().zip(downstream))
            .map(|(node, (upstream, downstream))| {
                CoordinatedNode::new(
                    node.key,
                    node.service,
                    node.depends_on,
                    node.dependents,
                    node.enhancements,
                    node.enhancement_target,
                    upstream,
                    downstream,
                )
            })
            .collect();

        Ok(Graph::new(nodes, self.index, policy))
    }
}

fn visit(
    id: NodeId,
    downstream: &[IndexSet<NodeId>],
    marks: &mut [Mark],
    path: &mut Vec<NodeId>,
) -> Option<Vec<NodeId>> {
    match marks[id] {
        Mark::Done => return None,
        Mark::Visiting => {
            let start = path.iter().position(|&node| node == id)?;
            let mut cycle = vec![id];
            cycle.extend(path[start + 1..].iter().rev());
            return Some(cycle);
        }
        Mark::Unvisited => {}
    }

    marks[id] = Mark::Visiting;
    path.push(id);

    for &next in &downstream[id] {
        if let Some(cycle) = visit(next, downstream, marks, path) {
            return Some(cycle);
        }
    }

    path.pop();
    marks[id] = Mark::Done;
    None
}
