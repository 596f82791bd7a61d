//! Serializable description of a service graph and its ASCII rendering.

use std::fmt::Write;

use indexmap::{IndexMap, IndexSet};
use proven_service::ServiceState;
use serde::{Deserialize, Serialize};

use crate::node::{Graph, NodeId};

/// Description of a whole graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphMetadata {
    /// Every service keyed by its displayed key, in registration order
    pub services: IndexMap<String, NodeMetadata>,

    /// Tree rendering of the graph
    pub ascii: String,
}

/// Description of a single service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Name reported by the service
    pub service: String,

    /// Current node state
    pub state: String,

    /// Services this one depends on
    pub dependencies: Vec<String>,

    /// Services depending on this one
    pub dependents: Vec<String>,

    /// Services enhancing this one
    pub enhancements: Vec<String>,

    /// Service this one enhances
    pub enhancement_target: Option<String>,
}

pub fn describe(graph: &Graph) -> GraphMetadata {
    let name = |id: &NodeId| graph.nodes[*id].key.to_string();

    let services = graph
        .nodes
        .iter()
        .map(|node| {
            let metadata = NodeMetadata {
                service: node.service.name().to_string(),
                state: node.state().to_string(),
                dependencies: node.depends_on.iter().map(name).collect(),
                dependents: node.dependents.iter().map(name).collect(),
                enhancements: node.enhancements.iter().map(name).collect(),
                enhancement_target: node.enhancement_target.as_ref().map(name),
            };
            (node.key.to_string(), metadata)
        })
        .collect();

    GraphMetadata {
        services,
        ascii: render(graph),
    }
}

/// One tree per root; each node lists its enhancements, then its dependents.
/// A node reachable from several parents is expanded once and marked
/// `(see above)` afterwards.
///
/// ```text
/// db [RUNNING]
/// |__ cache [RUNNING]
/// \__ api [STARTING]
/// ```
pub fn render(graph: &Graph) -> String {
    let mut renderer = Renderer {
        graph,
        expanded: IndexSet::new(),
        out: String::new(),
    };

    for (id, node) in graph.nodes.iter().enumerate() {
        if node.depends_on.is_empty() && node.enhancement_target.is_none() {
            renderer.node(id, "", true, true);
        }
    }

    renderer.out
}

struct Renderer<'a> {
    graph: &'a Graph,
    expanded: IndexSet<NodeId>,
    out: String,
}

impl Renderer<'_> {
    fn node(&mut self, id: NodeId, prefix: &str, last: bool, root: bool) {
        let graph = self.graph;
        let node = &graph.nodes[id];

        if !root {
            self.out.push_str(prefix);
            self.out.push_str(if last { "\\__ " } else { "|__ " });
        }

        let _ = write!(self.out, "{} [{}]", node.key, node.state());
        if node.state() == ServiceState::Failed {
            if let Some(cause) = node.failure() {
                let _ = write!(self.out, " caused by: {cause}");
            }
        }

        if !self.expanded.insert(id) {
            self.out.push_str(" (see above)\n");
            return;
        }
        self.out.push('\n');

        let children: Vec<NodeId> = node
            .enhancements
            .iter()
            .chain(&node.dependents)
            .copied()
            .collect();

        let child_prefix = if root {
            String::new()
        } else {
            format!("{prefix}{}", if last { "    " } else { "|   " })
        };

        for (index, &child) in children.iter().enumerate() {
            self.node(child, &child_prefix, index == children.len() - 1, false);
        }
    }
}
