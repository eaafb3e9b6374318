//! Task graph: an arena of typed nodes with explicit inputs.

pub mod analysis;
pub mod builder;
pub mod node;

pub use analysis::{schedule_order, DependencyAnalysis};
pub use builder::GraphBuilder;
pub use node::{Node, NodeId, NodeKind};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGraph {
    nodes: Vec<Node>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node. Inputs must refer to nodes that already exist.
    pub fn add_node(&mut self, kind: NodeKind, inputs: Vec<NodeId>) -> Result<NodeId> {
        let id = self.nodes.len();
        if let Some(bad) = inputs.iter().find(|input| **input >= id) {
            return Err(Error::config(format!(
                "node {} refers to unknown input {}",
                id, bad
            )));
        }
        if let NodeKind::DataDependency { producer } = kind {
            if producer >= id {
                return Err(Error::config(format!(
                    "data dependency {} refers to unknown producer {}",
                    id, producer
                )));
            }
        }
        self.nodes.push(Node { id, inputs, kind });
        Ok(id)
    }

    /// Like [`TaskGraph::add_node`] but inputs may point forward. Only used to
    /// build graphs the compiler has to reject.
    pub fn add_node_unchecked(&mut self, kind: NodeKind, inputs: Vec<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node { id, inputs, kind });
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of the context nodes.
    pub fn contexts(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Context { .. }))
            .map(|n| n.id)
            .collect()
    }

    /// Ids of instruction-bearing nodes in ascending order; a node's position
    /// in this list is its slot.
    pub fn instruction_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.kind.is_instruction())
            .map(|n| n.id)
            .collect()
    }
}

impl std::fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for node in &self.nodes {
            writeln!(f, "{}", node)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_node_rejects_forward_inputs() {
        let mut graph = TaskGraph::new();
        let ctx = graph.add_node(NodeKind::Context { device: 0 }, vec![]).unwrap();
        assert!(graph
            .add_node(NodeKind::StreamIn { object: 0 }, vec![ctx, 5])
            .is_err());
        assert!(graph
            .add_node(NodeKind::DataDependency { producer: 3 }, vec![])
            .is_err());
    }

    #[test]
    fn test_instruction_nodes() {
        let mut graph = TaskGraph::new();
        let ctx = graph.add_node(NodeKind::Context { device: 0 }, vec![]).unwrap();
        let s = graph.add_node(NodeKind::StreamIn { object: 0 }, vec![ctx]).unwrap();
        let d = graph.add_node(NodeKind::DataDependency { producer: s }, vec![]).unwrap();
        let t = graph.add_node(NodeKind::Task { task: 0 }, vec![ctx, d]).unwrap();

        assert_eq!(graph.contexts(), vec![ctx]);
        assert_eq!(graph.instruction_nodes(), vec![s, t]);
        assert!(graph.to_string().contains("task(0)"));
    }
}
