//! Dependency analysis and list scheduling over a [`TaskGraph`].

use super::{NodeId, NodeKind, TaskGraph};
use crate::error::{Error, Result};
use fixedbitset::FixedBitSet;

/// Direct instruction-level dependencies of every instruction-bearing node.
#[derive(Debug, Clone)]
pub struct DependencyAnalysis {
    deps: Vec<FixedBitSet>,
    instructions: FixedBitSet,
}

impl DependencyAnalysis {
    /// One bitset per node, keyed by node id. Data dependencies are followed
    /// to their producer and context inputs are ignored.
    pub fn analyze(graph: &TaskGraph) -> Result<Self> {
        let n = graph.len();
        let mut instructions = FixedBitSet::with_capacity(n);
        for node in graph.nodes() {
            if node.kind.is_instruction() {
                instructions.insert(node.id);
            }
        }

        let mut deps = vec![FixedBitSet::with_capacity(n); n];
        for node in graph.nodes() {
            if !node.kind.is_instruction() {
                continue;
            }
            for input in &node.inputs {
                if let Some(producer) = resolve_producer(graph, *input)? {
                    deps[node.id].insert(producer);
                }
            }
        }

        Ok(Self { deps, instructions })
    }

    pub fn dependencies(&self, node: NodeId) -> &FixedBitSet {
        &self.deps[node]
    }

    pub fn is_instruction(&self, node: NodeId) -> bool {
        self.instructions.contains(node)
    }

    /// Instruction nodes nothing else depends on, ascending.
    pub fn sinks(&self) -> Vec<NodeId> {
        let mut depended_on = FixedBitSet::with_capacity(self.instructions.len());
        for set in &self.deps {
            depended_on.union_with(set);
        }
        self.instructions.difference(&depended_on).collect()
    }
}

/// Follow `DataDependency` links to the instruction node that produces the
/// value, or `None` for context inputs.
fn resolve_producer(graph: &TaskGraph, mut id: NodeId) -> Result<Option<NodeId>> {
    for _ in 0..=graph.len() {
        let node = graph
            .node(id)
            .ok_or_else(|| Error::config(format!("input refers to unknown node {}", id)))?;
        match node.kind {
            NodeKind::DataDependency { producer } => id = producer,
            NodeKind::Context { .. } => return Ok(None),
            _ => return Ok(Some(id)),
        }
    }
    Err(Error::config(format!(
        "data dependency chain through node {} does not terminate",
        id
    )))
}

/// List-schedule the instruction nodes: scan unscheduled nodes in ascending
/// id and emit each one as soon as every dependency has been emitted.
pub fn schedule_order(graph: &TaskGraph, analysis: &DependencyAnalysis) -> Result<Vec<NodeId>> {
    let candidates = graph.instruction_nodes();
    let mut scheduled = FixedBitSet::with_capacity(graph.len());
    let mut order = Vec::with_capacity(candidates.len());

    while order.len() < candidates.len() {
        let mut progressed = false;
        for id in &candidates {
            if scheduled.contains(*id) {
                continue;
            }
            if analysis.dependencies(*id).difference(&scheduled).next().is_none() {
                scheduled.insert(*id);
                order.push(*id);
                progressed = true;
            }
        }

        if !progressed {
            let stuck: Vec<String> = candidates
                .iter()
                .filter(|id| !scheduled.contains(**id))
                .filter_map(|id| graph.node(*id))
                .map(|node| format!("{}:{}", node.id, node.kind.name()))
                .collect();
            return Err(Error::config(format!(
                "task graph has a cycle through nodes [{}]",
                stuck.join(", ")
            )));
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ctx, stream-in a, stream-in b, task(a, b), stream-out c
    fn vector_add_graph() -> TaskGraph {
        let mut g = TaskGraph::new();
        let ctx = g.add_node(NodeKind::Context { device: 0 }, vec![]).unwrap();
        let a = g.add_node(NodeKind::StreamIn { object: 0 }, vec![ctx]).unwrap();
        let b = g.add_node(NodeKind::StreamIn { object: 1 }, vec![ctx]).unwrap();
        let t = g.add_node(NodeKind::Task { task: 0 }, vec![ctx, a, b]).unwrap();
        let dep = g.add_node(NodeKind::DataDependency { producer: t }, vec![]).unwrap();
        g.add_node(NodeKind::StreamOut { object: 2 }, vec![ctx, dep]).unwrap();
        g
    }

    #[test]
    fn test_dependencies_skip_context_and_follow_data_deps() {
        let g = vector_add_graph();
        let analysis = DependencyAnalysis::analyze(&g).unwrap();

        assert_eq!(analysis.dependencies(1).count_ones(..), 0);
        assert_eq!(analysis.dependencies(3).ones().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(analysis.dependencies(5).ones().collect::<Vec<_>>(), vec![3]);
        assert!(!analysis.is_instruction(4));
        assert_eq!(analysis.sinks(), vec![5]);
    }

    #[test]
    fn test_schedule_respects_dependencies() {
        let mut g = TaskGraph::new();
        let ctx = g.add_node(NodeKind::Context { device: 0 }, vec![]).unwrap();
        let s = g.add_node(NodeKind::StreamIn { object: 0 }, vec![ctx]).unwrap();
        let t0 = g.add_node(NodeKind::Task { task: 0 }, vec![ctx, s]).unwrap();
        let other = g.add_node(NodeKind::StreamIn { object: 1 }, vec![ctx]).unwrap();
        let d = g.add_node(NodeKind::DataDependency { producer: t0 }, vec![]).unwrap();
        let t1 = g.add_node(NodeKind::Task { task: 1 }, vec![ctx, d, other]).unwrap();

        let analysis = DependencyAnalysis::analyze(&g).unwrap();
        let order = schedule_order(&g, &analysis).unwrap();
        assert_eq!(order, vec![s, t0, other, t1]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut g = TaskGraph::new();
        let ctx = g.add_node_unchecked(NodeKind::Context { device: 0 }, vec![]);
        let t0 = g.add_node_unchecked(NodeKind::Task { task: 0 }, vec![ctx, 2]);
        g.add_node_unchecked(NodeKind::Task { task: 1 }, vec![ctx, t0]);

        let analysis = DependencyAnalysis::analyze(&g).unwrap();
        let err = schedule_order(&g, &analysis).unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert!(err.to_string().contains("1:task"));
    }

    #[test]
    fn test_unterminated_data_dependency() {
        let mut g = TaskGraph::new();
        g.add_node_unchecked(NodeKind::DataDependency { producer: 1 }, vec![]);
        g.add_node_unchecked(NodeKind::DataDependency { producer: 0 }, vec![]);
        g.add_node_unchecked(NodeKind::Task { task: 0 }, vec![0]);
        assert!(DependencyAnalysis::analyze(&g).is_err());
    }
}
