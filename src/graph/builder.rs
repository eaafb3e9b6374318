use super::{NodeId, NodeKind, TaskGraph};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::state::HostObject;
use crate::task::Task;
use std::collections::HashMap;

/// Builds a single-device task graph while binding objects and tasks into an
/// execution context.
///
/// Task inputs are wired to the last task that wrote an argument (through a
/// data-dependency node) or, failing that, to the argument's stream-in node.
pub struct GraphBuilder<'a> {
    ctx: &'a mut ExecutionContext,
    graph: TaskGraph,
    context_node: NodeId,
    last_writer: HashMap<usize, NodeId>,
    streamed_in: HashMap<usize, NodeId>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(ctx: &'a mut ExecutionContext, device: usize) -> Result<Self> {
        ctx.device(device)?;
        let mut graph = TaskGraph::new();
        let context_node = graph.add_node(NodeKind::Context { device }, vec![])?;
        Ok(Self {
            ctx,
            graph,
            context_node,
            last_writer: HashMap::new(),
            streamed_in: HashMap::new(),
        })
    }

    /// Copy `object` to the device before anything uses it.
    pub fn stream_in(&mut self, object: &HostObject) -> Result<NodeId> {
        let index = self.ctx.bind(object);
        self.ctx.state_mut(index)?.stream_in = true;
        let node = self
            .graph
            .add_node(NodeKind::StreamIn { object: index }, vec![self.context_node])?;
        self.streamed_in.insert(index, node);
        Ok(node)
    }

    pub fn task(&mut self, task: Task) -> Result<NodeId> {
        let accesses: Vec<_> = task
            .args()
            .iter()
            .map(|arg| (arg.object.clone(), arg.access))
            .collect();
        let index = self.ctx.add_task(task);

        let mut inputs = vec![self.context_node];
        let mut writes = Vec::new();
        for (object, access) in &accesses {
            let object = self.ctx.bind(object);
            if let Some(input) = self.producer_of(object)? {
                if !inputs.contains(&input) {
                    inputs.push(input);
                }
            }
            if access.writes() {
                writes.push(object);
            }
        }

        let node = self.graph.add_node(NodeKind::Task { task: index }, inputs)?;
        for object in writes {
            self.last_writer.insert(object, node);
        }
        Ok(node)
    }

    /// Copy `object` back to the host once its last writer has run.
    pub fn stream_out(&mut self, object: &HostObject) -> Result<NodeId> {
        let index = self.ctx.bind(object);
        self.ctx.state_mut(index)?.stream_out = true;

        let mut inputs = vec![self.context_node];
        if let Some(input) = self.producer_of(index)? {
            inputs.push(input);
        }
        self.graph.add_node(NodeKind::StreamOut { object: index }, inputs)
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn build(self) -> TaskGraph {
        self.graph
    }

    fn producer_of(&mut self, object: usize) -> Result<Option<NodeId>> {
        if let Some(writer) = self.last_writer.get(&object) {
            let dep = self
                .graph
                .add_node(NodeKind::DataDependency { producer: *writer }, vec![])?;
            return Ok(Some(dep));
        }
        Ok(self.streamed_in.get(&object).copied())
    }
}
