use serde::{Deserialize, Serialize};

/// Arena index of a node.
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Context { device: usize },
    Task { task: usize },
    StreamIn { object: usize },
    StreamOut { object: usize },
    DataDependency { producer: NodeId },
}

impl NodeKind {
    /// Whether the node compiles to a launch or transfer instruction.
    pub fn is_instruction(&self) -> bool {
        matches!(
            self,
            NodeKind::Task { .. } | NodeKind::StreamIn { .. } | NodeKind::StreamOut { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Context { .. } => "context",
            NodeKind::Task { .. } => "task",
            NodeKind::StreamIn { .. } => "stream-in",
            NodeKind::StreamOut { .. } => "stream-out",
            NodeKind::DataDependency { .. } => "data-dependency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub inputs: Vec<NodeId>,
    pub kind: NodeKind,
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            NodeKind::Context { device } => write!(f, "[{}] context(device={})", self.id, device),
            NodeKind::Task { task } => write!(f, "[{}] task({})", self.id, task),
            NodeKind::StreamIn { object } => write!(f, "[{}] stream-in({})", self.id, object),
            NodeKind::StreamOut { object } => write!(f, "[{}] stream-out({})", self.id, object),
            NodeKind::DataDependency { producer } => write!(f, "[{}] dep(<- {})", self.id, producer),
        }?;
        if !self.inputs.is_empty() {
            write!(f, " inputs={:?}", self.inputs)?;
        }
        Ok(())
    }
}
