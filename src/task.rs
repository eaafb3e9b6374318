//! Task metadata: which kernel to run, over which objects, on what domain.

use crate::state::HostObject;
use std::fmt;

/// How a task uses one of its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn reads(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

#[derive(Debug, Clone)]
pub struct TaskArg {
    pub object: HostObject,
    pub access: Access,
}

/// One kernel invocation in a task graph.
#[derive(Clone)]
pub struct Task {
    id: String,
    kernel: String,
    args: Vec<TaskArg>,
    domain: Vec<u64>,
    enable_exceptions: bool,
}

impl Task {
    /// Create a task that runs the kernel registered as `kernel`.
    pub fn new<I: Into<String>, K: Into<String>>(id: I, kernel: K) -> Self {
        Self {
            id: id.into(),
            kernel: kernel.into(),
            args: Vec::new(),
            domain: Vec::new(),
            enable_exceptions: false,
        }
    }

    pub fn arg(mut self, object: &HostObject, access: Access) -> Self {
        self.args.push(TaskArg {
            object: object.clone(),
            access,
        });
        self
    }

    pub fn read(self, object: &HostObject) -> Self {
        self.arg(object, Access::Read)
    }

    pub fn write(self, object: &HostObject) -> Self {
        self.arg(object, Access::Write)
    }

    pub fn read_write(self, object: &HostObject) -> Self {
        self.arg(object, Access::ReadWrite)
    }

    /// Iteration space, one cardinality per dimension.
    pub fn domain(mut self, domain: &[u64]) -> Self {
        self.domain = domain.to_vec();
        self
    }

    /// Block on each launch and surface kernel-reported failures.
    pub fn enable_exceptions(mut self, enable: bool) -> Self {
        self.enable_exceptions = enable;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kernel(&self) -> &str {
        &self.kernel
    }

    pub fn args(&self) -> &[TaskArg] {
        &self.args
    }

    pub fn domain_sizes(&self) -> &[u64] {
        &self.domain
    }

    pub fn exceptions_enabled(&self) -> bool {
        self.enable_exceptions
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kernel", &self.kernel)
            .field("args", &self.args.len())
            .field("domain", &self.domain)
            .field("enable_exceptions", &self.enable_exceptions)
            .finish()
    }
}
