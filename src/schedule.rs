//! Compile-once, execute-many front end.

use crate::bytecode::BytecodeProgram;
use crate::compiler::compile;
use crate::config::Config;
use crate::context::ExecutionContext;
use crate::device::DeviceBackend;
use crate::error::{Error, Result};
use crate::graph::{GraphBuilder, TaskGraph};
use crate::runtime::Runtime;
use crate::state::HostObject;
use crate::task::Task;
use crate::telemetry::Metrics;
use crate::vm::{ExecutionHandle, VirtualMachine};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
enum Step {
    StreamIn(HostObject),
    Task(Task),
    StreamOut(HostObject),
}

/// A task graph on one device, declared step by step.
///
/// ```no_run
/// use accelvm::prelude::*;
///
/// let runtime = Runtime::new(Config::default())?;
/// let device = runtime.host_device()?;
/// device.register_kernel("vector_add", VectorAddKernel::<f32>::new());
///
/// let a = runtime.array(&[1.0f32; 1024]);
/// let b = runtime.array(&[2.0f32; 1024]);
/// let c = runtime.zeroed::<f32>(1024);
///
/// let mut schedule = runtime.schedule("s0", device);
/// schedule
///     .stream_in(&a)
///     .stream_in(&b)
///     .task(Task::new("t0", "vector_add").read(&a).read(&b).write(&c).domain(&[1024]))
///     .stream_out(&c);
/// schedule.execute()?.wait()?;
/// # Ok::<(), accelvm::Error>(())
/// ```
pub struct TaskSchedule {
    config: Config,
    metrics: Arc<Metrics>,
    ctx: ExecutionContext,
    device: usize,
    steps: Vec<Step>,
    graph: Option<TaskGraph>,
    vm: Option<VirtualMachine>,
}

impl TaskSchedule {
    pub fn new<S: Into<String>>(runtime: &Runtime, name: S, device: Arc<dyn DeviceBackend>) -> Self {
        let mut ctx = runtime.context(name);
        let device = ctx.add_device(device);
        Self {
            config: runtime.config().clone(),
            metrics: Arc::clone(runtime.metrics()),
            ctx,
            device,
            steps: Vec::new(),
            graph: None,
            vm: None,
        }
    }

    pub fn stream_in(&mut self, object: &HostObject) -> &mut Self {
        self.push(Step::StreamIn(object.clone()))
    }

    pub fn task(&mut self, task: Task) -> &mut Self {
        self.push(Step::Task(task))
    }

    pub fn stream_out(&mut self, object: &HostObject) -> &mut Self {
        self.push(Step::StreamOut(object.clone()))
    }

    /// Adding a step after compilation discards the graph, the program and
    /// the context's bindings; the next `compile` or `execute` starts over.
    fn push(&mut self, step: Step) -> &mut Self {
        if self.graph.take().is_some() {
            self.vm = None;
            if let Ok(device) = self.ctx.device(self.device).map(Arc::clone) {
                let mut ctx = ExecutionContext::new(self.ctx.name().to_string(), Arc::clone(self.ctx.registry()));
                self.device = ctx.add_device(device);
                self.ctx = ctx;
            }
            debug!(schedule = self.ctx.name(), steps = self.steps.len() + 1, "schedule changed after compilation");
        }
        self.steps.push(step);
        self
    }

    /// Override the configuration used for later compilations, e.g. to
    /// raise `max_bytecode_size` after an encoding error.
    pub fn set_config(&mut self, config: Config) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.vm = None;
        Ok(())
    }

    /// Compile the declared steps, splitting transfers into `batch_size`
    /// byte chunks when given.
    pub fn compile(&mut self, batch_size: Option<u64>) -> Result<&BytecodeProgram> {
        if self.graph.is_none() {
            self.graph = Some(self.build_graph()?);
        }
        let graph = self
            .graph
            .as_ref()
            .ok_or_else(|| Error::config("task graph is missing"))?;

        let program = compile(graph, &self.ctx, batch_size, &self.config)?;
        debug!(
            schedule = self.ctx.name(),
            bytes = program.size(),
            batch_size = ?batch_size,
            "schedule compiled"
        );
        let vm = VirtualMachine::new(program, self.config.clone())?.with_metrics(Arc::clone(&self.metrics));
        Ok(self.vm.insert(vm).program())
    }

    /// Run the compiled program, compiling it unbatched first if needed.
    pub fn execute(&mut self) -> Result<ExecutionHandle> {
        if self.vm.is_none() {
            self.compile(None)?;
        }
        let vm = self
            .vm
            .as_ref()
            .ok_or_else(|| Error::config("schedule has not been compiled"))?;
        vm.execute(&mut self.ctx)
    }

    /// Blocking copy of the device contents of `objects` back to the host.
    pub fn sync(&mut self, objects: &[&HostObject]) -> Result<()> {
        self.ctx.sync(objects)
    }

    /// Write the compiled program to `path` as JSON.
    pub fn dump_program<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.program()
            .ok_or_else(|| Error::config("schedule has not been compiled"))?
            .dump(path)
    }

    pub fn program(&self) -> Option<&BytecodeProgram> {
        self.vm.as_ref().map(|vm| vm.program())
    }

    pub fn graph(&self) -> Option<&TaskGraph> {
        self.graph.as_ref()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    fn build_graph(&mut self) -> Result<TaskGraph> {
        let mut builder = GraphBuilder::new(&mut self.ctx, self.device)?;
        for step in &self.steps {
            match step {
                Step::StreamIn(object) => builder.stream_in(object)?,
                Step::Task(task) => builder.task(task.clone())?,
                Step::StreamOut(object) => builder.stream_out(object)?,
            };
        }
        Ok(builder.build())
    }
}

impl std::fmt::Debug for TaskSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSchedule")
            .field("context", &self.ctx)
            .field("steps", &self.steps.len())
            .field("compiled", &self.vm.is_some())
            .finish()
    }
}
