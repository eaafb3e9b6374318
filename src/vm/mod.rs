//! Bytecode interpreter.
//!
//! A [`VirtualMachine`] decodes its program once and then replays it against
//! an [`ExecutionContext`] as often as needed. Instructions are issued in
//! program order; each one is handed the events of its dependency list as a
//! wait-list, so ordering on the device follows the graph rather than the
//! submission order alone.

use crate::bytecode::{BytecodeProgram, Instruction, Opcode};
use crate::config::Config;
use crate::context::ExecutionContext;
use crate::device::{DeviceBackend, EventId, EventInfo, EventStatus};
use crate::error::{Error, Result};
use crate::scheduler::{compute_launch_geometry, GeometryTuning};
use crate::state::{ObjectHandle, ObjectRegistry};
use crate::telemetry::Metrics;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Progress of one instruction within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionState {
    Pending,
    Issued,
    Completed,
}

/// Events collected for one dependency list.
#[derive(Debug, Default)]
struct EventList {
    events: Vec<EventId>,
    /// Set once a consumer waited on the list; the next append starts afresh.
    consumed: bool,
}

pub struct VirtualMachine {
    program: BytecodeProgram,
    instructions: Vec<Instruction>,
    config: Config,
    tuning: GeometryTuning,
    metrics: Option<Arc<Metrics>>,
}

impl VirtualMachine {
    pub fn new(program: BytecodeProgram, config: Config) -> Result<Self> {
        config.validate()?;
        let instructions = program.decode()?;
        match instructions.first() {
            Some(Instruction::Begin { dep_lists, .. }) if *dep_lists == program.dep_lists().len() => {}
            Some(Instruction::Begin { dep_lists, .. }) => {
                return Err(Error::decode(
                    0,
                    format!(
                        "BEGIN declares {} dependency lists, program has {}",
                        dep_lists,
                        program.dep_lists().len()
                    ),
                ))
            }
            _ => return Err(Error::decode(0, "program does not start with BEGIN")),
        }

        let tuning = GeometryTuning::from(&config);
        Ok(Self {
            program,
            instructions,
            config,
            tuning,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn program(&self) -> &BytecodeProgram {
        &self.program
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Run the program once. On a fatal error the context's device buffers
    /// are released and the error names the failing instruction.
    pub fn execute(&self, ctx: &mut ExecutionContext) -> Result<ExecutionHandle> {
        let started = Instant::now();
        let mut run = Run::new(self, ctx.registry().clone());

        for (index, instruction) in self.instructions.iter().enumerate() {
            if let Err(err) = run.step(ctx, index, instruction) {
                warn!(
                    context = ctx.name(),
                    index,
                    opcode = instruction.opcode().name(),
                    error = %err,
                    "execution aborted"
                );
                ctx.invalidate();
                return Err(err.at_instruction(index, instruction.opcode().name()));
            }
        }

        let handle = run.finish()?;
        let elapsed = started.elapsed().as_nanos() as u64;
        if let Some(metrics) = &self.metrics {
            metrics.record_execution(elapsed);
        }
        debug!(
            context = ctx.name(),
            instructions = self.instructions.len(),
            events = handle.events.len(),
            elapsed_ns = elapsed,
            "program issued"
        );
        Ok(handle)
    }

    /// Look up an event on the device that produced it.
    pub fn resolve_event(&self, ctx: &ExecutionContext, device: usize, event: EventId) -> Result<EventInfo> {
        ctx.device(device)?.resolve_event(event)
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("instructions", &self.instructions.len())
            .field("bytes", &self.program.size())
            .finish()
    }
}

/// Mutable state of a single execution.
struct Run<'vm> {
    vm: &'vm VirtualMachine,
    registry: Arc<ObjectRegistry>,
    lists: Vec<EventList>,
    device: Option<(usize, Arc<dyn DeviceBackend>)>,
    last_event: Option<EventId>,
    final_event: Option<EventId>,
    states: Vec<InstructionState>,
    events: Vec<(usize, EventId)>,
    pending_owners: Vec<ObjectHandle>,
}

impl<'vm> Run<'vm> {
    fn new(vm: &'vm VirtualMachine, registry: Arc<ObjectRegistry>) -> Self {
        Self {
            vm,
            registry,
            lists: (0..vm.program.dep_lists().len()).map(|_| EventList::default()).collect(),
            device: None,
            last_event: None,
            final_event: None,
            states: vec![InstructionState::Pending; vm.instructions.len()],
            events: Vec::new(),
            pending_owners: Vec::new(),
        }
    }

    fn backend(&self) -> Result<(usize, Arc<dyn DeviceBackend>)> {
        self.device
            .as_ref()
            .map(|(index, backend)| (*index, Arc::clone(backend)))
            .ok_or_else(|| Error::config("instruction issued before CONTEXT"))
    }

    /// Wait-list of `deps`; the list is marked consumed.
    fn take_wait(&mut self, deps: Option<usize>) -> Vec<EventId> {
        match deps.and_then(|list| self.lists.get_mut(list)) {
            Some(list) => {
                list.consumed = true;
                list.events.clone()
            }
            None => Vec::new(),
        }
    }

    fn record(&mut self, index: usize, event: Option<EventId>) {
        self.last_event = event;
        match event {
            Some(event) => {
                self.states[index] = InstructionState::Issued;
                self.events.push((index, event));
            }
            None => self.states[index] = InstructionState::Completed,
        }
        if let Some(metrics) = &self.vm.metrics {
            metrics.record_instruction();
        }
    }

    fn step(&mut self, ctx: &mut ExecutionContext, index: usize, instruction: &Instruction) -> Result<()> {
        trace!(index, %instruction, "issue");
        match *instruction {
            Instruction::Begin { tasks, .. } => {
                if tasks > ctx.num_tasks() {
                    return Err(Error::config(format!(
                        "program expects {} tasks, context {} has {}",
                        tasks,
                        ctx.name(),
                        ctx.num_tasks()
                    )));
                }
                self.record(index, None);
            }
            Instruction::Context { device } => {
                ctx.set_active_device(device)?;
                self.device = Some((device, Arc::clone(ctx.device(device)?)));
                self.record(index, None);
            }
            Instruction::StreamIn {
                object,
                offset,
                length,
                deps,
            } => {
                let wait = self.take_wait(deps);
                let event = self.stream_in(ctx, object, offset, length, &wait)?;
                self.record(index, event);
            }
            Instruction::Launch {
                task,
                device,
                deps,
                offset,
                threads,
            } => {
                let wait = self.take_wait(deps);
                let event = self.launch(ctx, task, device, offset, threads, &wait)?;
                self.record(index, Some(event));
            }
            Instruction::StreamOut {
                object,
                offset,
                length,
                deps,
            } => {
                let wait = self.take_wait(deps);
                let event = self.stream_out(ctx, object, offset, length, &wait, false)?;
                self.record(index, event);
            }
            Instruction::StreamOutBlocking {
                object,
                offset,
                length,
                deps,
            } => {
                let wait = self.take_wait(deps);
                let event = self.stream_out(ctx, object, offset, length, &wait, true)?;
                self.record(index, event);
            }
            Instruction::AddDep { list } => {
                let event = self.last_event;
                let entry = self
                    .lists
                    .get_mut(list)
                    .ok_or_else(|| Error::config(format!("dependency list {} does not exist", list)))?;
                if entry.consumed {
                    entry.events.clear();
                    entry.consumed = false;
                }
                if let Some(event) = event {
                    entry.events.push(event);
                }
                // last_event stays put: consecutive ADD_DEPs append the same event
                self.states[index] = InstructionState::Completed;
            }
            Instruction::Barrier { deps } | Instruction::Marker { deps } => {
                let wait = self.take_wait(deps);
                let (_, backend) = self.backend()?;
                let event = if instruction.opcode() == Opcode::Barrier {
                    backend.barrier(&wait)?
                } else {
                    backend.marker(&wait)?
                };
                if let Some(metrics) = &self.vm.metrics {
                    metrics.record_barrier();
                }
                self.final_event = Some(event);
                self.record(index, Some(event));
            }
            Instruction::End => self.record(index, None),
        }
        Ok(())
    }

    fn stream_in(
        &mut self,
        ctx: &mut ExecutionContext,
        object: usize,
        offset: u64,
        length: u64,
        wait: &[EventId],
    ) -> Result<Option<EventId>> {
        let (device, backend) = self.backend()?;
        let host = ctx.object(object)?.clone();
        let size = if length > 0 { length as usize } else { host.byte_len() };
        let buffer = ctx.ensure_buffer(device, object, size)?;

        let event = if host.is_scalar() {
            let written = ctx.state(object)?.contents_written();
            if written && !self.vm.config.benchmarking_mode {
                None
            } else {
                Some(backend.write(buffer, host.bytes(0, size)?, wait, true)?)
            }
        } else {
            Some(backend.write(buffer, host.bytes(offset as usize, size)?, wait, false)?)
        };

        if event.is_some() {
            let host_offset = if host.is_scalar() { 0 } else { offset as usize };
            ctx.state_mut(object)?.mark_written(host_offset);
            if let Some(metrics) = &self.vm.metrics {
                metrics.record_bytes_in(size as u64);
            }
        }
        Ok(event)
    }

    fn launch(
        &mut self,
        ctx: &mut ExecutionContext,
        task_index: usize,
        device: usize,
        offset: u64,
        threads: u64,
        wait: &[EventId],
    ) -> Result<EventId> {
        let kernel = ctx.kernel(device, task_index)?;
        let backend = Arc::clone(ctx.device(device)?);
        let task = ctx.task(task_index)?.clone();

        let mut args = Vec::with_capacity(task.args().len());
        let mut written = Vec::new();
        for arg in task.args() {
            let object = ctx.object_index(arg.object.handle()).ok_or_else(|| {
                Error::config(format!("{} is not bound to context {}", arg.object.handle(), ctx.name()))
            })?;
            let size = match (threads, arg.object.element_type()) {
                (t, Some(elem)) if t > 0 => t as usize * elem.size(),
                _ => arg.object.byte_len(),
            };
            let existing = ctx.state(object)?;
            let buffer = match existing.buffer() {
                // inputs keep whatever size their stream-in chose
                Some(buffer) if !arg.access.writes() => buffer,
                _ => ctx.ensure_buffer(device, object, size)?,
            };
            args.push(buffer);
            if arg.access.writes() {
                written.push(object);
            }
        }

        let geometry = compute_launch_geometry(
            backend.limits().class,
            task.domain_sizes(),
            threads,
            &backend.limits(),
            &self.vm.tuning,
        )?;
        trace!(task = task.id(), %geometry, offset, "launch");

        let event = backend.launch(kernel, &args, &geometry, wait)?;
        if let Some(metrics) = &self.vm.metrics {
            metrics.record_kernel_launch();
        }

        if task.exceptions_enabled() {
            backend.wait(&[event])?;
            if let EventStatus::Failed(message) = backend.resolve_event(event)?.status {
                return Err(Error::device(
                    device,
                    event.0,
                    format!("task {} failed: {}", task.id(), message),
                ));
            }
        }

        for object in written {
            ctx.state_mut(object)?.mark_written(offset as usize);
        }
        Ok(event)
    }

    fn stream_out(
        &mut self,
        ctx: &mut ExecutionContext,
        object: usize,
        offset: u64,
        length: u64,
        wait: &[EventId],
        blocking: bool,
    ) -> Result<Option<EventId>> {
        let (device, backend) = self.backend()?;
        let host = ctx.object(object)?.clone();
        let state = ctx.state(object)?;
        let buffer = match (state.is_valid(), state.buffer()) {
            (true, Some(buffer)) => buffer,
            _ => {
                return Err(Error::config(format!(
                    "{} has no valid device copy to read",
                    host.handle()
                )))
            }
        };
        let size = if length > 0 { length as usize } else { host.byte_len() };
        if size > state.buffer_size() {
            return Err(Error::config(format!(
                "reading {} bytes of {} from a {}-byte buffer",
                size,
                host.handle(),
                state.buffer_size()
            )));
        }

        let event = backend.read(buffer, host.memory(), offset as usize, size, wait, blocking)?;
        if let Some(metrics) = &self.vm.metrics {
            metrics.record_bytes_out(size as u64);
        }

        if blocking {
            self.registry.set_owner(host.handle(), device, true);
            Ok(None)
        } else {
            self.pending_owners.push(host.handle());
            Ok(Some(event))
        }
    }

    fn finish(self) -> Result<ExecutionHandle> {
        let (device, backend) = self.backend()?;
        Ok(ExecutionHandle {
            device,
            backend,
            registry: self.registry,
            final_event: self.final_event,
            states: self.states,
            events: self.events,
            pending_owners: self.pending_owners,
        })
    }
}

/// Result of issuing a program. Issued work may still be running.
pub struct ExecutionHandle {
    device: usize,
    backend: Arc<dyn DeviceBackend>,
    registry: Arc<ObjectRegistry>,
    final_event: Option<EventId>,
    states: Vec<InstructionState>,
    events: Vec<(usize, EventId)>,
    pending_owners: Vec<ObjectHandle>,
}

impl ExecutionHandle {
    pub fn device(&self) -> usize {
        self.device
    }

    /// Completion handle of the whole program, if it ends with a barrier.
    pub fn final_event(&self) -> Option<EventId> {
        self.final_event
    }

    pub fn instruction_state(&self, index: usize) -> Option<InstructionState> {
        self.states.get(index).copied()
    }

    pub fn states(&self) -> &[InstructionState] {
        &self.states
    }

    /// Every event issued, with the index of the instruction that issued it.
    pub fn events(&self) -> &[(usize, EventId)] {
        &self.events
    }

    pub fn resolve_event(&self, event: EventId) -> Result<EventInfo> {
        self.backend.resolve_event(event)
    }

    /// Block until all issued work has finished; the first failed event is
    /// reported as a device error.
    pub fn wait(&mut self) -> Result<()> {
        let ids: Vec<EventId> = self.events.iter().map(|(_, e)| *e).collect();
        self.backend.wait(&ids)?;

        let mut failure = None;
        for (index, event) in &self.events {
            let info = self.backend.resolve_event(*event)?;
            match info.status {
                EventStatus::Complete => self.states[*index] = InstructionState::Completed,
                EventStatus::Failed(message) if failure.is_none() => {
                    failure = Some(Error::device(self.device, event.0, message));
                }
                _ => {}
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        for handle in self.pending_owners.drain(..) {
            self.registry.set_owner(handle, self.device, true);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("device", &self.device)
            .field("final_event", &self.final_event)
            .field("events", &self.events.len())
            .finish()
    }
}
