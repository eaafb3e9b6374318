//! In-process device backend.
//!
//! Device memory lives in host RAM and commands run on a dedicated queue
//! thread, strictly in submission order. Kernels are Rust closures registered
//! by name. This backend is what the VM runs against when no vendor driver is
//! plugged in, and what the test suite uses.

use super::kernel::{HostKernel, KernelContext};
use super::{
    BufferId, DeviceBackend, DeviceClass, DeviceLimits, EventId, EventInfo, EventStatus,
    HostMemory, KernelId,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::scheduler::WorkGeometry;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

const DEFAULT_CAPACITY: usize = 256 * 1024 * 1024;

enum Command {
    Write {
        event: EventId,
        wait: Vec<EventId>,
        buffer: BufferId,
        data: Vec<u8>,
    },
    Read {
        event: EventId,
        wait: Vec<EventId>,
        buffer: BufferId,
        dest: HostMemory,
        host_offset: usize,
        length: usize,
    },
    Launch {
        event: EventId,
        wait: Vec<EventId>,
        kernel: Arc<dyn HostKernel>,
        args: Vec<BufferId>,
        geometry: WorkGeometry,
    },
    Sync {
        event: EventId,
        wait: Vec<EventId>,
    },
    Release {
        buffer: BufferId,
    },
}

struct Memory {
    buffers: HashMap<BufferId, Vec<u8>>,
    /// Accounted size of every live allocation. Released entries leave this
    /// map immediately even while their bytes wait in the queue.
    sizes: HashMap<BufferId, usize>,
    allocated: usize,
    capacity: usize,
}

struct EventTable {
    epoch: Instant,
    next_id: AtomicU64,
    events: Mutex<HashMap<EventId, EventInfo>>,
    finished: Condvar,
}

impl EventTable {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            next_id: AtomicU64::new(1),
            events: Mutex::new(HashMap::new()),
            finished: Condvar::new(),
        }
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn create(&self) -> EventId {
        let id = EventId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let info = EventInfo {
            id,
            status: EventStatus::Queued,
            queued_ns: self.now_ns(),
            start_ns: None,
            end_ns: None,
        };
        self.events.lock().insert(id, info);
        id
    }

    fn start(&self, id: EventId) {
        let now = self.now_ns();
        if let Some(info) = self.events.lock().get_mut(&id) {
            info.status = EventStatus::Running;
            info.start_ns = Some(now);
        }
    }

    fn finish(&self, id: EventId, outcome: std::result::Result<(), String>) {
        let now = self.now_ns();
        {
            let mut events = self.events.lock();
            if let Some(info) = events.get_mut(&id) {
                info.status = match outcome {
                    Ok(()) => EventStatus::Complete,
                    Err(message) => EventStatus::Failed(message),
                };
                if info.start_ns.is_none() {
                    info.start_ns = Some(now);
                }
                info.end_ns = Some(now);
            }
        }
        self.finished.notify_all();
    }

    fn get(&self, id: EventId) -> Option<EventInfo> {
        self.events.lock().get(&id).cloned()
    }

    /// First failed event in `wait`, if any.
    fn failed_dependency(&self, wait: &[EventId]) -> Option<EventId> {
        let events = self.events.lock();
        wait.iter().copied().find(|id| {
            !matches!(
                events.get(id).map(|info| &info.status),
                Some(EventStatus::Complete) | Some(EventStatus::Queued) | Some(EventStatus::Running)
            )
        })
    }

    fn wait_all(&self, ids: &[EventId]) -> std::result::Result<(), EventId> {
        let mut events = self.events.lock();
        loop {
            let mut pending = false;
            for id in ids {
                match events.get(id) {
                    Some(info) if info.status.is_finished() => {}
                    Some(_) => pending = true,
                    None => return Err(*id),
                }
            }
            if !pending {
                return Ok(());
            }
            self.finished.wait(&mut events);
        }
    }

    fn flush(&self) -> usize {
        let mut events = self.events.lock();
        let before = events.len();
        events.retain(|_, info| !info.status.is_finished());
        before - events.len()
    }
}

/// Builder for [`HostDevice`].
#[derive(Debug, Clone)]
pub struct HostDeviceBuilder {
    name: String,
    index: usize,
    limits: DeviceLimits,
    capacity: usize,
    thread_name: String,
}

impl HostDeviceBuilder {
    pub fn new() -> Self {
        Self {
            name: "host".to_string(),
            index: 0,
            limits: DeviceLimits::default(),
            capacity: DEFAULT_CAPACITY,
            thread_name: Config::default().queue_thread_name,
        }
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Index used to identify this device in errors.
    pub fn index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn class(mut self, class: DeviceClass) -> Self {
        self.limits.class = class;
        self
    }

    pub fn max_work_item_sizes(mut self, sizes: [u64; 3]) -> Self {
        self.limits.max_work_item_sizes = sizes;
        self
    }

    pub fn max_compute_units(mut self, units: u32) -> Self {
        self.limits.max_compute_units = units;
        self
    }

    pub fn max_work_group_size(mut self, size: u64) -> Self {
        self.limits.max_work_group_size = size;
        self
    }

    /// Bytes of device memory available for buffers.
    pub fn memory_capacity(mut self, bytes: usize) -> Self {
        self.capacity = bytes;
        self
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        self.thread_name = config.queue_thread_name.clone();
        self
    }

    pub fn build(self) -> Result<HostDevice> {
        let (sender, receiver) = unbounded();
        let memory = Arc::new(Mutex::new(Memory {
            buffers: HashMap::new(),
            sizes: HashMap::new(),
            allocated: 0,
            capacity: self.capacity,
        }));
        let events = Arc::new(EventTable::new());

        let worker = {
            let memory = Arc::clone(&memory);
            let events = Arc::clone(&events);
            thread::Builder::new()
                .name(format!("{}-{}", self.thread_name, self.index))
                .spawn(move || run_queue(receiver, memory, events))
                .map_err(|e| Error::resource(self.index, format!("queue thread spawn failed: {}", e)))?
        };

        info!(
            device = self.index,
            name = %self.name,
            class = ?self.limits.class,
            capacity = self.capacity,
            "host device ready"
        );

        Ok(HostDevice {
            name: self.name,
            index: self.index,
            limits: self.limits,
            sender: Some(sender),
            worker: Some(worker),
            memory,
            events,
            kernels: RwLock::new(Vec::new()),
            next_buffer: AtomicU64::new(1),
        })
    }
}

impl Default for HostDeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Device backend that executes on the host.
pub struct HostDevice {
    name: String,
    index: usize,
    limits: DeviceLimits,
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    memory: Arc<Mutex<Memory>>,
    events: Arc<EventTable>,
    kernels: RwLock<Vec<(String, Arc<dyn HostKernel>)>>,
    next_buffer: AtomicU64,
}

impl HostDevice {
    pub fn builder() -> HostDeviceBuilder {
        HostDeviceBuilder::new()
    }

    /// GPU-class host device with default limits.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Name of the thread running the command queue.
    pub fn queue_thread_name(&self) -> Option<&str> {
        self.worker.as_ref().and_then(|worker| worker.thread().name())
    }

    /// Register (or replace) a kernel under `name`.
    pub fn register_kernel<K>(&self, name: &str, kernel: K) -> KernelId
    where
        K: HostKernel + 'static,
    {
        let mut kernels = self.kernels.write();
        let kernel: Arc<dyn HostKernel> = Arc::new(kernel);
        if let Some(pos) = kernels.iter().position(|(n, _)| n == name) {
            kernels[pos].1 = kernel;
            return KernelId(pos);
        }
        kernels.push((name.to_string(), kernel));
        KernelId(kernels.len() - 1)
    }

    /// Bytes currently allocated on the device.
    pub fn allocated_bytes(&self) -> usize {
        self.memory.lock().allocated
    }

    pub fn live_buffers(&self) -> usize {
        self.memory.lock().buffers.len()
    }

    /// Forget every finished event, returning how many were dropped.
    pub fn flush_events(&self) -> usize {
        self.events.flush()
    }

    /// Block until everything submitted so far has run.
    pub fn finish(&self) -> Result<()> {
        let event = self.barrier(&[])?;
        self.wait(&[event])
    }

    fn submit(&self, command: Command) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::resource(self.index, "device queue is shut down"))?;
        sender
            .send(command)
            .map_err(|_| Error::resource(self.index, "device queue thread is gone"))
    }

    fn check(&self, event: EventId) -> Result<EventId> {
        match self.events.get(event).map(|info| info.status) {
            Some(EventStatus::Failed(message)) => Err(Error::device(self.index, event.0, message)),
            _ => Ok(event),
        }
    }

    fn block_on(&self, event: EventId) -> Result<EventId> {
        self.wait(&[event])?;
        self.check(event)
    }
}

impl DeviceBackend for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn allocate(&self, bytes: usize) -> Result<BufferId> {
        let mut memory = self.memory.lock();
        if memory.allocated + bytes > memory.capacity {
            warn!(
                device = self.index,
                requested = bytes,
                allocated = memory.allocated,
                capacity = memory.capacity,
                "device out of memory"
            );
            return Err(Error::resource(
                self.index,
                format!(
                    "out of memory: requested {} bytes with {} of {} in use",
                    bytes, memory.allocated, memory.capacity
                ),
            ));
        }
        let id = BufferId(self.next_buffer.fetch_add(1, Ordering::Relaxed));
        memory.buffers.insert(id, vec![0u8; bytes]);
        memory.sizes.insert(id, bytes);
        memory.allocated += bytes;
        trace!(device = self.index, buffer = id.0, bytes, "allocate");
        Ok(id)
    }

    fn release(&self, buffer: BufferId) {
        {
            let mut memory = self.memory.lock();
            match memory.sizes.remove(&buffer) {
                Some(bytes) => memory.allocated -= bytes,
                None => return,
            }
        }
        trace!(device = self.index, buffer = buffer.0, "release");
        // queued commands may still touch the bytes; the queue drops them
        if self.submit(Command::Release { buffer }).is_err() {
            self.memory.lock().buffers.remove(&buffer);
        }
    }

    fn write(
        &self,
        buffer: BufferId,
        data: Vec<u8>,
        wait: &[EventId],
        blocking: bool,
    ) -> Result<EventId> {
        let event = self.events.create();
        trace!(device = self.index, buffer = buffer.0, bytes = data.len(), %event, blocking, "write");
        self.submit(Command::Write {
            event,
            wait: wait.to_vec(),
            buffer,
            data,
        })?;
        if blocking {
            self.block_on(event)
        } else {
            Ok(event)
        }
    }

    fn read(
        &self,
        buffer: BufferId,
        dest: HostMemory,
        host_offset: usize,
        length: usize,
        wait: &[EventId],
        blocking: bool,
    ) -> Result<EventId> {
        let event = self.events.create();
        trace!(device = self.index, buffer = buffer.0, host_offset, length, %event, blocking, "read");
        self.submit(Command::Read {
            event,
            wait: wait.to_vec(),
            buffer,
            dest,
            host_offset,
            length,
        })?;
        if blocking {
            self.block_on(event)
        } else {
            Ok(event)
        }
    }

    fn lookup_kernel(&self, name: &str) -> Option<KernelId> {
        self.kernels
            .read()
            .iter()
            .position(|(n, _)| n == name)
            .map(KernelId)
    }

    fn launch(
        &self,
        kernel: KernelId,
        args: &[BufferId],
        geometry: &WorkGeometry,
        wait: &[EventId],
    ) -> Result<EventId> {
        let code = self
            .kernels
            .read()
            .get(kernel.0)
            .map(|(_, code)| Arc::clone(code))
            .ok_or_else(|| Error::config(format!("kernel {} is not installed on {}", kernel.0, self.name)))?;
        let event = self.events.create();
        trace!(device = self.index, kernel = kernel.0, ?geometry, %event, "launch");
        self.submit(Command::Launch {
            event,
            wait: wait.to_vec(),
            kernel: code,
            args: args.to_vec(),
            geometry: geometry.clone(),
        })?;
        Ok(event)
    }

    fn barrier(&self, wait: &[EventId]) -> Result<EventId> {
        let event = self.events.create();
        self.submit(Command::Sync {
            event,
            wait: wait.to_vec(),
        })?;
        Ok(event)
    }

    fn marker(&self, wait: &[EventId]) -> Result<EventId> {
        // Markers and barriers coincide on an in-order queue.
        self.barrier(wait)
    }

    fn resolve_event(&self, event: EventId) -> Result<EventInfo> {
        self.events
            .get(event)
            .ok_or_else(|| Error::device(self.index, event.0, "unknown event"))
    }

    fn wait(&self, events: &[EventId]) -> Result<()> {
        self.events
            .wait_all(events)
            .map_err(|id| Error::device(self.index, id.0, "unknown event"))
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        // closing the channel ends the queue loop
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        debug!(device = self.index, "host device shut down");
    }
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("limits", &self.limits)
            .finish()
    }
}

fn run_queue(receiver: Receiver<Command>, memory: Arc<Mutex<Memory>>, events: Arc<EventTable>) {
    for command in receiver.iter() {
        match command {
            Command::Release { buffer } => {
                memory.lock().buffers.remove(&buffer);
            }
            Command::Write {
                event,
                wait,
                buffer,
                data,
            } => run_command(&events, event, &wait, || {
                let mut memory = memory.lock();
                let dst = memory
                    .buffers
                    .get_mut(&buffer)
                    .ok_or_else(|| format!("write to unknown buffer {}", buffer.0))?;
                if data.len() > dst.len() {
                    return Err(format!(
                        "write of {} bytes overflows buffer {} ({} bytes)",
                        data.len(),
                        buffer.0,
                        dst.len()
                    ));
                }
                dst[..data.len()].copy_from_slice(&data);
                Ok(())
            }),
            Command::Read {
                event,
                wait,
                buffer,
                dest,
                host_offset,
                length,
            } => run_command(&events, event, &wait, || {
                let memory = memory.lock();
                let src = memory
                    .buffers
                    .get(&buffer)
                    .ok_or_else(|| format!("read from unknown buffer {}", buffer.0))?;
                if length > src.len() {
                    return Err(format!(
                        "read of {} bytes overflows buffer {} ({} bytes)",
                        length,
                        buffer.0,
                        src.len()
                    ));
                }
                let mut host = dest.lock();
                let end = host_offset + length;
                if end > host.len() {
                    return Err(format!(
                        "read into host range {}..{} exceeds {} bytes",
                        host_offset,
                        end,
                        host.len()
                    ));
                }
                host[host_offset..end].copy_from_slice(&src[..length]);
                Ok(())
            }),
            Command::Launch {
                event,
                wait,
                kernel,
                args,
                geometry,
            } => run_command(&events, event, &wait, || {
                // Aliased arguments receive a copy; only the first occurrence
                // of a buffer is written back.
                let mut taken: Vec<Vec<u8>> = Vec::with_capacity(args.len());
                let mut first: HashMap<BufferId, usize> = HashMap::with_capacity(args.len());
                {
                    let mut memory = memory.lock();
                    for (i, id) in args.iter().enumerate() {
                        if let Some(&j) = first.get(id) {
                            let copy = taken[j].clone();
                            taken.push(copy);
                            continue;
                        }
                        match memory.buffers.remove(id) {
                            Some(data) => {
                                first.insert(*id, i);
                                taken.push(data);
                            }
                            None => {
                                for (id, &j) in &first {
                                    memory.buffers.insert(*id, std::mem::take(&mut taken[j]));
                                }
                                return Err(format!(
                                    "argument {} refers to unknown buffer {}",
                                    i, id.0
                                ));
                            }
                        }
                    }
                }

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut ctx = KernelContext::new(&geometry, &mut taken);
                    kernel.run(&mut ctx)
                }));

                let mut memory = memory.lock();
                for (id, &j) in &first {
                    memory.buffers.insert(*id, std::mem::take(&mut taken[j]));
                }
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err("kernel panicked".to_string()),
                }
            }),
            Command::Sync { event, wait } => run_command(&events, event, &wait, || Ok(())),
        }
    }
}

fn run_command<F>(events: &EventTable, event: EventId, wait: &[EventId], body: F)
where
    F: FnOnce() -> std::result::Result<(), String>,
{
    if let Some(failed) = events.failed_dependency(wait) {
        events.finish(event, Err(format!("dependency {} failed", failed)));
        return;
    }
    events.start(event);
    let outcome = body();
    if let Err(ref message) = outcome {
        warn!(%event, %message, "device command failed");
    }
    events.finish(event, outcome);
}
