//! Execution context: the devices, objects and tasks a program refers to.
//!
//! Bytecode operands are indices into the tables held here. The context also
//! owns every device buffer it allocated; dropping it releases them.

use crate::device::{BufferId, DeviceBackend, KernelId};
use crate::error::{Error, Result};
use crate::state::{HostObject, LocalObjectState, ObjectHandle, ObjectRegistry};
use crate::task::Task;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ExecutionContext {
    name: String,
    registry: Arc<ObjectRegistry>,
    devices: Vec<Arc<dyn DeviceBackend>>,
    active_device: Option<usize>,
    objects: Vec<HostObject>,
    states: Vec<LocalObjectState>,
    object_index: HashMap<ObjectHandle, usize>,
    tasks: Vec<Task>,
    kernels: HashMap<(usize, usize), KernelId>,
}

impl ExecutionContext {
    pub fn new<S: Into<String>>(name: S, registry: Arc<ObjectRegistry>) -> Self {
        let name = name.into();
        info!(context = %name, "execution context created");
        Self {
            name,
            registry,
            devices: Vec::new(),
            active_device: None,
            objects: Vec::new(),
            states: Vec::new(),
            object_index: HashMap::new(),
            tasks: Vec::new(),
            kernels: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// Attach a device; the returned index is what programs refer to.
    pub fn add_device(&mut self, device: Arc<dyn DeviceBackend>) -> usize {
        self.devices.push(device);
        self.devices.len() - 1
    }

    pub fn device(&self, index: usize) -> Result<&Arc<dyn DeviceBackend>> {
        self.devices.get(index).ok_or_else(|| {
            Error::config(format!(
                "context {} has no device {} ({} attached)",
                self.name,
                index,
                self.devices.len()
            ))
        })
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Device the bound objects' buffers live on.
    pub fn active_device(&self) -> Option<usize> {
        self.active_device
    }

    pub(crate) fn set_active_device(&mut self, index: usize) -> Result<()> {
        self.device(index)?;
        if let Some(current) = self.active_device {
            if current != index {
                // buffers belong to one device at a time
                self.invalidate();
            }
        }
        self.active_device = Some(index);
        Ok(())
    }

    /// Bind `object` into this context, returning its index. Binding the same
    /// object twice returns the same index.
    pub fn bind(&mut self, object: &HostObject) -> usize {
        if let Some(index) = self.object_index.get(&object.handle()) {
            return *index;
        }
        let index = self.objects.len();
        self.objects.push(object.clone());
        self.states.push(LocalObjectState::new());
        self.object_index.insert(object.handle(), index);
        index
    }

    pub fn object_index(&self, handle: ObjectHandle) -> Option<usize> {
        self.object_index.get(&handle).copied()
    }

    pub fn object(&self, index: usize) -> Result<&HostObject> {
        self.objects
            .get(index)
            .ok_or_else(|| Error::config(format!("object index {} is not bound", index)))
    }

    pub fn objects(&self) -> &[HostObject] {
        &self.objects
    }

    pub fn state(&self, index: usize) -> Result<&LocalObjectState> {
        self.states
            .get(index)
            .ok_or_else(|| Error::config(format!("object index {} is not bound", index)))
    }

    pub(crate) fn state_mut(&mut self, index: usize) -> Result<&mut LocalObjectState> {
        self.states
            .get_mut(index)
            .ok_or_else(|| Error::config(format!("object index {} is not bound", index)))
    }

    /// Add a task, binding its arguments.
    pub fn add_task(&mut self, task: Task) -> usize {
        for arg in task.args() {
            self.bind(&arg.object);
        }
        self.tasks.push(task);
        self.tasks.len() - 1
    }

    pub fn task(&self, index: usize) -> Result<&Task> {
        self.tasks
            .get(index)
            .ok_or_else(|| Error::config(format!("task index {} does not exist", index)))
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Resolve the kernel of `task` on `device`, once per context.
    pub(crate) fn kernel(&mut self, device: usize, task: usize) -> Result<KernelId> {
        if let Some(kernel) = self.kernels.get(&(device, task)) {
            return Ok(*kernel);
        }
        let name = self.task(task)?.kernel().to_string();
        let backend = self.device(device)?;
        let kernel = backend.lookup_kernel(&name).ok_or_else(|| {
            Error::config(format!(
                "generated code is null: no kernel '{}' installed on {}",
                name,
                backend.name()
            ))
        })?;
        debug!(context = %self.name, kernel = %name, device, "kernel installed");
        self.kernels.insert((device, task), kernel);
        Ok(kernel)
    }

    /// Make sure object `index` has a device buffer of exactly `size` bytes.
    /// A size change releases the old buffer before allocating the new one,
    /// which starts out invalid.
    pub(crate) fn ensure_buffer(&mut self, device: usize, index: usize, size: usize) -> Result<BufferId> {
        let state = self.state(index)?;
        if let Some(buffer) = state.buffer() {
            if state.buffer_size() == size {
                return Ok(buffer);
            }
        }

        let backend = Arc::clone(self.device(device)?);
        let handle = self.object(index)?.handle();
        if let Some(old) = self.state_mut(index)?.detach() {
            backend.release(old);
        }
        let buffer = backend.allocate(size).map_err(|err| match err {
            Error::Resource { device, message } => Error::resource(device, format!("{}: {}", handle, message)),
            other => other,
        })?;
        self.state_mut(index)?.attach(buffer, size);
        Ok(buffer)
    }

    /// Blocking read-back from the active device. After a batched run a
    /// buffer holds only the last chunk, which lands at its own host offset.
    pub fn sync(&mut self, objects: &[&HostObject]) -> Result<()> {
        let device = self
            .active_device
            .ok_or_else(|| Error::config("context has not executed on any device"))?;
        let backend = Arc::clone(self.device(device)?);

        for object in objects {
            let index = self.object_index(object.handle()).ok_or_else(|| {
                Error::config(format!("{} is not bound to context {}", object.handle(), self.name))
            })?;
            let state = self.state(index)?;
            let buffer = match (state.is_valid(), state.buffer()) {
                (true, Some(buffer)) => buffer,
                _ => {
                    return Err(Error::config(format!(
                        "{} has no valid device copy to synchronize",
                        object.handle()
                    )))
                }
            };
            let host_offset = state.host_offset();
            let length = state
                .buffer_size()
                .min(object.byte_len().saturating_sub(host_offset));
            backend.read(buffer, object.memory(), host_offset, length, &[], true)?;
            self.registry.set_owner(object.handle(), device, true);
        }
        Ok(())
    }

    /// Release every device buffer this context holds. Objects whose latest
    /// copy was recorded on the active device lose that owner.
    pub fn invalidate(&mut self) {
        let mut released = 0;
        for (state, object) in self.states.iter_mut().zip(&self.objects) {
            if let Some(buffer) = state.detach() {
                if let Some(device) = self.active_device.and_then(|d| self.devices.get(d)) {
                    device.release(buffer);
                }
                released += 1;
            }
            if let Some(active) = self.active_device {
                let owned = self
                    .registry
                    .state(object.handle())
                    .map_or(false, |global| global.owner == Some(active));
                if owned {
                    self.registry.clear_owner(object.handle());
                }
            }
        }
        if released > 0 {
            debug!(context = %self.name, released, "device buffers released");
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name)
            .field("devices", &self.devices.len())
            .field("active_device", &self.active_device)
            .field("objects", &self.objects.len())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    fn context() -> (ExecutionContext, Arc<HostDevice>) {
        let device = Arc::new(HostDevice::new().unwrap());
        let mut ctx = ExecutionContext::new("test", Arc::new(ObjectRegistry::new()));
        ctx.add_device(device.clone());
        (ctx, device)
    }

    #[test]
    fn test_bind_is_idempotent() {
        let (mut ctx, _) = context();
        let a = ctx.registry().array(&[1i32, 2]);
        let b = ctx.registry().array(&[3i32, 4]);
        assert_eq!(ctx.bind(&a), 0);
        assert_eq!(ctx.bind(&b), 1);
        assert_eq!(ctx.bind(&a), 0);
        assert_eq!(ctx.objects().len(), 2);
    }

    #[test]
    fn test_missing_kernel_is_config_error() {
        let (mut ctx, _) = context();
        let a = ctx.registry().array(&[1i32, 2]);
        let task = ctx.add_task(Task::new("t0", "nope").read(&a).domain(&[2]));
        let err = ctx.kernel(0, task).unwrap_err();
        assert!(err.to_string().contains("generated code is null"));
    }

    #[test]
    fn test_ensure_buffer_resizes() {
        let (mut ctx, device) = context();
        ctx.set_active_device(0).unwrap();
        let a = ctx.registry().array(&[0u8; 64]);
        let index = ctx.bind(&a);

        let first = ctx.ensure_buffer(0, index, 64).unwrap();
        assert_eq!(ctx.ensure_buffer(0, index, 64).unwrap(), first);
        let second = ctx.ensure_buffer(0, index, 32).unwrap();
        assert_ne!(first, second);

        device.finish().unwrap();
        assert_eq!(device.allocated_bytes(), 32);

        drop(ctx);
        device.finish().unwrap();
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_resize_at_full_capacity() {
        let device = Arc::new(HostDevice::builder().memory_capacity(64).build().unwrap());
        let mut ctx = ExecutionContext::new("full", Arc::new(ObjectRegistry::new()));
        ctx.add_device(device.clone());
        ctx.set_active_device(0).unwrap();
        let a = ctx.registry().array(&[0u8; 64]);
        let index = ctx.bind(&a);

        ctx.ensure_buffer(0, index, 64).unwrap();
        ctx.ensure_buffer(0, index, 48).unwrap();
        ctx.ensure_buffer(0, index, 64).unwrap();
        assert_eq!(device.allocated_bytes(), 64);
    }

    #[test]
    fn test_invalidate_clears_active_owner() {
        let (mut ctx, _) = context();
        ctx.set_active_device(0).unwrap();
        let a = ctx.registry().array(&[1i32; 4]);
        let b = ctx.registry().array(&[2i32; 4]);
        let index = ctx.bind(&a);
        ctx.bind(&b);
        ctx.ensure_buffer(0, index, 16).unwrap();
        ctx.registry().set_owner(a.handle(), 0, true);
        ctx.registry().set_owner(b.handle(), 3, true);

        ctx.invalidate();
        assert!(ctx.state(index).unwrap().buffer().is_none());
        assert_eq!(ctx.registry().state(a.handle()).unwrap().owner, None);
        assert_eq!(ctx.registry().state(b.handle()).unwrap().owner, Some(3));
    }

    #[test]
    fn test_sync_requires_valid_copy() {
        let (mut ctx, _) = context();
        ctx.set_active_device(0).unwrap();
        let a = ctx.registry().array(&[1.0f64; 4]);
        ctx.bind(&a);
        assert!(matches!(ctx.sync(&[&a]), Err(Error::Config(_))));
    }
}
