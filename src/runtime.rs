use crate::config::Config;
use crate::context::ExecutionContext;
use crate::device::{DeviceBackend, HostDevice, HostDeviceBuilder};
use crate::error::Result;
use crate::schedule::TaskSchedule;
use crate::state::{DeviceElement, HostObject, ObjectRegistry};
use crate::telemetry::Metrics;
use std::sync::Arc;
use tracing::info;

/// Owns the configuration, object registry and metrics shared by every
/// schedule created from it.
pub struct Runtime {
    config: Config,
    registry: Arc<ObjectRegistry>,
    metrics: Arc<Metrics>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        info!(
            max_bytecode_size = config.max_bytecode_size,
            benchmarking_mode = config.benchmarking_mode,
            "runtime initialised"
        );
        Ok(Self {
            config,
            registry: Arc::new(ObjectRegistry::new()),
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Builder for a host device that follows this runtime's configuration.
    pub fn host_device_builder(&self) -> HostDeviceBuilder {
        HostDevice::builder().with_config(&self.config)
    }

    pub fn host_device(&self) -> Result<Arc<HostDevice>> {
        Ok(Arc::new(self.host_device_builder().build()?))
    }

    pub fn array<T: DeviceElement>(&self, values: &[T]) -> HostObject {
        self.registry.array(values)
    }

    pub fn zeroed<T: DeviceElement>(&self, len: usize) -> HostObject {
        self.registry.zeroed::<T>(len)
    }

    pub fn scalar<T: DeviceElement>(&self, value: T) -> HostObject {
        self.registry.scalar(value)
    }

    /// Drop `object` from the registry.
    pub fn release(&self, object: &HostObject) -> bool {
        self.registry.release(object.handle())
    }

    pub fn context<S: Into<String>>(&self, name: S) -> ExecutionContext {
        ExecutionContext::new(name, Arc::clone(&self.registry))
    }

    /// A schedule running on `device`.
    pub fn schedule<S: Into<String>>(&self, name: S, device: Arc<dyn DeviceBackend>) -> TaskSchedule {
        TaskSchedule::new(self, name, device)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            config: Config::default(),
            registry: Arc::new(ObjectRegistry::new()),
            metrics: Arc::new(Metrics::new()),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}
