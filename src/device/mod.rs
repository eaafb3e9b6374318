//! Device backend abstraction.
//!
//! The VM talks to accelerators exclusively through [`DeviceBackend`]. Every
//! operation that touches the device returns an [`EventId`] that can be put in
//! the wait-list of later commands or resolved into an [`EventInfo`].

pub mod host;
pub mod kernel;

pub use host::{HostDevice, HostDeviceBuilder};
pub use kernel::{HostKernel, KernelContext, VectorAddKernel};

use crate::error::Result;
use crate::scheduler::WorkGeometry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Host memory shared with a backend so asynchronous reads can land in it.
pub type HostMemory = Arc<Mutex<Vec<u8>>>;

/// Opaque completion handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Handle of a kernel installed on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub usize);

/// Scheduling strategy family of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Gpu,
    Cpu,
    /// FPGA-like devices with a fixed work-group shape.
    Constrained,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    pub class: DeviceClass,
    pub max_work_item_sizes: [u64; 3],
    pub max_compute_units: u32,
    pub max_work_group_size: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            class: DeviceClass::Gpu,
            max_work_item_sizes: [1024, 1024, 64],
            max_compute_units: num_cpus::get() as u32,
            max_work_group_size: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Running,
    Complete,
    Failed(String),
}

impl EventStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, EventStatus::Complete | EventStatus::Failed(_))
    }
}

/// Resolved state of an event; timestamps are nanoseconds since the device
/// was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub id: EventId,
    pub status: EventStatus,
    pub queued_ns: u64,
    pub start_ns: Option<u64>,
    pub end_ns: Option<u64>,
}

impl EventInfo {
    pub fn execution_ns(&self) -> Option<u64> {
        match (self.start_ns, self.end_ns) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        }
    }

    pub fn total_ns(&self) -> Option<u64> {
        self.end_ns.map(|end| end.saturating_sub(self.queued_ns))
    }
}

/// Capability set the VM needs from an accelerator driver.
///
/// Commands are expected to complete in submission order unless their
/// wait-lists say otherwise; blocking variants return only once the command
/// has finished.
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn limits(&self) -> DeviceLimits;

    fn allocate(&self, bytes: usize) -> Result<BufferId>;

    fn release(&self, buffer: BufferId);

    /// Copy `data` into the start of `buffer`.
    fn write(
        &self,
        buffer: BufferId,
        data: Vec<u8>,
        wait: &[EventId],
        blocking: bool,
    ) -> Result<EventId>;

    /// Copy the first `length` bytes of `buffer` into `dest[host_offset..]`.
    fn read(
        &self,
        buffer: BufferId,
        dest: HostMemory,
        host_offset: usize,
        length: usize,
        wait: &[EventId],
        blocking: bool,
    ) -> Result<EventId>;

    fn lookup_kernel(&self, name: &str) -> Option<KernelId>;

    fn launch(
        &self,
        kernel: KernelId,
        args: &[BufferId],
        geometry: &WorkGeometry,
        wait: &[EventId],
    ) -> Result<EventId>;

    fn barrier(&self, wait: &[EventId]) -> Result<EventId>;

    fn marker(&self, wait: &[EventId]) -> Result<EventId>;

    fn resolve_event(&self, event: EventId) -> Result<EventInfo>;

    /// Block until every event has finished (successfully or not).
    fn wait(&self, events: &[EventId]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_timings() {
        let info = EventInfo {
            id: EventId(1),
            status: EventStatus::Complete,
            queued_ns: 10,
            start_ns: Some(15),
            end_ns: Some(40),
        };
        assert_eq!(info.execution_ns(), Some(25));
        assert_eq!(info.total_ns(), Some(30));
        assert!(info.status.is_finished());
        assert!(!EventStatus::Running.is_finished());
    }
}
