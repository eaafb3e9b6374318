pub use crate::bytecode::{BytecodeProgram, Instruction, Opcode};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::context::ExecutionContext;
pub use crate::device::{
    DeviceBackend, DeviceClass, DeviceLimits, EventId, HostDevice, HostKernel, KernelContext,
    VectorAddKernel,
};
pub use crate::error::{Error, Result};
pub use crate::runtime::Runtime;
pub use crate::schedule::TaskSchedule;
pub use crate::state::{ElementType, HostObject, ObjectRegistry};
pub use crate::task::{Access, Task};
pub use crate::vm::{ExecutionHandle, VirtualMachine};

#[cfg(feature = "telemetry")]
pub use crate::telemetry::{JsonExporter, Metrics, MetricsExporter, MetricsSnapshot, TracingExporter};
