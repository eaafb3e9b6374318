//! accelvm - task-graph bytecode runtime for accelerators
//!
//! Data-parallel work is described as a task graph of kernel launches and
//! host/device transfers, compiled once into a compact bytecode program and
//! replayed by a small interpreter against a device backend.
//!
//! # Quick Start
//!
//! ```no_run
//! use accelvm::prelude::*;
//!
//! let runtime = Runtime::new(Config::default())?;
//! let device = runtime.host_device()?;
//! device.register_kernel("vector_add", VectorAddKernel::<f32>::new());
//!
//! let a = runtime.array(&vec![1.0f32; 1024]);
//! let b = runtime.array(&vec![2.0f32; 1024]);
//! let c = runtime.zeroed::<f32>(1024);
//!
//! let mut schedule = runtime.schedule("example", device);
//! schedule
//!     .stream_in(&a)
//!     .stream_in(&b)
//!     .task(Task::new("add", "vector_add").read(&a).read(&b).write(&c).domain(&[1024]))
//!     .stream_out(&c);
//!
//! // compile once, replay many times
//! schedule.compile(None)?;
//! for _ in 0..10 {
//!     schedule.execute()?.wait()?;
//! }
//! # Ok::<(), accelvm::Error>(())
//! ```
//!
//! # Features
//!
//! - **Graph compiler**: list scheduling with deduplicated dependency lists
//! - **Batching**: oversized transfers split into device-sized passes
//! - **Bytecode VM**: event-driven replay with per-object residency tracking
//! - **Work geometry**: GPU, CPU and constrained (FPGA-like) launch sizing
//! - **Host device**: in-process backend on a dedicated queue thread
//! - **Telemetry**: execution metrics and JSON export (optional)

#![warn(missing_debug_implementations)]

pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod graph;
pub mod prelude;
pub mod runtime;
pub mod schedule;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod telemetry;
pub mod vm;

// Re-export key types at crate root
pub use bytecode::BytecodeProgram;
pub use config::{Config, ConfigBuilder};
pub use context::ExecutionContext;
pub use error::{Error, Result};
pub use runtime::Runtime;
pub use schedule::TaskSchedule;
pub use task::{Access, Task};
pub use vm::{ExecutionHandle, VirtualMachine};
