//! Telemetry and observability subsystem.
//!
//! Counters and latency histograms for program execution, plus export to
//! JSON. With the `telemetry` feature off, [`Metrics`] is a no-op stub.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub mod export;

#[cfg(feature = "telemetry")]
pub use metrics::{Metrics, MetricsSnapshot};

#[cfg(feature = "telemetry")]
pub use export::{JsonExporter, MetricsExporter, TracingExporter};

// Stub implementations when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
pub mod metrics {
    use std::time::Instant;

    #[derive(Debug, Clone, Default)]
    pub struct Metrics;

    impl Metrics {
        pub fn new() -> Self { Self }
        pub fn record_execution(&self, _: u64) {}
        pub fn record_instruction(&self) {}
        pub fn record_kernel_launch(&self) {}
        pub fn record_barrier(&self) {}
        pub fn record_bytes_in(&self, _: u64) {}
        pub fn record_bytes_out(&self, _: u64) {}
        pub fn reset(&self) {}
        pub fn snapshot(&self) -> MetricsSnapshot { MetricsSnapshot::default() }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MetricsSnapshot {
        pub timestamp: Option<Instant>,
        pub executions: u64,
        pub instructions_issued: u64,
        pub kernels_launched: u64,
        pub barriers: u64,
        pub bytes_in: u64,
        pub bytes_out: u64,
    }
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{Metrics, MetricsSnapshot};
