//! Metrics export.

use super::metrics::MetricsSnapshot;
use crate::error::Result;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Sink for metrics snapshots.
pub trait MetricsExporter: Send + Sync {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()>;
}

/// Writes each snapshot to a JSON file, replacing the previous one.
#[derive(Debug, Clone)]
pub struct JsonExporter {
    output_path: PathBuf,
}

impl JsonExporter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(&SerializableSnapshot::from(snapshot))?;
        std::fs::write(&self.output_path, json)?;
        Ok(())
    }
}

/// Emits each snapshot as one `info` event on the `accelvm::metrics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingExporter;

impl MetricsExporter for TracingExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        info!(
            target: "accelvm::metrics",
            executions = snapshot.executions,
            instructions_per_execution = snapshot.instructions_per_execution(),
            kernels_launched = snapshot.kernels_launched,
            bytes_in = snapshot.bytes_in,
            bytes_out = snapshot.bytes_out,
            p99_latency_ns = snapshot.p99_latency_ns,
            "execution metrics"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
struct SerializableSnapshot {
    uptime_secs: f64,
    executions: u64,
    instructions_issued: u64,
    kernels_launched: u64,
    barriers: u64,
    bytes_in: u64,
    bytes_out: u64,
    avg_latency_us: f64,
    p50_latency_us: f64,
    p95_latency_us: f64,
    p99_latency_us: f64,
    max_latency_us: f64,
    executions_per_second: f64,
    instructions_per_execution: f64,
}

impl From<&MetricsSnapshot> for SerializableSnapshot {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        Self {
            uptime_secs: snapshot.uptime.as_secs_f64(),
            executions: snapshot.executions,
            instructions_issued: snapshot.instructions_issued,
            kernels_launched: snapshot.kernels_launched,
            barriers: snapshot.barriers,
            bytes_in: snapshot.bytes_in,
            bytes_out: snapshot.bytes_out,
            avg_latency_us: snapshot.avg_latency_ns as f64 / 1_000.0,
            p50_latency_us: snapshot.p50_latency_ns as f64 / 1_000.0,
            p95_latency_us: snapshot.p95_latency_ns as f64 / 1_000.0,
            p99_latency_us: snapshot.p99_latency_ns as f64 / 1_000.0,
            max_latency_us: snapshot.max_latency_ns as f64 / 1_000.0,
            executions_per_second: snapshot.executions_per_second(),
            instructions_per_execution: snapshot.instructions_per_execution(),
        }
    }
}
