//! Metrics collection for program execution.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Runtime metrics collector
#[derive(Debug)]
pub struct Metrics {
    executions: AtomicU64,
    instructions_issued: AtomicU64,
    kernels_launched: AtomicU64,
    barriers: AtomicU64,

    bytes_in: AtomicU64,
    bytes_out: AtomicU64,

    // time to issue one program
    latency_histogram: Option<RwLock<Histogram<u64>>>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        // 3 significant figures, values up to one hour in nanoseconds
        let histogram = Histogram::new_with_max(3_600_000_000_000, 3).ok().map(RwLock::new);

        Self {
            executions: AtomicU64::new(0),
            instructions_issued: AtomicU64::new(0),
            kernels_launched: AtomicU64::new(0),
            barriers: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            latency_histogram: histogram,
            start_time: Instant::now(),
        }
    }

    /// Record one program execution and how long issuing it took
    pub fn record_execution(&self, duration_ns: u64) {
        self.executions.fetch_add(1, Ordering::Relaxed);

        if let Some(mut hist) = self.latency_histogram.as_ref().and_then(|h| h.try_write()) {
            let _ = hist.record(duration_ns);
        }
    }

    pub fn record_instruction(&self) {
        self.instructions_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_kernel_launch(&self) {
        self.kernels_launched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_barrier(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_out(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (avg, p50, p95, p99, max) = match &self.latency_histogram {
            Some(histogram) => {
                let histogram = histogram.read();
                let avg = if histogram.len() > 0 {
                    histogram.mean() as u64
                } else {
                    0
                };
                (
                    avg,
                    histogram.value_at_quantile(0.50),
                    histogram.value_at_quantile(0.95),
                    histogram.value_at_quantile(0.99),
                    histogram.max(),
                )
            }
            None => (0, 0, 0, 0, 0),
        };

        MetricsSnapshot {
            timestamp: Instant::now(),
            uptime: self.start_time.elapsed(),
            executions: self.executions.load(Ordering::Relaxed),
            instructions_issued: self.instructions_issued.load(Ordering::Relaxed),
            kernels_launched: self.kernels_launched.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            avg_latency_ns: avg,
            p50_latency_ns: p50,
            p95_latency_ns: p95,
            p99_latency_ns: p99,
            max_latency_ns: max,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.executions.store(0, Ordering::Relaxed);
        self.instructions_issued.store(0, Ordering::Relaxed);
        self.kernels_launched.store(0, Ordering::Relaxed);
        self.barriers.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);

        if let Some(mut hist) = self.latency_histogram.as_ref().and_then(|h| h.try_write()) {
            hist.reset();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: Instant,
    pub uptime: std::time::Duration,
    pub executions: u64,
    pub instructions_issued: u64,
    pub kernels_launched: u64,
    pub barriers: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub avg_latency_ns: u64,
    pub p50_latency_ns: u64,
    pub p95_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MetricsSnapshot {
    pub fn executions_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.executions as f64 / seconds
    }

    /// Average instructions issued per execution
    pub fn instructions_per_execution(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.instructions_issued as f64 / self.executions as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let metrics = Metrics::new();

        metrics.record_execution(1000);
        metrics.record_execution(2000);
        for _ in 0..10 {
            metrics.record_instruction();
        }
        metrics.record_kernel_launch();
        metrics.record_bytes_in(4096);
        metrics.record_bytes_out(1024);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.executions, 2);
        assert_eq!(snapshot.kernels_launched, 1);
        assert_eq!(snapshot.bytes_in, 4096);
        assert_eq!(snapshot.bytes_out, 1024);
        assert!(snapshot.avg_latency_ns > 0);
        assert_eq!(snapshot.instructions_per_execution(), 5.0);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = Metrics::new();

        metrics.record_execution(1000);
        metrics.record_barrier();
        assert_eq!(metrics.snapshot().executions, 1);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.executions, 0);
        assert_eq!(snapshot.barriers, 0);
        assert_eq!(snapshot.max_latency_ns, 0);
    }
}
