//! Per-node operation metrics
//!
//! Counts completed operations, failures and retries against one node and
//! keeps a latency histogram for the diagnostics report.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

/// Highest latency tracked, in microseconds (one minute)
const MAX_TRACKED_US: u64 = 60_000_000;

/// Metrics for a single node
pub struct NodeMetrics {
    /// Completed operations (including application-level failures)
    ops_completed: AtomicU64,
    /// Transport and protocol failures
    errors: AtomicU64,
    /// Attempts that ended in a retry
    retries: AtomicU64,
    /// Latency histogram in microseconds (thread-safe)
    histogram: Mutex<Option<Histogram<u64>>>,
    start_time: Instant,
}

impl fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeMetrics")
            .field("ops", &self.total_ops())
            .field("errors", &self.total_errors())
            .finish()
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            ops_completed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            histogram: Mutex::new(Histogram::new_with_bounds(1, MAX_TRACKED_US, 3).ok()),
            start_time: Instant::now(),
        }
    }

    /// Record a completed operation
    #[inline]
    pub fn record_op(&self, latency: Duration) {
        self.ops_completed.fetch_add(1, Ordering::Relaxed);
        let us = (latency.as_micros() as u64).clamp(1, MAX_TRACKED_US);
        if let Some(hist) = self.histogram.lock().as_mut() {
            hist.record(us).ok();
        }
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_ops(&self) -> u64 {
        self.ops_completed.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn total_retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Overall throughput (ops/sec) since the node joined
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_ops() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Latency percentile in microseconds
    pub fn percentile_us(&self, p: f64) -> u64 {
        self.histogram
            .lock()
            .as_ref()
            .map(|h| h.value_at_percentile(p))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> NodeMetricsSnapshot {
        let hist = self.histogram.lock();
        let (mean, p50, p99, max) = match hist.as_ref() {
            Some(h) if !h.is_empty() => (
                h.mean() / 1000.0,
                h.value_at_percentile(50.0) as f64 / 1000.0,
                h.value_at_percentile(99.0) as f64 / 1000.0,
                h.max() as f64 / 1000.0,
            ),
            _ => (0.0, 0.0, 0.0, 0.0),
        };
        NodeMetricsSnapshot {
            ops_completed: self.total_ops(),
            errors: self.total_errors(),
            retries: self.total_retries(),
            throughput: self.throughput(),
            mean_latency_ms: mean,
            p50_latency_ms: p50,
            p99_latency_ms: p99,
            max_latency_ms: max,
        }
    }
}

/// Snapshot of node metrics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetricsSnapshot {
    pub ops_completed: u64,
    pub errors: u64,
    pub retries: u64,
    pub throughput: f64,
    pub mean_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub max_latency_ms: f64,
}
