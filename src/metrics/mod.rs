//! Per-node metrics and the diagnostics report

pub mod diagnostics;
pub mod node_metrics;

pub use diagnostics::{DiagnosticsReport, NodeReport};
pub use node_metrics::{NodeMetrics, NodeMetricsSnapshot};
