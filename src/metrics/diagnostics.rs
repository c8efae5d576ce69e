//! Health report over the current topology

use std::fmt::Write as _;

use serde::Serialize;

use super::node_metrics::NodeMetricsSnapshot;
use crate::client::pool::PoolStats;
use crate::cluster::config_map::Locator;
use crate::cluster::Topology;
use crate::utils::{KvError, Result};

/// State of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub address: String,
    pub alive: bool,
    pub pool: PoolStats,
    pub metrics: NodeMetricsSnapshot,
}

/// Snapshot of the whole client
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub revision: u64,
    pub bucket: String,
    pub locator: &'static str,
    pub nodes: Vec<NodeReport>,
}

impl DiagnosticsReport {
    pub fn from_topology(topology: &Topology) -> Self {
        let nodes = topology
            .nodes()
            .iter()
            .map(|node| NodeReport {
                address: node.endpoint(),
                alive: node.is_alive(),
                pool: node.pool_stats(),
                metrics: node.metrics().snapshot(),
            })
            .collect();

        Self {
            revision: topology.revision(),
            bucket: topology.bucket().to_string(),
            locator: match topology.locator() {
                Locator::VBucket => "vbucket",
                Locator::Ketama => "ketama",
            },
            nodes,
        }
    }

    pub fn alive_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.alive).count()
    }

    pub fn total_ops(&self) -> u64 {
        self.nodes.iter().map(|n| n.metrics.ops_completed).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| KvError::Transcode(e.to_string()))
    }

    /// Human-readable table
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "bucket '{}' rev {} ({}), {}/{} nodes alive",
            self.bucket,
            self.revision,
            self.locator,
            self.alive_nodes(),
            self.nodes.len()
        );
        for n in &self.nodes {
            let _ = writeln!(
                out,
                "  {:<24} {:<5} conns {}/{} idle {}  ops {} err {} retry {}  p50 {:.3}ms p99 {:.3}ms",
                n.address,
                if n.alive { "up" } else { "down" },
                n.pool.in_use,
                n.pool.total,
                n.pool.idle,
                n.metrics.ops_completed,
                n.metrics.errors,
                n.metrics.retries,
                n.metrics.p50_latency_ms,
                n.metrics.p99_latency_ms
            );
        }
        out
    }
}
