//! Cluster node representation
//!
//! A node owns its connection pool and metrics. Nodes are shared between
//! topology snapshots by `Arc` so a pool survives revisions that keep the
//! node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{info, warn};

use super::config_map::NodeAddress;
use crate::client::pool::{ConnectionPool, PoolStats};
use crate::client::raw_connection::ConnectionFactory;
use crate::config::PoolConfig;
use crate::metrics::NodeMetrics;

/// One cluster member
#[derive(Debug)]
pub struct ClusterNode {
    address: NodeAddress,
    alive: AtomicBool,
    pool: ConnectionPool,
    metrics: NodeMetrics,
}

impl ClusterNode {
    /// Create the node without opening connections
    pub fn new(address: NodeAddress, factory: ConnectionFactory, pool_config: PoolConfig) -> Self {
        let pool = ConnectionPool::new(&address.host, address.kv_port, factory, pool_config);
        Self {
            address,
            alive: AtomicBool::new(true),
            pool,
            metrics: NodeMetrics::new(),
        }
    }

    /// Open the pool's minimum connections; a node that cannot be reached
    /// is marked dead
    pub fn prewarm(&self) {
        if let Err(e) = self.pool.prewarm() {
            warn!("Could not pre-warm pool for {}: {}", self.address, e);
            self.alive.store(false, Ordering::Release);
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn endpoint(&self) -> String {
        self.address.endpoint()
    }

    pub fn host(&self) -> &str {
        &self.address.host
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Record a failed connect
    pub fn mark_dead(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            warn!("Node {} marked dead", self.address);
        }
    }

    /// Record a successful exchange; a dead node comes back and gets a
    /// fresh set of pooled connections in the background
    pub fn mark_alive(&self) {
        if !self.alive.swap(true, Ordering::AcqRel) {
            info!("Node {} is alive again", self.address);
            let pool = self.pool.clone();
            let endpoint = self.endpoint();
            thread::spawn(move || {
                if let Err(e) = pool.resurrect() {
                    warn!("Resurrecting pool for {} failed: {}", endpoint, e);
                }
            });
        }
    }

    /// Drain and close the pool
    pub fn dispose(&self) {
        self.pool.dispose();
    }
}
