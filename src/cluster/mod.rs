//! Cluster topology and key routing
//!
//! This module provides:
//! - Cluster map parsing (vBucket and ketama buckets)
//! - CRC32 vBucket hashing and the ketama continuum
//! - Nodes owning their connection pools
//! - The topology tracker that swaps snapshots by revision

pub mod config_map;
pub mod ketama;
pub mod key_mapper;
pub mod node;
pub mod topology;
pub mod topology_manager;
pub mod vbucket;

pub use config_map::{ClusterMap, Locator, NodeAddress, VBucketTable, DEFAULT_KV_PORT};
pub use ketama::Continuum;
pub use key_mapper::{KeyMapper, Route};
pub use node::ClusterNode;
pub use topology::Topology;
pub use topology_manager::TopologyManager;
pub use vbucket::{vbucket_for_key, VBucketMap};
