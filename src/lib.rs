//! couchbase-kv library
//!
//! Key-value client for Couchbase-style clusters speaking the memcached
//! binary protocol: vBucket and ketama key routing, per-node connection
//! pools, a revision-ordered topology tracker and a dispatcher that retries
//! and redirects operations as the cluster changes.

pub mod client;
pub mod cluster;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod utils;

pub use client::{CancelToken, KvClient, KvOptions, LookupSpec, MutateSpec};
pub use config::ClientConfig;
pub use protocol::{Operation, OperationResult, Status};
pub use utils::{KvError, Result};
