//! Client layer
//!
//! - Connections with the HELLO/SASL/SELECT_BUCKET handshake
//! - Bounded per-node connection pools
//! - The retry/redirect dispatcher and the public [`KvClient`]

pub mod backoff;
pub mod cancel;
pub mod dispatcher;
pub mod kv_client;
pub mod pool;
pub mod raw_connection;
pub mod transcoder;

#[cfg(test)]
pub(crate) mod mock_server;

pub use backoff::Backoff;
pub use cancel::{CancelOnDrop, CancelToken};
pub use dispatcher::Dispatcher;
pub use kv_client::{KvClient, KvOptions, LookupSpec, MutateSpec};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use raw_connection::{Connection, ConnectionFactory, ConnectionHandle};
pub use transcoder::{JsonTranscoder, RawTranscoder, Transcoder};
