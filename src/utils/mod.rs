//! Utility modules

pub mod error;

pub use error::{ClusterError, ConnectionError, KvError, ProtocolError, Result};
