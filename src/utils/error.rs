//! Error types for couchbase-kv

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{Opcode, RetryReason, Status};

/// Top-level client error
///
/// Application-level outcomes (key not found, CAS mismatch, ...) are not
/// errors: they come back inside [`crate::protocol::OperationResult`].
#[derive(Error, Debug)]
pub enum KvError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transcoding failed: {0}")]
    Transcode(String),

    #[error(
        "Operation {opcode:?} on key '{key}' timed out after {elapsed:?} ({attempts} attempts, last reason: {last_reason:?})"
    )]
    Timeout {
        key: String,
        opcode: Opcode,
        attempts: u32,
        elapsed: Duration,
        last_reason: Option<RetryReason>,
    },

    #[error(
        "Operation {opcode:?} on key '{key}' gave up after {attempts} attempts (last reason: {last_reason:?})"
    )]
    RetriesExhausted {
        key: String,
        opcode: Opcode,
        attempts: u32,
        last_reason: Option<RetryReason>,
    },

    /// A mutation reached the server but its answer never came back; it may
    /// or may not have been applied, so it is not sent again
    #[error(
        "Operation {opcode:?} on key '{key}' via {node} got no response after {elapsed:?} ({attempts} attempts); outcome unknown"
    )]
    AmbiguousTimeout {
        key: String,
        opcode: Opcode,
        node: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("No pooled connection to {node} became available within {waited:?}")]
    QueueTimeout { node: String, waited: Duration },

    #[error("Connection pool for {0} is shut down")]
    PoolShutdown(String),

    #[error("Operation {opcode:?} on key '{key}' returned {status}")]
    UnexpectedStatus { key: String, opcode: Opcode, status: Status },

    #[error("Operation {opcode:?} on key '{key}' was cancelled")]
    Cancelled { key: String, opcode: Opcode },

    #[error("Operation {opcode:?} on key '{key}' via {node} failed: {source}")]
    Operation {
        key: String,
        opcode: Opcode,
        node: String,
        attempts: u32,
        #[source]
        source: Box<KvError>,
    },
}

impl KvError {
    /// True for failures the dispatcher may retry on a fresh connection
    pub fn is_transient(&self) -> bool {
        match self {
            KvError::Connection(e) => e.is_transient(),
            KvError::Io(_) | KvError::QueueTimeout { .. } => true,
            _ => false,
        }
    }
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Bucket selection failed: {0}")]
    SelectBucketFailed(String),

    #[error("Connection closed unexpectedly")]
    Closed,

    #[error("No data from socket for {0}ms")]
    SocketTimeout(u64),

    #[error("Operation deadline reached while waiting for response")]
    DeadlineExceeded,

    #[error("Waiting for response was cancelled")]
    Cancelled,

    #[error("IO error on connection: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Auth failures are fatal; everything else is a transport hiccup
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ConnectionError::AuthFailed(_)
                | ConnectionError::SelectBucketFailed(_)
                | ConnectionError::Cancelled
                | ConnectionError::DeadlineExceeded
        )
    }
}

/// Binary protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid magic byte: 0x{0:02X}")]
    InvalidMagic(u8),

    #[error("Unexpected server-initiated request (opcode 0x{0:02X})")]
    UnexpectedServerRequest(u8),

    #[error("Inconsistent frame lengths: key {key_len} + extras {extras_len} exceeds body {body_len}")]
    InconsistentLengths {
        key_len: u16,
        extras_len: u8,
        body_len: u32,
    },

    #[error("Frame body of {0} bytes exceeds the maximum allowed")]
    BodyTooLarge(u32),

    #[error("Response opaque {actual} does not match request opaque {expected}")]
    OpaqueMismatch { expected: u32, actual: u32 },

    #[error("Response opcode 0x{actual:02X} does not match request opcode 0x{expected:02X}")]
    OpcodeMismatch { expected: u8, actual: u8 },

    #[error("Key of {0} bytes exceeds the 250 byte limit")]
    KeyTooLong(usize),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Invalid cluster map: {0}")]
    InvalidConfig(String),
}

/// Cluster-related errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Bootstrap failed against every seed: {0}")]
    BootstrapFailed(String),

    #[error("Cluster map contains no nodes")]
    NoNodes,

    #[error("vBucket {0} has no assigned node")]
    UnassignedVbucket(u16),

    #[error("No replica {replica} for vBucket {vbucket}")]
    NoReplica { vbucket: u16, replica: usize },

    #[error("Unsupported node locator: {0}")]
    UnsupportedLocator(String),

    #[error("Node {0} not found in topology")]
    NodeNotFound(String),

    #[error("Client is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, KvError>;
