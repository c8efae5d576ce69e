//! Operation and result model
//!
//! One `Operation` struct covers every command; the opcode decides how the
//! extras are laid out and how the response is interpreted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use super::frame::Frame;
use super::opcode::{datatype, Opcode};
use super::status::{RetryReason, Status};
use crate::utils::ProtocolError;

/// Longest document key the server accepts
pub const MAX_KEY_LEN: usize = 250;

/// Default per-operation timeout
pub const DEFAULT_KV_TIMEOUT: Duration = Duration::from_millis(2500);

/// Expiry value telling Increment/Decrement not to create a missing counter
pub const COUNTER_NO_CREATE: u32 = 0xffff_ffff;

/// Source of correlation ids, owned by a client instance
///
/// Ids are unique across concurrently in-flight operations until the
/// 32-bit space wraps.
#[derive(Debug)]
pub struct OpaqueGenerator {
    next: AtomicU32,
}

impl Default for OpaqueGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl OpaqueGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Sequence number returned by a mutation for read-your-write consistency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationToken {
    pub vbucket: u16,
    pub vbucket_uuid: u64,
    pub seqno: u64,
}

/// Persistence/replication state reported by Observe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveState {
    FoundNotPersisted,
    FoundPersisted,
    NotFound,
    LogicallyDeleted,
    Unknown(u8),
}

impl ObserveState {
    fn from_u8(b: u8) -> Self {
        match b {
            0x00 => ObserveState::FoundNotPersisted,
            0x01 => ObserveState::FoundPersisted,
            0x80 => ObserveState::NotFound,
            0x81 => ObserveState::LogicallyDeleted,
            other => ObserveState::Unknown(other),
        }
    }
}

/// A single client request
#[derive(Debug, Clone)]
pub struct Operation {
    pub opcode: Opcode,
    pub key: Vec<u8>,
    pub extras: Vec<u8>,
    pub value: Vec<u8>,
    pub datatype: u8,
    /// CAS sent with the request; replaced by the server's CAS on success
    pub cas: u64,
    /// Filled in by the key mapper on every attempt
    pub vbucket: Option<u16>,
    /// Replica index for replica reads (1-based)
    pub replica: Option<usize>,
    /// Correlation id of the latest attempt
    pub opaque: u32,
    pub timeout: Duration,
    pub created: Instant,
    pub attempts: u32,
    pub retry_reasons: Vec<RetryReason>,
    pub mutation_token: Option<MutationToken>,
}

impl Operation {
    pub fn new(opcode: Opcode, key: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            key: key.into(),
            extras: Vec::new(),
            value: Vec::new(),
            datatype: datatype::RAW,
            cas: 0,
            vbucket: None,
            replica: None,
            opaque: 0,
            timeout: DEFAULT_KV_TIMEOUT,
            created: Instant::now(),
            attempts: 0,
            retry_reasons: Vec::new(),
            mutation_token: None,
        }
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Get, key)
    }

    pub fn get_replica(key: impl Into<Vec<u8>>, replica: usize) -> Self {
        let mut op = Self::new(Opcode::GetReplica, key);
        op.replica = Some(replica.max(1));
        op
    }

    pub fn get_and_touch(key: impl Into<Vec<u8>>, expiry: u32) -> Self {
        let mut op = Self::new(Opcode::GetAndTouch, key);
        op.extras = expiry.to_be_bytes().to_vec();
        op
    }

    pub fn get_and_lock(key: impl Into<Vec<u8>>, lock_time: u32) -> Self {
        let mut op = Self::new(Opcode::GetAndLock, key);
        op.extras = lock_time.to_be_bytes().to_vec();
        op
    }

    pub fn unlock(key: impl Into<Vec<u8>>, cas: u64) -> Self {
        Self::new(Opcode::Unlock, key).with_cas(cas)
    }

    pub fn touch(key: impl Into<Vec<u8>>, expiry: u32) -> Self {
        let mut op = Self::new(Opcode::Touch, key);
        op.extras = expiry.to_be_bytes().to_vec();
        op
    }

    /// Set, Add or Replace
    pub fn store(
        opcode: Opcode,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        flags: u32,
        expiry: u32,
    ) -> Self {
        debug_assert!(matches!(opcode, Opcode::Set | Opcode::Add | Opcode::Replace));
        let mut op = Self::new(opcode, key);
        let mut extras = Vec::with_capacity(8);
        extras.extend_from_slice(&flags.to_be_bytes());
        extras.extend_from_slice(&expiry.to_be_bytes());
        op.extras = extras;
        op.value = value.into();
        op
    }

    pub fn upsert(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, flags: u32, expiry: u32) -> Self {
        Self::store(Opcode::Set, key, value, flags, expiry)
    }

    pub fn insert(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, flags: u32, expiry: u32) -> Self {
        Self::store(Opcode::Add, key, value, flags, expiry)
    }

    pub fn replace(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, flags: u32, expiry: u32) -> Self {
        Self::store(Opcode::Replace, key, value, flags, expiry)
    }

    pub fn remove(key: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Delete, key)
    }

    /// Append or Prepend raw bytes
    pub fn concat(opcode: Opcode, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        debug_assert!(matches!(opcode, Opcode::Append | Opcode::Prepend));
        let mut op = Self::new(opcode, key);
        op.value = value.into();
        op
    }

    /// Increment or Decrement; `initial` is stored when the key is missing
    /// unless `expiry` is [`COUNTER_NO_CREATE`]
    pub fn counter(
        opcode: Opcode,
        key: impl Into<Vec<u8>>,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> Self {
        debug_assert!(matches!(opcode, Opcode::Increment | Opcode::Decrement));
        let mut op = Self::new(opcode, key);
        let mut extras = Vec::with_capacity(20);
        extras.extend_from_slice(&delta.to_be_bytes());
        extras.extend_from_slice(&initial.to_be_bytes());
        extras.extend_from_slice(&expiry.to_be_bytes());
        op.extras = extras;
        op
    }

    pub fn observe(key: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Observe, key)
    }

    pub fn noop() -> Self {
        Self::new(Opcode::Noop, Vec::<u8>::new())
    }

    pub fn get_cluster_config() -> Self {
        Self::new(Opcode::GetClusterConfig, Vec::<u8>::new())
    }

    /// Single-path sub-document command
    pub fn subdoc(
        opcode: Opcode,
        key: impl Into<Vec<u8>>,
        path: &str,
        fragment: impl Into<Vec<u8>>,
        path_flags: u8,
        expiry: Option<u32>,
    ) -> Self {
        debug_assert!(opcode.is_subdoc());
        let mut op = Self::new(opcode, key);
        let path = path.as_bytes();
        let mut extras = Vec::with_capacity(7);
        extras.extend_from_slice(&(path.len() as u16).to_be_bytes());
        extras.push(path_flags);
        if let Some(expiry) = expiry {
            extras.extend_from_slice(&expiry.to_be_bytes());
        }
        op.extras = extras;
        let fragment = fragment.into();
        let mut value = Vec::with_capacity(path.len() + fragment.len());
        value.extend_from_slice(path);
        value.extend_from_slice(&fragment);
        op.value = value;
        op
    }

    /// Key as text for logs and error messages
    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    /// Absolute deadline of the operation
    pub fn deadline(&self) -> Instant {
        self.created + self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }

    /// Remember why the operation is being sent again
    pub fn record_retry(&mut self, reason: RetryReason) {
        self.retry_reasons.push(reason);
    }

    pub fn last_retry_reason(&self) -> Option<RetryReason> {
        self.retry_reasons.last().copied()
    }

    /// Encode the request frame for one attempt
    pub fn encode(&self, opaque: u32) -> Result<Frame, ProtocolError> {
        if self.key.len() > MAX_KEY_LEN {
            return Err(ProtocolError::KeyTooLong(self.key.len()));
        }
        let vbucket = self.vbucket.unwrap_or(0);

        match self.opcode {
            Opcode::Observe => {
                // key travels in the body together with its vBucket
                let mut value = Vec::with_capacity(4 + self.key.len());
                value.extend_from_slice(&vbucket.to_be_bytes());
                value.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
                value.extend_from_slice(&self.key);
                Frame::request(self.opcode as u8, 0, opaque, 0, 0, Vec::new(), Vec::new(), value)
            }
            _ => Frame::request(
                self.opcode as u8,
                vbucket,
                opaque,
                self.cas,
                self.datatype,
                self.extras.clone(),
                self.key.clone(),
                self.value.clone(),
            ),
        }
    }
}

/// Outcome of an operation as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub opcode: Opcode,
    pub status: Status,
    pub value: Vec<u8>,
    pub cas: u64,
    pub flags: u32,
    pub datatype: u8,
    pub mutation_token: Option<MutationToken>,
}

impl OperationResult {
    /// Interpret a response frame for the given request
    pub fn from_response(opcode: Opcode, vbucket: Option<u16>, frame: Frame) -> Self {
        let status = frame.status();
        let mut flags = 0;
        let mut mutation_token = None;

        if status.is_success() {
            match opcode {
                Opcode::Get | Opcode::GetReplica | Opcode::GetAndTouch | Opcode::GetAndLock => {
                    if frame.extras.len() >= 4 {
                        flags = u32::from_be_bytes([
                            frame.extras[0],
                            frame.extras[1],
                            frame.extras[2],
                            frame.extras[3],
                        ]);
                    }
                }
                op if op.is_mutation() && frame.extras.len() == 16 => {
                    let mut uuid = [0u8; 8];
                    let mut seqno = [0u8; 8];
                    uuid.copy_from_slice(&frame.extras[..8]);
                    seqno.copy_from_slice(&frame.extras[8..16]);
                    mutation_token = Some(MutationToken {
                        vbucket: vbucket.unwrap_or(0),
                        vbucket_uuid: u64::from_be_bytes(uuid),
                        seqno: u64::from_be_bytes(seqno),
                    });
                }
                _ => {}
            }
        }

        Self {
            opcode,
            status,
            cas: frame.header.cas,
            datatype: frame.header.datatype,
            value: frame.value,
            flags,
            mutation_token,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Counter value returned by Increment/Decrement
    pub fn counter_value(&self) -> Option<u64> {
        if !self.is_success() || !matches!(self.opcode, Opcode::Increment | Opcode::Decrement) {
            return None;
        }
        let bytes: [u8; 8] = self.value.get(..8)?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Key state and CAS from an Observe response
    pub fn observe_state(&self) -> Result<(ObserveState, u64), ProtocolError> {
        let v = &self.value;
        if v.len() < 4 {
            return Err(ProtocolError::Malformed("observe body too short".into()));
        }
        let key_len = u16::from_be_bytes([v[2], v[3]]) as usize;
        let state_at = 4 + key_len;
        if v.len() < state_at + 9 {
            return Err(ProtocolError::Malformed("observe body truncated".into()));
        }
        let mut cas = [0u8; 8];
        cas.copy_from_slice(&v[state_at + 1..state_at + 9]);
        Ok((ObserveState::from_u8(v[state_at]), u64::from_be_bytes(cas)))
    }

    /// Server-supplied text for failures
    pub fn error_text(&self) -> Option<String> {
        if self.is_success() || self.value.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.value).into_owned())
        }
    }
}
