//! Memcached binary protocol
//!
//! This module provides:
//! - Frame encoding and incremental decoding (24-byte header + body)
//! - Opcode, status and HELLO feature tables
//! - The operation/result model shared by the dispatcher and the client

pub mod frame;
pub mod opcode;
pub mod operation;
pub mod status;

pub use frame::{Frame, FrameDecoder, Header, HEADER_LEN, MAX_BODY_LEN};
pub use opcode::{datatype, subdoc_flags, HelloFeature, Magic, Opcode};
pub use operation::{
    MutationToken, ObserveState, OpaqueGenerator, Operation, OperationResult, COUNTER_NO_CREATE,
    DEFAULT_KV_TIMEOUT, MAX_KEY_LEN,
};
pub use status::{RetryReason, Status, StatusClass};
