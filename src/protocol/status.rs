//! Response status codes and their retry classification

use std::fmt;

/// Status field of a response header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    DeltaBadValue,
    NotMyVbucket,
    BucketNotConnected,
    Locked,
    AuthStale,
    AuthError,
    AuthContinue,
    InvalidRange,
    Rollback,
    Eaccess,
    NotInitialized,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    UnknownCollection,
    UnknownScope,
    SubdocPathNotFound,
    SubdocPathMismatch,
    SubdocPathInvalid,
    SubdocPathTooBig,
    SubdocDocTooDeep,
    SubdocCannotInsert,
    SubdocDocNotJson,
    SubdocNumRange,
    SubdocDeltaRange,
    SubdocPathExists,
    SubdocValueTooDeep,
    SubdocInvalidCombo,
    SubdocMultiPathFailure,
    SubdocSuccessDeleted,
    SubdocXattrInvalidFlagCombo,
    SubdocXattrInvalidKeyCombo,
    SubdocXattrUnknownMacro,
    SubdocXattrUnknownVattr,
    SubdocXattrCantModifyVattr,
    SubdocMultiPathFailureDeleted,
    SubdocInvalidXattrOrder,
    Unknown(u16),
}

/// How the dispatcher treats a status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// A valid outcome for the caller; never retried
    Application,
    /// Topology moved or the node is temporarily unable to serve
    Retry,
    /// Connection-level failure that must not be retried
    Fatal,
}

impl Status {
    pub fn from_u16(v: u16) -> Self {
        use Status::*;
        match v {
            0x0000 => Success,
            0x0001 => KeyNotFound,
            0x0002 => KeyExists,
            0x0003 => ValueTooLarge,
            0x0004 => InvalidArguments,
            0x0005 => ItemNotStored,
            0x0006 => DeltaBadValue,
            0x0007 => NotMyVbucket,
            0x0008 => BucketNotConnected,
            0x0009 => Locked,
            0x001f => AuthStale,
            0x0020 => AuthError,
            0x0021 => AuthContinue,
            0x0022 => InvalidRange,
            0x0023 => Rollback,
            0x0024 => Eaccess,
            0x0025 => NotInitialized,
            0x0081 => UnknownCommand,
            0x0082 => OutOfMemory,
            0x0083 => NotSupported,
            0x0084 => InternalError,
            0x0085 => Busy,
            0x0086 => TemporaryFailure,
            0x0088 => UnknownCollection,
            0x008c => UnknownScope,
            0x00c0 => SubdocPathNotFound,
            0x00c1 => SubdocPathMismatch,
            0x00c2 => SubdocPathInvalid,
            0x00c3 => SubdocPathTooBig,
            0x00c4 => SubdocDocTooDeep,
            0x00c5 => SubdocCannotInsert,
            0x00c6 => SubdocDocNotJson,
            0x00c7 => SubdocNumRange,
            0x00c8 => SubdocDeltaRange,
            0x00c9 => SubdocPathExists,
            0x00ca => SubdocValueTooDeep,
            0x00cb => SubdocInvalidCombo,
            0x00cc => SubdocMultiPathFailure,
            0x00cd => SubdocSuccessDeleted,
            0x00ce => SubdocXattrInvalidFlagCombo,
            0x00cf => SubdocXattrInvalidKeyCombo,
            0x00d0 => SubdocXattrUnknownMacro,
            0x00d1 => SubdocXattrUnknownVattr,
            0x00d2 => SubdocXattrCantModifyVattr,
            0x00d3 => SubdocMultiPathFailureDeleted,
            0x00d4 => SubdocInvalidXattrOrder,
            other => Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        use Status::*;
        match self {
            Success => 0x0000,
            KeyNotFound => 0x0001,
            KeyExists => 0x0002,
            ValueTooLarge => 0x0003,
            InvalidArguments => 0x0004,
            ItemNotStored => 0x0005,
            DeltaBadValue => 0x0006,
            NotMyVbucket => 0x0007,
            BucketNotConnected => 0x0008,
            Locked => 0x0009,
            AuthStale => 0x001f,
            AuthError => 0x0020,
            AuthContinue => 0x0021,
            InvalidRange => 0x0022,
            Rollback => 0x0023,
            Eaccess => 0x0024,
            NotInitialized => 0x0025,
            UnknownCommand => 0x0081,
            OutOfMemory => 0x0082,
            NotSupported => 0x0083,
            InternalError => 0x0084,
            Busy => 0x0085,
            TemporaryFailure => 0x0086,
            UnknownCollection => 0x0088,
            UnknownScope => 0x008c,
            SubdocPathNotFound => 0x00c0,
            SubdocPathMismatch => 0x00c1,
            SubdocPathInvalid => 0x00c2,
            SubdocPathTooBig => 0x00c3,
            SubdocDocTooDeep => 0x00c4,
            SubdocCannotInsert => 0x00c5,
            SubdocDocNotJson => 0x00c6,
            SubdocNumRange => 0x00c7,
            SubdocDeltaRange => 0x00c8,
            SubdocPathExists => 0x00c9,
            SubdocValueTooDeep => 0x00ca,
            SubdocInvalidCombo => 0x00cb,
            SubdocMultiPathFailure => 0x00cc,
            SubdocSuccessDeleted => 0x00cd,
            SubdocXattrInvalidFlagCombo => 0x00ce,
            SubdocXattrInvalidKeyCombo => 0x00cf,
            SubdocXattrUnknownMacro => 0x00d0,
            SubdocXattrUnknownVattr => 0x00d1,
            SubdocXattrCantModifyVattr => 0x00d2,
            SubdocMultiPathFailureDeleted => 0x00d3,
            SubdocInvalidXattrOrder => 0x00d4,
            Unknown(v) => v,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Success | Status::SubdocSuccessDeleted)
    }

    pub fn class(self) -> StatusClass {
        use Status::*;
        match self {
            Success | SubdocSuccessDeleted => StatusClass::Success,
            NotMyVbucket | TemporaryFailure | Busy | BucketNotConnected | NotInitialized => {
                StatusClass::Retry
            }
            AuthStale | AuthError | AuthContinue | Eaccess => StatusClass::Fatal,
            _ => StatusClass::Application,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:04x})", self, self.as_u16())
    }
}

/// Why an operation was sent again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    NotMyVbucket,
    TemporaryFailure,
    NodeNotReady,
    SocketClosed,
    SocketTimeout,
    ConnectFailed,
    QueueFull,
    NodeUnavailable,
}

impl RetryReason {
    /// Reason for a retry-class status; `None` for anything else
    pub fn from_status(status: Status) -> Option<Self> {
        match status {
            Status::NotMyVbucket => Some(RetryReason::NotMyVbucket),
            Status::TemporaryFailure | Status::Busy => Some(RetryReason::TemporaryFailure),
            Status::BucketNotConnected | Status::NotInitialized => Some(RetryReason::NodeNotReady),
            _ => None,
        }
    }

    /// Whether the failure suggests our topology is stale
    pub fn wants_config_refresh(self) -> bool {
        matches!(
            self,
            RetryReason::NotMyVbucket | RetryReason::NodeUnavailable | RetryReason::ConnectFailed
        )
    }
}
