//! Opcode, magic and feature tables of the memcached binary protocol

/// Frame magic byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Magic {
    Request = 0x80,
    Response = 0x81,
    /// Server-initiated request (duplex mode)
    ServerRequest = 0x82,
}

impl Magic {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x80 => Some(Magic::Request),
            0x81 => Some(Magic::Response),
            0x82 => Some(Magic::ServerRequest),
            _ => None,
        }
    }
}

macro_rules! opcodes {
    ($($name:ident = $value:literal),* $(,)?) => {
        /// Command opcodes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $value),*
        }

        impl Opcode {
            pub fn from_u8(b: u8) -> Option<Self> {
                match b {
                    $($value => Some(Opcode::$name),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Noop = 0x0a,
    Append = 0x0e,
    Prepend = 0x0f,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    GetReplica = 0x83,
    SelectBucket = 0x89,
    Observe = 0x92,
    GetAndLock = 0x94,
    Unlock = 0x95,
    GetClusterConfig = 0xb5,
    SubdocGet = 0xc5,
    SubdocExists = 0xc6,
    SubdocDictAdd = 0xc7,
    SubdocDictUpsert = 0xc8,
    SubdocDelete = 0xc9,
    SubdocReplace = 0xca,
    SubdocArrayPushLast = 0xcb,
    SubdocArrayPushFirst = 0xcc,
    SubdocArrayInsert = 0xcd,
    SubdocArrayAddUnique = 0xce,
    SubdocCounter = 0xcf,
    SubdocGetCount = 0xd2,
    GetErrorMap = 0xfe,
}

impl Opcode {
    /// Whether the command changes the document (mutation token applies)
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Opcode::Set
                | Opcode::Add
                | Opcode::Replace
                | Opcode::Delete
                | Opcode::Increment
                | Opcode::Decrement
                | Opcode::Append
                | Opcode::Prepend
                | Opcode::SubdocDictAdd
                | Opcode::SubdocDictUpsert
                | Opcode::SubdocDelete
                | Opcode::SubdocReplace
                | Opcode::SubdocArrayPushLast
                | Opcode::SubdocArrayPushFirst
                | Opcode::SubdocArrayInsert
                | Opcode::SubdocArrayAddUnique
                | Opcode::SubdocCounter
        )
    }

    /// Sub-document single-path commands
    pub fn is_subdoc(self) -> bool {
        (Opcode::SubdocGet as u8..=Opcode::SubdocGetCount as u8).contains(&(self as u8))
    }

    /// Commands that are safe to resend without changing the outcome
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            Opcode::Get
                | Opcode::GetReplica
                | Opcode::Noop
                | Opcode::Observe
                | Opcode::GetClusterConfig
                | Opcode::SubdocGet
                | Opcode::SubdocExists
                | Opcode::SubdocGetCount
                | Opcode::Touch
                | Opcode::GetAndTouch
        )
    }

    /// Commands routed to a node by their document key
    pub fn is_keyed(self) -> bool {
        !matches!(
            self,
            Opcode::Noop
                | Opcode::Hello
                | Opcode::SaslListMechs
                | Opcode::SaslAuth
                | Opcode::SaslStep
                | Opcode::SelectBucket
                | Opcode::GetClusterConfig
                | Opcode::GetErrorMap
        )
    }
}

/// Data type bits carried in the header
pub mod datatype {
    pub const RAW: u8 = 0x00;
    pub const JSON: u8 = 0x01;
    pub const SNAPPY: u8 = 0x02;
    pub const XATTR: u8 = 0x04;
}

/// Features negotiated through HELLO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum HelloFeature {
    Datatype = 0x01,
    Tls = 0x02,
    TcpNoDelay = 0x03,
    MutationSeqno = 0x04,
    TcpDelay = 0x05,
    Xattr = 0x06,
    Xerror = 0x07,
    SelectBucket = 0x08,
    Snappy = 0x0a,
    Json = 0x0b,
    Duplex = 0x0c,
    ClustermapChangeNotification = 0x0d,
    UnorderedExecution = 0x0e,
    Tracing = 0x0f,
    AltRequest = 0x10,
    SyncReplication = 0x11,
    Collections = 0x12,
}

impl HelloFeature {
    pub fn from_u16(v: u16) -> Option<Self> {
        use HelloFeature::*;
        let all = [
            Datatype,
            Tls,
            TcpNoDelay,
            MutationSeqno,
            TcpDelay,
            Xattr,
            Xerror,
            SelectBucket,
            Snappy,
            Json,
            Duplex,
            ClustermapChangeNotification,
            UnorderedExecution,
            Tracing,
            AltRequest,
            SyncReplication,
            Collections,
        ];
        all.into_iter().find(|f| *f as u16 == v)
    }
}

/// Sub-document path flags
pub mod subdoc_flags {
    pub const NONE: u8 = 0x00;
    pub const MKDIR_P: u8 = 0x01;
    pub const XATTR_PATH: u8 = 0x04;
}
