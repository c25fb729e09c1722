//! Binary wire protocol for the Reef key-value service
//!
//! ## Wire Format
//!
//! Every frame starts with a fixed 24-byte header:
//!
//! ```text
//! ┌────────┬────────┬─────────┬─────────┬────────┬──────────┐
//! │magic(1)│opcode(1)│key-len(2)│extras(1)│dtype(1)│shard/    │
//! │        │         │          │  len    │        │status(2) │
//! ├────────┴────────┴─────────┴─────────┴────────┴──────────┤
//! │ total-body-len(4) │ opaque(4) │        cas(8)            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! followed by `[flexible framing extras][extras][key][value]`, in that
//! order. `total-body-len` covers everything after the header. Flexible
//! magics repurpose bytes 2..4 as framing-extras-len(1) + key-len(1).

pub mod codec;
pub mod frame;
pub mod leb128;

pub use codec::{decode_response, encode_request};
pub use frame::{WireFrame, HEADER_SIZE};

/// Frame magics. Flexible variants carry feature-negotiated framing extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Magic {
    Request = 0x80,
    Response = 0x81,
    FlexibleRequest = 0x08,
    FlexibleResponse = 0x18,
}

impl Magic {
    pub fn from_u8(byte: u8) -> Option<Magic> {
        match byte {
            0x80 => Some(Magic::Request),
            0x81 => Some(Magic::Response),
            0x08 => Some(Magic::FlexibleRequest),
            0x18 => Some(Magic::FlexibleResponse),
            _ => None,
        }
    }

    pub fn is_flexible(self) -> bool {
        matches!(self, Magic::FlexibleRequest | Magic::FlexibleResponse)
    }

    pub fn is_request(self) -> bool {
        matches!(self, Magic::Request | Magic::FlexibleRequest)
    }
}

/// Key-value opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Upsert = 0x01,
    Insert = 0x02,
    Replace = 0x03,
    Remove = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Append = 0x0e,
    Prepend = 0x0f,
    GetClusterConfig = 0xb5,
    GetCollectionId = 0xbb,
    SubdocMultiMutation = 0xd1,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        match byte {
            0x00 => Some(Opcode::Get),
            0x01 => Some(Opcode::Upsert),
            0x02 => Some(Opcode::Insert),
            0x03 => Some(Opcode::Replace),
            0x04 => Some(Opcode::Remove),
            0x05 => Some(Opcode::Increment),
            0x06 => Some(Opcode::Decrement),
            0x0e => Some(Opcode::Append),
            0x0f => Some(Opcode::Prepend),
            0xb5 => Some(Opcode::GetClusterConfig),
            0xbb => Some(Opcode::GetCollectionId),
            0xd1 => Some(Opcode::SubdocMultiMutation),
            _ => None,
        }
    }

    /// Does a successful response to this opcode represent a mutation?
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Opcode::Upsert
                | Opcode::Insert
                | Opcode::Replace
                | Opcode::Remove
                | Opcode::Increment
                | Opcode::Decrement
                | Opcode::Append
                | Opcode::Prepend
                | Opcode::SubdocMultiMutation
        )
    }
}

/// Response status codes. The set is closed; anything the decoder does not
/// recognize becomes [`Status::Unknown`] carrying the raw code, never a
/// decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    TooBig,
    NotStored,
    NotMyShard,
    Locked,
    OutOfMemory,
    ServerBusy,
    TemporaryFailure,
    Unknown(u16),
}

impl Status {
    pub fn from_u16(code: u16) -> Status {
        match code {
            0x00 => Status::Success,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::TooBig,
            0x05 => Status::NotStored,
            0x07 => Status::NotMyShard,
            0x09 => Status::Locked,
            0x82 => Status::OutOfMemory,
            0x85 => Status::ServerBusy,
            0x86 => Status::TemporaryFailure,
            other => Status::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Status::Success => 0x00,
            Status::KeyNotFound => 0x01,
            Status::KeyExists => 0x02,
            Status::TooBig => 0x03,
            Status::NotStored => 0x05,
            Status::NotMyShard => 0x07,
            Status::Locked => 0x09,
            Status::OutOfMemory => 0x82,
            Status::ServerBusy => 0x85,
            Status::TemporaryFailure => 0x86,
            Status::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

/// Negotiated per-connection context the codec branches on.
///
/// A connection either encodes collection-prefixed keys or it does not; the
/// flag never changes for the lifetime of the channel.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    /// Bucket this channel is bound to
    pub bucket: String,
    /// Collection-aware key encoding negotiated
    pub collections: bool,
    /// Sync-replication framing negotiated
    pub sync_replication: bool,
    /// Mutation token extras negotiated
    pub mutation_tokens: bool,
}

impl ChannelContext {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            collections: true,
            sync_replication: true,
            mutation_tokens: true,
        }
    }

    pub fn from_config(config: &crate::CoreConfig) -> Self {
        Self {
            bucket: config.bucket.clone(),
            collections: config.enable_collections,
            sync_replication: config.enable_sync_replication,
            mutation_tokens: config.enable_mutation_tokens,
        }
    }
}
