//! Error types for reefkv

use crate::retry::RetryReason;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why an operation was cancelled before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    /// The caller stopped listening for the result.
    StoppedListening,
    /// The operation deadline elapsed.
    TimedOut,
    /// The target node disappeared from the topology.
    TargetNodeRemoved,
}

impl std::fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CancellationReason::StoppedListening => "stopped listening",
            CancellationReason::TimedOut => "timed out",
            CancellationReason::TargetNodeRemoved => "target node removed",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Protocol Errors ===
    #[error("Malformed frame: {0}")]
    ProtocolDecode(String),

    #[error("Unexpected status 0x{code:02x} for opcode 0x{opcode:02x}")]
    UnexpectedStatus { code: u16, opcode: u8 },

    #[error("Request too big")]
    RequestTooBig,

    // === Dispatch Errors ===
    #[error("Operation timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Operation cancelled: {0}")]
    Cancelled(CancellationReason),

    #[error("Connection closed with operation in flight")]
    ConnectionClosed,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Key-Value Errors ===
    #[error("Document not found")]
    DocumentNotFound,

    #[error("Document already exists")]
    DocumentAlreadyExists,

    #[error("CAS mismatch: document was concurrently modified")]
    CasConflict,

    #[error("Document is locked")]
    Locked,

    #[error("Value was not stored")]
    NotStored,

    // === Server Pushback ===
    #[error("Temporary failure, try again later")]
    TemporaryFailure,

    #[error("Server busy")]
    ServerBusy,

    #[error("Server out of memory")]
    OutOfMemory,

    // === Routing Errors ===
    #[error("Shard {0} is no longer owned by the contacted node")]
    StaleShardOwnership(u16),

    #[error("No node available for shard {0}")]
    NoNodeForShard(u16),

    // === Durability Errors ===
    #[error("Durability level {0} not negotiated on this connection")]
    DurabilityNotAvailable(crate::durability::DurabilityLevel),

    // === Config Errors ===
    #[error("Config load failed from {seed}: {reason}")]
    ConfigLoad { seed: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map a failure to the reason the retry engine reasons about.
    ///
    /// Returns `None` for failures that are terminal by contract:
    /// cancellation, CAS conflicts, and plain key-value outcomes.
    pub fn retry_reason(&self) -> Option<RetryReason> {
        match self {
            Error::TemporaryFailure => Some(RetryReason::TemporaryFailure),
            Error::ServerBusy => Some(RetryReason::ServerBusy),
            Error::OutOfMemory => Some(RetryReason::OutOfMemory),
            Error::ConnectionClosed => Some(RetryReason::ConnectionClosed),
            Error::ConnectionFailed(_) => Some(RetryReason::NotDispatched),
            Error::StaleShardOwnership(_) => Some(RetryReason::StaleShardOwnership),
            Error::NoNodeForShard(_) => Some(RetryReason::NotDispatched),
            Error::Locked => Some(RetryReason::Locked),
            _ => None,
        }
    }

    /// Is this error transient at all?
    pub fn is_retryable(&self) -> bool {
        self.retry_reason().is_some()
    }

    /// A malformed frame poisons the whole connection, not just one operation.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::ProtocolDecode(_))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
