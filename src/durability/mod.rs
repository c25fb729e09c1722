//! Durability and consistency helpers
//!
//! Sync-replication framing, mutation tokens, and the CAS contract live
//! here. The encoder refuses durability on a channel that never negotiated
//! it; nothing is silently downgraded.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Flexible framing id for the sync-replication segment
pub const SYNC_REPLICATION_FRAME_ID: u8 = 0x01;

/// Required replication/persistence acknowledgment for a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityLevel {
    Majority,
    MajorityAndPersistActive,
    PersistToMajority,
}

impl DurabilityLevel {
    pub fn to_wire(self) -> u8 {
        match self {
            DurabilityLevel::Majority => 0x01,
            DurabilityLevel::MajorityAndPersistActive => 0x02,
            DurabilityLevel::PersistToMajority => 0x03,
        }
    }
}

impl std::fmt::Display for DurabilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DurabilityLevel::Majority => "majority",
            DurabilityLevel::MajorityAndPersistActive => "majority_and_persist_active",
            DurabilityLevel::PersistToMajority => "persist_to_majority",
        };
        f.write_str(s)
    }
}

/// A durability requirement attached to a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurabilityRequirement {
    pub level: DurabilityLevel,
    /// Server-side enforcement deadline; defaults to the operation timeout.
    pub timeout: Option<Duration>,
}

impl DurabilityRequirement {
    pub fn new(level: DurabilityLevel) -> Self {
        Self {
            level,
            timeout: None,
        }
    }
}

/// Build the flexible framing extras segment for a sync-replication request.
///
/// Layout: one id/length byte (`id << 4 | 3`), the level byte, and the
/// enforcement timeout in milliseconds as u16.
pub fn sync_replication_framing(requirement: &DurabilityRequirement, fallback: Duration) -> Bytes {
    let timeout = requirement.timeout.unwrap_or(fallback);
    let timeout_ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;

    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8((SYNC_REPLICATION_FRAME_ID << 4) | 0x03);
    buf.put_u8(requirement.level.to_wire());
    buf.put_u16(timeout_ms);
    buf.freeze()
}

/// A causally-ordered write marker returned by a successful mutation when
/// token negotiation is enabled. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationToken {
    pub bucket: String,
    pub shard_id: u16,
    /// Incarnation of the shard at the time of the write
    pub shard_incarnation: u64,
    pub sequence_number: u64,
}

impl MutationToken {
    /// Decode token extras (shard incarnation u64 + seqno u64) from a
    /// mutation response, combining them with the shard index of the
    /// original request and the channel's bucket.
    pub fn from_extras(extras: &[u8], shard_id: u16, bucket: &str) -> Option<MutationToken> {
        if extras.len() != 16 {
            return None;
        }
        let mut buf = extras;
        let shard_incarnation = buf.get_u64();
        let sequence_number = buf.get_u64();
        Some(MutationToken {
            bucket: bucket.to_string(),
            shard_id,
            shard_incarnation,
            sequence_number,
        })
    }
}
