//! Typed key-value operations
//!
//! One closed enum covers every operation the engine can carry. Shared
//! attributes live in [`OperationContext`]; per-variant payloads ride on the
//! variants themselves and are dispatched by exhaustive matching.

use crate::durability::{DurabilityRequirement, MutationToken};
use crate::protocol::{Opcode, Status};
use crate::retry::RetryPolicy;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Attributes shared by every operation variant.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Document key (raw bytes, without any collection prefix)
    pub key: Bytes,
    /// Collection the key lives in; `None` means the default collection
    pub collection_id: Option<u32>,
    /// Input CAS; 0 means unconditional
    pub cas: u64,
    /// Per-operation timeout
    pub timeout: Duration,
    /// Durability requirement, if any
    pub durability: Option<DurabilityRequirement>,
    /// Retry policy override; the core's default applies when absent
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl OperationContext {
    pub fn new(key: impl Into<Bytes>, timeout: Duration) -> Self {
        Self {
            key: key.into(),
            collection_id: None,
            cas: 0,
            timeout,
            durability: None,
            retry_policy: None,
        }
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_collection(mut self, id: u32) -> Self {
        self.collection_id = Some(id);
        self
    }

    pub fn with_durability(mut self, requirement: DurabilityRequirement) -> Self {
        self.durability = Some(requirement);
        self
    }
}

/// One mutation inside a subdoc multi-mutation body.
#[derive(Debug, Clone)]
pub struct SubdocMutationSpec {
    /// Subdoc command opcode
    pub opcode: u8,
    /// Path flags (create parents, xattr, ...)
    pub flags: u8,
    pub path: Bytes,
    pub value: Bytes,
}

/// Every operation the engine knows how to carry.
#[derive(Debug, Clone)]
pub enum Operation {
    Get {
        ctx: OperationContext,
    },
    Upsert {
        ctx: OperationContext,
        value: Bytes,
        flags: u32,
        expiry: u32,
    },
    Insert {
        ctx: OperationContext,
        value: Bytes,
        flags: u32,
        expiry: u32,
    },
    Replace {
        ctx: OperationContext,
        value: Bytes,
        flags: u32,
        expiry: u32,
    },
    Remove {
        ctx: OperationContext,
    },
    Increment {
        ctx: OperationContext,
        delta: u64,
        /// Seed value when the key does not exist; `None` means the
        /// operation fails on a missing key.
        initial: Option<u64>,
        expiry: u32,
    },
    Decrement {
        ctx: OperationContext,
        delta: u64,
        initial: Option<u64>,
        expiry: u32,
    },
    Append {
        ctx: OperationContext,
        value: Bytes,
    },
    Prepend {
        ctx: OperationContext,
        value: Bytes,
    },
    SubdocMutate {
        ctx: OperationContext,
        specs: Vec<SubdocMutationSpec>,
        expiry: u32,
    },
    /// In-band topology fetch over a data connection
    GetClusterConfig {
        ctx: OperationContext,
    },
    /// Resolve a collection path ("scope.collection") to its id
    GetCollectionId {
        ctx: OperationContext,
        path: String,
    },
    /// Local routing query: which shard owns this key. Never hits the wire.
    GetShardId {
        ctx: OperationContext,
    },
}

impl Operation {
    pub fn context(&self) -> &OperationContext {
        match self {
            Operation::Get { ctx }
            | Operation::Upsert { ctx, .. }
            | Operation::Insert { ctx, .. }
            | Operation::Replace { ctx, .. }
            | Operation::Remove { ctx }
            | Operation::Increment { ctx, .. }
            | Operation::Decrement { ctx, .. }
            | Operation::Append { ctx, .. }
            | Operation::Prepend { ctx, .. }
            | Operation::SubdocMutate { ctx, .. }
            | Operation::GetClusterConfig { ctx }
            | Operation::GetCollectionId { ctx, .. }
            | Operation::GetShardId { ctx } => ctx,
        }
    }

    pub fn context_mut(&mut self) -> &mut OperationContext {
        match self {
            Operation::Get { ctx }
            | Operation::Upsert { ctx, .. }
            | Operation::Insert { ctx, .. }
            | Operation::Replace { ctx, .. }
            | Operation::Remove { ctx }
            | Operation::Increment { ctx, .. }
            | Operation::Decrement { ctx, .. }
            | Operation::Append { ctx, .. }
            | Operation::Prepend { ctx, .. }
            | Operation::SubdocMutate { ctx, .. }
            | Operation::GetClusterConfig { ctx }
            | Operation::GetCollectionId { ctx, .. }
            | Operation::GetShardId { ctx } => ctx,
        }
    }

    /// Wire opcode, or `None` for operations answered locally.
    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            Operation::Get { .. } => Some(Opcode::Get),
            Operation::Upsert { .. } => Some(Opcode::Upsert),
            Operation::Insert { .. } => Some(Opcode::Insert),
            Operation::Replace { .. } => Some(Opcode::Replace),
            Operation::Remove { .. } => Some(Opcode::Remove),
            Operation::Increment { .. } => Some(Opcode::Increment),
            Operation::Decrement { .. } => Some(Opcode::Decrement),
            Operation::Append { .. } => Some(Opcode::Append),
            Operation::Prepend { .. } => Some(Opcode::Prepend),
            Operation::SubdocMutate { .. } => Some(Opcode::SubdocMultiMutation),
            Operation::GetClusterConfig { .. } => Some(Opcode::GetClusterConfig),
            Operation::GetCollectionId { .. } => Some(Opcode::GetCollectionId),
            Operation::GetShardId { .. } => None,
        }
    }

    /// Can this operation be replayed without changing its meaning?
    ///
    /// Reads are always idempotent. Mutations are idempotent only when the
    /// caller pinned them with a CAS: a replay then either applies the same
    /// precondition or fails with a CAS conflict, never double-applies.
    pub fn is_idempotent(&self) -> bool {
        match self {
            Operation::Get { .. }
            | Operation::GetClusterConfig { .. }
            | Operation::GetCollectionId { .. }
            | Operation::GetShardId { .. } => true,
            op => op.context().cas != 0,
        }
    }

    /// Does the operation route to a specific shard by key?
    pub fn is_keyed(&self) -> bool {
        !matches!(
            self,
            Operation::GetClusterConfig { .. } | Operation::GetCollectionId { .. }
        )
    }
}

/// The decoded result of one operation. Immutable once produced.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: Status,
    pub cas: u64,
    pub value: Bytes,
    pub extras: Bytes,
    pub datatype: u8,
    pub mutation_token: Option<MutationToken>,
}

impl Outcome {
    /// Counter responses carry the new value as 8 big-endian bytes.
    pub fn counter_value(&self) -> Option<u64> {
        if self.value.len() == 8 {
            Some(u64::from_be_bytes(self.value[..8].try_into().ok()?))
        } else {
            None
        }
    }

    /// Shard-id responses (local [`Operation::GetShardId`]) carry 2 bytes.
    pub fn shard_id(&self) -> Option<u16> {
        if self.value.len() == 2 {
            Some(u16::from_be_bytes([self.value[0], self.value[1]]))
        } else {
            None
        }
    }

    /// Collection-id responses carry manifest revision (8 bytes) followed by
    /// the id (4 bytes) in the extras.
    pub fn collection_id(&self) -> Option<u32> {
        let id = match self.extras.len() {
            12 => &self.extras[8..12],
            4 => &self.extras[0..4],
            _ => return None,
        };
        Some(u32::from_be_bytes([id[0], id[1], id[2], id[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(key: &'static [u8]) -> OperationContext {
        OperationContext::new(Bytes::from_static(key), Duration::from_millis(2500))
    }

    #[test]
    fn test_reads_are_idempotent() {
        assert!(Operation::Get { ctx: ctx(b"k") }.is_idempotent());
        assert!(Operation::GetClusterConfig { ctx: ctx(b"") }.is_idempotent());
    }

    #[test]
    fn test_unconditional_counter_not_idempotent() {
        let op = Operation::Increment {
            ctx: ctx(b"counter"),
            delta: 1,
            initial: None,
            expiry: 0,
        };
        assert!(!op.is_idempotent());
    }

    #[test]
    fn test_cas_pinned_mutation_idempotent() {
        let op = Operation::Replace {
            ctx: ctx(b"doc").with_cas(0xfeed),
            value: Bytes::from_static(b"{}"),
            flags: 0,
            expiry: 0,
        };
        assert!(op.is_idempotent());
    }

    #[test]
    fn test_counter_value_helper() {
        let outcome = Outcome {
            status: Status::Success,
            cas: 1,
            value: Bytes::copy_from_slice(&7u64.to_be_bytes()),
            extras: Bytes::new(),
            datatype: 0,
            mutation_token: None,
        };
        assert_eq!(outcome.counter_value(), Some(7));
    }
}
