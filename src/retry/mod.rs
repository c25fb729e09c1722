//! Retry engine
//!
//! A pluggable policy decides, per failed attempt, whether the operation
//! re-enters routing or the failure propagates to the caller. Two contracts
//! hold regardless of policy and are enforced by the orchestrator, not here:
//! cancelled operations and CAS conflicts always propagate.

use crate::operation::Operation;
use rand::Rng;
use std::time::Duration;

/// Why an attempt failed, from the retry engine's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    TemporaryFailure,
    ServerBusy,
    OutOfMemory,
    /// Connection dropped with the request possibly on the wire
    ConnectionClosed,
    /// The contacted node no longer owns the target shard
    StaleShardOwnership,
    /// The attempt never reached a connection's write queue
    NotDispatched,
    /// Document locked server-side
    Locked,
}

impl RetryReason {
    /// True when the failure guarantees the server never saw the request,
    /// which makes retrying safe even for non-idempotent operations.
    pub fn guarantees_not_dispatched(self) -> bool {
        matches!(self, RetryReason::NotDispatched)
    }
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RetryReason::TemporaryFailure => "temporary failure",
            RetryReason::ServerBusy => "server busy",
            RetryReason::OutOfMemory => "out of memory",
            RetryReason::ConnectionClosed => "connection closed",
            RetryReason::StaleShardOwnership => "stale shard ownership",
            RetryReason::NotDispatched => "not dispatched",
            RetryReason::Locked => "locked",
        };
        f.write_str(s)
    }
}

/// Verdict for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryNow,
    RetryAfter(Duration),
    Propagate,
}

/// Decides retry vs. propagate for a failed attempt.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    fn should_retry(
        &self,
        op: &Operation,
        reason: RetryReason,
        attempt: u32,
        elapsed: Duration,
    ) -> RetryDecision;
}

/// Default policy: retry transient failures indefinitely within the
/// operation's own timeout, with capped exponential backoff and jitter.
///
/// Non-idempotent operations are only replayed when the failure guarantees
/// the original attempt never reached the server; an ambiguous send
/// propagates so the caller decides.
#[derive(Debug, Clone)]
pub struct BestEffortRetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl BestEffortRetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX));
        let capped = exp.min(self.max_delay);
        // full jitter keeps concurrent retries from stampeding one node
        let jitter = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64);
        Duration::from_millis(jitter)
    }
}

impl Default for BestEffortRetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1), Duration::from_millis(500))
    }
}

impl RetryPolicy for BestEffortRetryPolicy {
    fn should_retry(
        &self,
        op: &Operation,
        reason: RetryReason,
        attempt: u32,
        _elapsed: Duration,
    ) -> RetryDecision {
        if !op.is_idempotent() && !reason.guarantees_not_dispatched() {
            return RetryDecision::Propagate;
        }
        match reason {
            // Stale ownership retries immediately: either a fresh topology
            // already re-routes us, or the old owner still answers.
            RetryReason::StaleShardOwnership | RetryReason::NotDispatched if attempt == 0 => {
                RetryDecision::RetryNow
            }
            _ => RetryDecision::RetryAfter(self.backoff(attempt)),
        }
    }
}

/// Policy that never retries anything.
#[derive(Debug, Clone, Default)]
pub struct FailFastRetryPolicy;

impl RetryPolicy for FailFastRetryPolicy {
    fn should_retry(
        &self,
        _op: &Operation,
        _reason: RetryReason,
        _attempt: u32,
        _elapsed: Duration,
    ) -> RetryDecision {
        RetryDecision::Propagate
    }
}
