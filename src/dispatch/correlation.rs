//! Request/response correlation
//!
//! Every in-flight operation on a connection is tracked here, keyed by its
//! opaque correlation id. The table owns each pending entry for its whole
//! lifetime: resolution, timeout expiry, and cancellation all funnel through
//! it, and each entry resolves exactly once.

use crate::operation::Outcome;
use crate::protocol::Opcode;
use crate::{CancellationReason, Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Pending entry lifecycle. Forward edges only: Created → Dispatched →
/// terminal. A retry is a brand-new entry under a brand-new opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Created,
    Dispatched,
}

#[derive(Debug)]
struct PendingEntry {
    opcode: Opcode,
    shard: u16,
    timeout: Duration,
    deadline: Instant,
    state: PendingState,
    tx: oneshot::Sender<Result<Outcome>>,
}

/// Per-connection table of pending correlations.
#[derive(Debug)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<u32, PendingEntry>>,
    next_opaque: AtomicU32,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_opaque: AtomicU32::new(1),
        }
    }

    /// Register a new pending operation. The opaque is unique among the
    /// entries currently pending on this connection.
    pub fn register(
        &self,
        opcode: Opcode,
        shard: u16,
        timeout: Duration,
    ) -> (u32, oneshot::Receiver<Result<Outcome>>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap();
        let opaque = loop {
            let candidate = self.next_opaque.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(
            opaque,
            PendingEntry {
                opcode,
                shard,
                timeout,
                deadline: Instant::now() + timeout,
                state: PendingState::Created,
                tx,
            },
        );
        (opaque, rx)
    }

    /// Remove an entry without resolving it (encode failed before anything
    /// was queued; the caller reports the error itself).
    pub fn discard(&self, opaque: u32) {
        self.pending.lock().unwrap().remove(&opaque);
    }

    /// Flip Created → Dispatched. Returns false when the entry is already
    /// gone, which tells the writer to drop the frame on the floor.
    pub fn mark_dispatched(&self, opaque: u32) -> bool {
        match self.pending.lock().unwrap().get_mut(&opaque) {
            Some(entry) => {
                entry.state = PendingState::Dispatched;
                true
            }
            None => false,
        }
    }

    /// Opcode and shard of the original request, needed to decode its
    /// response. `None` means late/duplicate: the frame gets discarded.
    pub fn request_meta(&self, opaque: u32) -> Option<(Opcode, u16)> {
        self.pending
            .lock()
            .unwrap()
            .get(&opaque)
            .map(|e| (e.opcode, e.shard))
    }

    /// Resolve a pending operation. Returns false for an unknown opaque.
    pub fn resolve(&self, opaque: u32, result: Result<Outcome>) -> bool {
        match self.pending.lock().unwrap().remove(&opaque) {
            Some(entry) => {
                let _ = entry.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Cancel a pending operation. Removes the entry and resolves it as
    /// cancelled; a response arriving later finds nothing and is discarded.
    pub fn cancel(&self, opaque: u32, reason: CancellationReason) -> bool {
        self.resolve(opaque, Err(Error::Cancelled(reason)))
    }

    /// Resolve every entry past its deadline as a timeout. Returns how many
    /// expired.
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(u32, Duration)> = {
            let pending = self.pending.lock().unwrap();
            pending
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(opaque, e)| (*opaque, e.timeout))
                .collect()
        };
        for (opaque, timeout) in &expired {
            self.resolve(*opaque, Err(Error::Timeout(*timeout)));
        }
        expired.len()
    }

    /// Fail every pending entry when the connection dies. An entry still in
    /// `Created` never reached the write queue, so it resolves as a failed
    /// dispatch the retry engine may replay even for non-idempotent
    /// operations; a `Dispatched` entry is an ambiguous send and resolves
    /// `ConnectionClosed`.
    pub fn fail_all_closed(&self) {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            let error = match entry.state {
                PendingState::Created => {
                    Error::ConnectionFailed("connection lost before dispatch".into())
                }
                PendingState::Dispatched => Error::ConnectionClosed,
            };
            let _ = entry.tx.send(Err(error));
        }
    }

    /// Fail every pending entry with the same error regardless of state.
    pub fn fail_all(&self, make_error: impl Fn() -> Error) {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            let _ = entry.tx.send(Err(make_error()));
        }
    }

    /// Cancel every pending entry with the same reason, e.g. when the
    /// target node vanished from the topology.
    pub fn cancel_all(&self, reason: CancellationReason) {
        self.fail_all(|| Error::Cancelled(reason));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn state_of(&self, opaque: u32) -> Option<PendingState> {
        self.pending.lock().unwrap().get(&opaque).map(|e| e.state)
    }
}

/// Background sweep expiring overdue entries. Holds the table weakly and
/// stops once the connection is gone.
pub fn spawn_sweeper(table: &Arc<CorrelationTable>, interval: Duration) -> JoinHandle<()> {
    let weak: Weak<CorrelationTable> = Arc::downgrade(table);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match weak.upgrade() {
                Some(table) => {
                    let expired = table.expire_overdue();
                    if expired > 0 {
                        tracing::debug!("expired {} pending operation(s)", expired);
                    }
                }
                None => break,
            }
        }
    })
}
