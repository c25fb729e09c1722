//! Topology manager
//!
//! Keeps the authoritative shard-to-node map as a copy-on-write snapshot:
//! readers grab the current `Arc` without locks on the routing path, writers
//! install whole new snapshots. A snapshot with a revision at or below the
//! installed one is discarded silently — that is flow control, not an error.

use super::snapshot::ClusterTopology;
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// What happened to an offered snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Snapshot published; `removed_nodes` lists kv addresses that vanished
    /// and whose pending operations must be cancelled.
    Installed { removed_nodes: Vec<String> },
    /// Revision was not strictly greater than the current one.
    Discarded { current_rev: u64 },
}

/// Routing verdict for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub shard: u16,
    pub node_addr: String,
}

pub struct TopologyManager {
    tx: watch::Sender<Option<Arc<ClusterTopology>>>,
}

impl Default for TopologyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyManager {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Current snapshot, if any topology was ever installed.
    pub fn current(&self) -> Option<Arc<ClusterTopology>> {
        self.tx.borrow().clone()
    }

    pub fn current_rev(&self) -> u64 {
        self.current().map(|t| t.rev).unwrap_or(0)
    }

    /// Watch for snapshot changes (used to await a refresh with a deadline).
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ClusterTopology>>> {
        self.tx.subscribe()
    }

    /// Offer a snapshot. Only a strictly greater revision is published; the
    /// revision check and the swap happen atomically under the watch lock.
    pub fn install(&self, topo: ClusterTopology) -> InstallOutcome {
        let mut outcome = InstallOutcome::Discarded { current_rev: 0 };
        self.tx.send_if_modified(|current| match current {
            Some(existing) if existing.rev >= topo.rev => {
                outcome = InstallOutcome::Discarded {
                    current_rev: existing.rev,
                };
                false
            }
            _ => {
                let removed_nodes = match current {
                    Some(existing) => {
                        let kept: HashSet<String> =
                            topo.nodes.iter().map(|n| n.kv_addr()).collect();
                        existing
                            .nodes
                            .iter()
                            .map(|n| n.kv_addr())
                            .filter(|addr| !kept.contains(addr))
                            .collect()
                    }
                    None => Vec::new(),
                };
                tracing::info!(
                    "installed topology rev {} ({} nodes, {} shards)",
                    topo.rev,
                    topo.nodes.len(),
                    topo.shard_map.len()
                );
                *current = Some(Arc::new(topo));
                outcome = InstallOutcome::Installed { removed_nodes };
                true
            }
        });
        outcome
    }

    /// Resolve a key to its shard and owning node under the current snapshot.
    pub fn route(&self, key: &[u8]) -> Result<RouteTarget> {
        let topo = self
            .current()
            .ok_or_else(|| Error::ConnectionFailed("no topology installed yet".into()))?;
        let (shard, node) = topo.route(key)?;
        Ok(RouteTarget {
            shard,
            node_addr: node.kv_addr(),
        })
    }

    /// Pick a node for operations that are not keyed (config fetches and
    /// similar): the first healthy node in snapshot order.
    pub fn any_node(&self) -> Result<RouteTarget> {
        let topo = self
            .current()
            .ok_or_else(|| Error::ConnectionFailed("no topology installed yet".into()))?;
        let node = topo
            .nodes
            .iter()
            .find(|n| n.state.is_healthy())
            .ok_or_else(|| Error::ConnectionFailed("no healthy nodes".into()))?;
        Ok(RouteTarget {
            shard: 0,
            node_addr: node.kv_addr(),
        })
    }

    /// Wait until a snapshot with revision above `than_rev` is published,
    /// bounded by `max_wait`. Returns whether a fresher snapshot arrived.
    pub async fn await_fresher(&self, than_rev: u64, max_wait: Duration) -> bool {
        let mut rx = self.subscribe();
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if self.current_rev() > than_rev {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return self.current_rev() > than_rev,
            }
        }
    }
}
