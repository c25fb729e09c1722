//! Client core orchestrator
//!
//! Ties the pieces together: a submitted operation is routed through the
//! topology manager, dispatched over a pooled node connection, and on
//! failure fed to the retry engine for another go. Every retry is a brand
//! new correlation on whatever connection routing picks next; opaque ids are
//! never reused across attempts.

use crate::dispatch::{CancelFlag, CompletionHandle, NodeConnection};
use crate::operation::{Operation, Outcome};
use crate::protocol::{ChannelContext, Status};
use crate::retry::{BestEffortRetryPolicy, RetryDecision, RetryPolicy, RetryReason};
use crate::topology::{discover, ClusterTopology, InstallOutcome, RouteTarget, TopologyManager};
use crate::{CancellationReason, CoreConfig, Error, Result, StaleShardPolicy};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// The engine behind a bucket-bound client.
pub struct ClientCore {
    config: CoreConfig,
    topology: Arc<TopologyManager>,
    connections: Mutex<HashMap<String, Arc<NodeConnection>>>,
    retry_policy: Arc<dyn RetryPolicy>,
    refresh_inflight: AtomicBool,
}

impl ClientCore {
    pub fn new(config: CoreConfig) -> Result<Arc<ClientCore>> {
        let policy = Arc::new(BestEffortRetryPolicy::new(
            config.retry_base_delay,
            config.retry_max_delay,
        ));
        Self::with_retry_policy(config, policy)
    }

    pub fn with_retry_policy(
        config: CoreConfig,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Result<Arc<ClientCore>> {
        config.validate()?;
        Ok(Arc::new(ClientCore {
            config,
            topology: Arc::new(TopologyManager::new()),
            connections: Mutex::new(HashMap::new()),
            retry_policy,
            refresh_inflight: AtomicBool::new(false),
        }))
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Discover the initial topology from the configured seeds.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        let topo = discover(&self.config, 0).await?;
        self.apply_topology(topo).await;
        tracing::info!(
            "bootstrapped bucket '{}' at rev {}",
            self.config.bucket,
            self.topology.current_rev()
        );
        Ok(())
    }

    /// Offer a topology snapshot. On acceptance, connections to nodes that
    /// vanished are torn down and their pending operations cancelled with
    /// `TargetNodeRemoved` so callers do not sit out a full timeout.
    pub async fn apply_topology(&self, topo: ClusterTopology) -> InstallOutcome {
        let outcome = self.topology.install(topo);
        if let InstallOutcome::Installed { removed_nodes } = &outcome {
            if !removed_nodes.is_empty() {
                let mut pool = self.connections.lock().await;
                for addr in removed_nodes {
                    if let Some(conn) = pool.remove(addr) {
                        tracing::info!("node {} left the topology, cancelling pending", addr);
                        conn.cancel_all(CancellationReason::TargetNodeRemoved);
                        conn.shutdown();
                    }
                }
            }
        }
        outcome
    }

    /// Submit an operation. The returned handle resolves to the outcome or
    /// a typed failure; `handle.cancel()` stops result delivery.
    pub fn submit(self: &Arc<Self>, op: Operation) -> CompletionHandle {
        let (handle, tx, flag) = CompletionHandle::new();
        let core = self.clone();
        tokio::spawn(async move {
            let result = core.orchestrate(op, flag).await;
            let _ = tx.send(result);
        });
        handle
    }

    async fn orchestrate(
        self: Arc<Self>,
        mut op: Operation,
        flag: Arc<CancelFlag>,
    ) -> Result<Outcome> {
        // local routing query, answered without wire I/O
        if let Operation::GetShardId { ctx } = &op {
            if let Some(reason) = flag.requested() {
                return Err(Error::Cancelled(reason));
            }
            let target = self.topology.route(&ctx.key)?;
            return Ok(Outcome {
                status: Status::Success,
                cas: 0,
                value: Bytes::copy_from_slice(&target.shard.to_be_bytes()),
                extras: Bytes::new(),
                datatype: 0,
                mutation_token: None,
            });
        }

        let started = Instant::now();
        let budget = op.context().timeout;
        let policy = op
            .context()
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.retry_policy.clone());

        let mut attempt: u32 = 0;
        let mut last_err: Option<Error> = None;

        loop {
            if let Some(reason) = flag.requested() {
                return Err(Error::Cancelled(reason));
            }
            let elapsed = started.elapsed();
            if elapsed >= budget {
                // the last attempt's failure is what the caller sees
                return Err(last_err.unwrap_or(Error::Timeout(budget)));
            }
            op.context_mut().timeout = budget - elapsed;

            let error = match self.attempt_once(&op, &flag).await {
                Ok(outcome) => return Ok(outcome),
                Err(e @ Error::Cancelled(_)) => return Err(e),
                Err(e) => e,
            };

            let reason = match error.retry_reason() {
                Some(reason) => reason,
                // CasConflict, key-value outcomes, decode failures: terminal
                None => return Err(error),
            };

            if reason == RetryReason::StaleShardOwnership {
                let stale_rev = self.topology.current_rev();
                self.request_topology_refresh();
                if self.config.stale_shard_policy == StaleShardPolicy::AwaitRefresh {
                    // bounded wait; if nothing fresher shows up we go again
                    // against the last known owner
                    let wait = budget.saturating_sub(started.elapsed());
                    self.topology.await_fresher(stale_rev, wait).await;
                }
            }

            match policy.should_retry(&op, reason, attempt, started.elapsed()) {
                RetryDecision::Propagate => return Err(error),
                RetryDecision::RetryNow => {}
                RetryDecision::RetryAfter(delay) => {
                    let delay = delay.min(budget.saturating_sub(started.elapsed()));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        reason = flag.cancelled() => return Err(Error::Cancelled(reason)),
                    }
                }
            }

            tracing::debug!(
                "retrying after {} (attempt {})",
                reason,
                attempt + 1
            );
            last_err = Some(error);
            attempt += 1;
        }
    }

    /// One dispatch against the node the current snapshot routes to.
    async fn attempt_once(&self, op: &Operation, flag: &Arc<CancelFlag>) -> Result<Outcome> {
        let target = self.route(op)?;
        // the dial shares the attempt's remaining budget
        let conn = self
            .ensure_connection(&target.node_addr, op.context().timeout)
            .await?;

        let handle = conn.dispatch(op, target.shard)?;
        let canceller = handle.canceller();
        tokio::select! {
            result = handle.wait() => result,
            reason = flag.cancelled() => {
                canceller.cancel(reason);
                Err(Error::Cancelled(reason))
            }
        }
    }

    fn route(&self, op: &Operation) -> Result<RouteTarget> {
        if op.is_keyed() {
            self.topology.route(&op.context().key)
        } else {
            self.topology.any_node()
        }
    }

    async fn ensure_connection(
        &self,
        addr: &str,
        connect_timeout: Duration,
    ) -> Result<Arc<NodeConnection>> {
        let mut pool = self.connections.lock().await;
        if let Some(conn) = pool.get(addr) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            pool.remove(addr);
        }
        let conn = NodeConnection::connect(
            addr,
            ChannelContext::from_config(&self.config),
            self.config.timeout_sweep_interval,
            self.config.max_request_size,
            connect_timeout,
        )
        .await?;
        pool.insert(addr.to_string(), conn.clone());
        Ok(conn)
    }

    /// Kick off an asynchronous topology refresh. Concurrent requests
    /// collapse into the one already in flight; the retry loop never blocks
    /// on this beyond what the stale-shard policy asks for.
    fn request_topology_refresh(self: &Arc<Self>) {
        if self.refresh_inflight.swap(true, Ordering::AcqRel) {
            return;
        }
        let core = self.clone();
        tokio::spawn(async move {
            let min_rev = core.topology.current_rev();
            match discover(&core.config, min_rev).await {
                Ok(topo) => {
                    core.apply_topology(topo).await;
                }
                Err(e) => tracing::warn!("topology refresh failed: {}", e),
            }
            core.refresh_inflight.store(false, Ordering::Release);
        });
    }

    /// Tear down every pooled connection.
    pub async fn shutdown(&self) {
        let mut pool = self.connections.lock().await;
        for (addr, conn) in pool.drain() {
            tracing::debug!("closing connection to {}", addr);
            conn.shutdown();
        }
    }
}
