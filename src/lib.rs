//! # reefkv
//!
//! The low-level client engine for the Reef distributed key-value store:
//! - Binary wire protocol codec (fixed header + extras/key/value segments,
//!   feature-negotiated flexible framing)
//! - Opaque-id correlation, timeouts, and safe cancellation
//! - Idempotence-aware retries with capped exponential backoff
//! - Copy-on-write topology snapshots driving shard routing
//!
//! ## Architecture
//!
//! ```text
//! caller ──submit(op)──► ClientCore ──route──► TopologyManager
//!                            │                     (COW snapshot)
//!                            ▼
//!                      NodeConnection ◄── retry engine re-enters
//!                      ┌───────────┐        routing on failure
//!                      │ codec     │
//!                      │ correl.   │──► many in-flight ops multiplexed
//!                      │ table     │    over one connection per node
//!                      └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use reefkv::{ClientCore, CoreConfig, Operation, OperationContext};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! # async fn run() -> reefkv::Result<()> {
//! let config = CoreConfig {
//!     bucket: "travel".into(),
//!     seeds: vec!["10.0.0.1:11210".into()],
//!     ..Default::default()
//! };
//! let core = ClientCore::new(config)?;
//! core.bootstrap().await?;
//!
//! let op = Operation::Get {
//!     ctx: OperationContext::new(Bytes::from_static(b"airline_10"), Duration::from_secs(2)),
//! };
//! let outcome = core.submit(op).await?;
//! println!("cas={} value={:?}", outcome.cas, outcome.value);
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod core;
pub mod dispatch;
pub mod durability;
pub mod operation;
pub mod protocol;
pub mod retry;
pub mod topology;

// Re-export commonly used types
pub use common::{CancellationReason, CoreConfig, Error, Result, StaleShardPolicy};
pub use crate::core::ClientCore;
pub use dispatch::CompletionHandle;
pub use durability::{DurabilityLevel, DurabilityRequirement, MutationToken};
pub use operation::{Operation, OperationContext, Outcome};
pub use retry::{BestEffortRetryPolicy, FailFastRetryPolicy, RetryDecision, RetryPolicy};
pub use topology::{ClusterTopology, TopologyManager};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
