//! Configuration for the client core
//!
//! All configuration is an explicit immutable value handed to each component
//! at construction time. Nothing in the core reads ambient global state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when a stale-shard-ownership response forces a topology refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleShardPolicy {
    /// Retry immediately against the last known owner while the refresh
    /// happens in the background.
    Optimistic,
    /// Wait for a fresher snapshot (bounded by the operation deadline)
    /// before the next attempt.
    AwaitRefresh,
}

impl Default for StaleShardPolicy {
    fn default() -> Self {
        StaleShardPolicy::Optimistic
    }
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Bucket this core is bound to
    pub bucket: String,

    /// Seed addresses for topology discovery ("host:kv_port")
    pub seeds: Vec<String>,

    /// Default per-operation timeout
    #[serde(default = "default_operation_timeout", with = "duration_ms")]
    pub operation_timeout: Duration,

    /// Timeout for a single discovery attempt against one seed
    #[serde(default = "default_discovery_timeout", with = "duration_ms")]
    pub discovery_timeout: Duration,

    /// Interval of the background sweep that expires pending operations
    #[serde(default = "default_sweep_interval", with = "duration_ms")]
    pub timeout_sweep_interval: Duration,

    /// Behavior on stale shard ownership (see [`StaleShardPolicy`])
    #[serde(default)]
    pub stale_shard_policy: StaleShardPolicy,

    /// Base delay for retry backoff
    #[serde(default = "default_retry_base_delay", with = "duration_ms")]
    pub retry_base_delay: Duration,

    /// Cap for retry backoff
    #[serde(default = "default_retry_max_delay", with = "duration_ms")]
    pub retry_max_delay: Duration,

    /// Maximum request size accepted by the encoder
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,

    /// Negotiate collection-aware key encoding
    #[serde(default = "default_true")]
    pub enable_collections: bool,

    /// Negotiate mutation token extras on mutations
    #[serde(default = "default_true")]
    pub enable_mutation_tokens: bool,

    /// Negotiate sync-replication (durability) framing
    #[serde(default = "default_true")]
    pub enable_sync_replication: bool,
}

fn default_true() -> bool {
    true
}

fn default_operation_timeout() -> Duration {
    Duration::from_millis(2500)
}
fn default_discovery_timeout() -> Duration {
    Duration::from_millis(5000)
}
fn default_sweep_interval() -> Duration {
    Duration::from_millis(50)
}
fn default_retry_base_delay() -> Duration {
    Duration::from_millis(1)
}
fn default_retry_max_delay() -> Duration {
    Duration::from_millis(500)
}
fn default_max_request_size() -> usize {
    20 * 1024 * 1024
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            bucket: "default".to_string(),
            seeds: Vec::new(),
            operation_timeout: default_operation_timeout(),
            discovery_timeout: default_discovery_timeout(),
            timeout_sweep_interval: default_sweep_interval(),
            stale_shard_policy: StaleShardPolicy::default(),
            retry_base_delay: default_retry_base_delay(),
            retry_max_delay: default_retry_max_delay(),
            max_request_size: default_max_request_size(),
            enable_collections: true,
            enable_mutation_tokens: true,
            enable_sync_replication: true,
        }
    }
}

impl CoreConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.bucket.is_empty() {
            return Err(crate::Error::InvalidConfig("bucket cannot be empty".into()));
        }
        if self.operation_timeout.is_zero() {
            return Err(crate::Error::InvalidConfig(
                "operation_timeout must be > 0".into(),
            ));
        }
        if self.timeout_sweep_interval.is_zero() {
            return Err(crate::Error::InvalidConfig(
                "timeout_sweep_interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// (De)serialize durations as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
