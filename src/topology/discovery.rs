//! Topology discovery
//!
//! Bootstraps (or refreshes) the topology by racing every seed address
//! concurrently. Each attempt tries the in-band carrier fetch over a data
//! connection first and falls back to the administrative HTTP endpoint.
//! The first valid response wins; every other in-flight attempt is
//! explicitly cancelled, so its handle resolves `Cancelled(StoppedListening)`
//! instead of lingering until timeout.
//!
//! Discovery itself never retries a failed seed. Trying the other seeds *is*
//! the retry story here; the retry engine plays no part.

use super::snapshot::ClusterTopology;
use crate::dispatch::{CancelFlag, NodeConnection};
use crate::operation::{Operation, OperationContext};
use crate::protocol::ChannelContext;
use crate::{CancellationReason, CoreConfig, Error, Result};
use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::str::FromStr;
use std::sync::Arc;

/// One seed address: the kv port to dial, plus the administrative port for
/// the HTTP fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub host: String,
    pub kv_port: u16,
    pub mgmt_port: u16,
}

impl Seed {
    pub fn kv_addr(&self) -> String {
        format!("{}:{}", self.host, self.kv_port)
    }

    pub fn mgmt_addr(&self) -> String {
        format!("{}:{}", self.host, self.mgmt_port)
    }
}

impl FromStr for Seed {
    type Err = Error;

    /// Accepts "host:kv_port" or "host:kv_port:mgmt_port".
    fn from_str(s: &str) -> Result<Seed> {
        let mut parts = s.split(':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidConfig(format!("bad seed '{s}'")))?
            .to_string();
        let kv_port = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::InvalidConfig(format!("bad seed '{s}'")))?;
        let mgmt_port = match parts.next() {
            Some(p) => p
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("bad seed '{s}'")))?,
            None => 8091,
        };
        Ok(Seed {
            host,
            kv_port,
            mgmt_port,
        })
    }
}

/// Race every configured seed; return the first topology with a revision
/// strictly above `min_rev`.
pub async fn discover(config: &CoreConfig, min_rev: u64) -> Result<ClusterTopology> {
    let seeds: Vec<Seed> = config
        .seeds
        .iter()
        .map(|s| s.parse())
        .collect::<Result<_>>()?;
    if seeds.is_empty() {
        return Err(Error::InvalidConfig("no seeds configured".into()));
    }

    let mut flags = Vec::with_capacity(seeds.len());
    let mut attempts = FuturesUnordered::new();
    for seed in seeds {
        let flag = CancelFlag::new();
        flags.push(flag.clone());
        let config = config.clone();
        attempts.push(tokio::spawn(async move {
            let addr = seed.kv_addr();
            let result = load_from_seed(&seed, &config, flag).await;
            (addr, result)
        }));
    }

    let mut last_failure: Option<Error> = None;
    while let Some(joined) = attempts.next().await {
        let (addr, result) = match joined {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        match result {
            Ok(topo) if topo.rev > min_rev => {
                tracing::info!("discovery winner {} (rev {})", addr, topo.rev);
                // commit the winner immediately; losers are cancelled and
                // aborted, never waited out
                for flag in &flags {
                    flag.request(CancellationReason::StoppedListening);
                }
                for attempt in attempts.iter() {
                    attempt.abort();
                }
                return Ok(topo);
            }
            Ok(topo) => {
                tracing::debug!(
                    "discovery from {} returned stale rev {} (have {})",
                    addr,
                    topo.rev,
                    min_rev
                );
                last_failure = Some(Error::ConfigLoad {
                    seed: addr,
                    reason: format!("stale revision {}", topo.rev),
                });
            }
            Err(e) => {
                tracing::debug!("discovery from {} failed: {}", addr, e);
                last_failure = Some(e);
            }
        }
    }

    Err(last_failure.unwrap_or_else(|| Error::ConfigLoad {
        seed: "<none>".into(),
        reason: "no seed produced a config".into(),
    }))
}

/// One seed attempt: carrier fetch first, HTTP fallback second.
async fn load_from_seed(
    seed: &Seed,
    config: &CoreConfig,
    cancel: Arc<CancelFlag>,
) -> Result<ClusterTopology> {
    match load_carrier(seed, config, cancel.clone()).await {
        Ok(topo) => Ok(topo),
        Err(e @ Error::Cancelled(_)) => Err(e),
        Err(carrier_err) => {
            if cancel.requested().is_some() {
                return Err(carrier_err);
            }
            tracing::debug!(
                "carrier load from {} failed ({}), trying http",
                seed.kv_addr(),
                carrier_err
            );
            load_http(seed, config, &cancel).await
        }
    }
}

/// In-band config fetch: a GetClusterConfig operation over a fresh data
/// connection.
async fn load_carrier(
    seed: &Seed,
    config: &CoreConfig,
    cancel: Arc<CancelFlag>,
) -> Result<ClusterTopology> {
    let addr = seed.kv_addr();
    let conn = NodeConnection::connect(
        &addr,
        ChannelContext::from_config(config),
        config.timeout_sweep_interval,
        config.max_request_size,
        config.discovery_timeout,
    )
    .await?;

    let op = Operation::GetClusterConfig {
        ctx: OperationContext::new(Bytes::new(), config.discovery_timeout),
    };
    let handle = conn.dispatch(&op, 0)?;

    // propagate a race loss into the in-flight attempt
    let canceller = handle.canceller();
    let watcher_cancel = cancel.clone();
    let watcher = tokio::spawn(async move {
        let reason = watcher_cancel.cancelled().await;
        canceller.cancel(reason);
    });

    let result = handle.wait().await;
    watcher.abort();

    let outcome = result?;
    ClusterTopology::parse(&outcome.value).map_err(|e| Error::ConfigLoad {
        seed: addr,
        reason: e.to_string(),
    })
}

/// Fallback fetch from the node's administrative endpoint. A race loss
/// cancels the fetch mid-flight.
async fn load_http(
    seed: &Seed,
    config: &CoreConfig,
    cancel: &CancelFlag,
) -> Result<ClusterTopology> {
    tokio::select! {
        reason = cancel.cancelled() => Err(Error::Cancelled(reason)),
        result = fetch_http(seed, config) => result,
    }
}

async fn fetch_http(seed: &Seed, config: &CoreConfig) -> Result<ClusterTopology> {
    let url = format!(
        "http://{}/config/buckets/{}",
        seed.mgmt_addr(),
        config.bucket
    );
    let client = reqwest::Client::builder()
        .timeout(config.discovery_timeout)
        .build()
        .map_err(|e| Error::ConfigLoad {
            seed: seed.mgmt_addr(),
            reason: e.to_string(),
        })?;

    let response = client.get(&url).send().await.map_err(|e| Error::ConfigLoad {
        seed: seed.mgmt_addr(),
        reason: e.to_string(),
    })?;
    if !response.status().is_success() {
        return Err(Error::ConfigLoad {
            seed: seed.mgmt_addr(),
            reason: format!("http status {}", response.status()),
        });
    }
    let payload = response.bytes().await.map_err(|e| Error::ConfigLoad {
        seed: seed.mgmt_addr(),
        reason: e.to_string(),
    })?;
    ClusterTopology::parse(&payload).map_err(|e| Error::ConfigLoad {
        seed: seed.mgmt_addr(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_parsing() {
        let seed: Seed = "10.0.0.1:11210".parse().unwrap();
        assert_eq!(seed.kv_addr(), "10.0.0.1:11210");
        assert_eq!(seed.mgmt_addr(), "10.0.0.1:8091");

        let seed: Seed = "db1:11210:9000".parse().unwrap();
        assert_eq!(seed.mgmt_addr(), "db1:9000");

        assert!("".parse::<Seed>().is_err());
        assert!("justahost".parse::<Seed>().is_err());
        assert!(":11210".parse::<Seed>().is_err());
    }
}
