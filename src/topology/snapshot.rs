//! Cluster topology snapshots
//!
//! A snapshot is parsed once from the config payload and never mutated;
//! publication replaces the whole `Arc`. Within one revision every shard
//! index maps to exactly one node.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Routing hash: CRC32 of the key, upper half, folded into the shard space.
/// Deterministic and stable for a given topology.
pub fn shard_for_key(key: &[u8], num_shards: u16) -> u16 {
    debug_assert!(num_shards > 0);
    (((crc32fast::hash(key) >> 16) & 0x7fff) % u32::from(num_shards)) as u16
}

/// Node health as reported in the config payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Alive,
    Degraded,
    Dead,
}

impl NodeState {
    pub fn is_healthy(self) -> bool {
        !matches!(self, NodeState::Dead)
    }
}

/// Per-service ports of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePorts {
    pub kv: u16,
    pub mgmt: u16,
}

/// One cluster node as seen in a topology snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub hostname: String,
    pub services: ServicePorts,
    #[serde(default)]
    pub state: NodeState,
}

impl NodeInfo {
    /// Address of the key-value service, used as the connection pool key.
    pub fn kv_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.services.kv)
    }

    pub fn mgmt_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.services.mgmt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BucketType {
    /// Keys map to shards, shards map to nodes
    Sharded,
    /// No shard map; keys hash straight onto the node list
    NonSharded,
}

/// Immutable topology snapshot for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    /// Strictly increasing per bucket
    pub rev: u64,
    pub name: String,
    pub bucket_type: BucketType,
    /// Ordered node list; shard map entries index into it
    pub nodes: Vec<NodeInfo>,
    /// shard id → node index
    #[serde(default)]
    pub shard_map: Vec<u16>,
}

impl ClusterTopology {
    /// Parse and validate a config payload.
    pub fn parse(payload: &[u8]) -> Result<ClusterTopology> {
        let topo: ClusterTopology = serde_json::from_slice(payload)
            .map_err(|e| Error::InvalidConfig(format!("config payload: {e}")))?;
        topo.validate()?;
        Ok(topo)
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::InvalidConfig("topology has no nodes".into()));
        }
        match self.bucket_type {
            BucketType::Sharded => {
                if self.shard_map.is_empty() {
                    return Err(Error::InvalidConfig(
                        "sharded bucket without a shard map".into(),
                    ));
                }
                for (shard, node_index) in self.shard_map.iter().enumerate() {
                    if usize::from(*node_index) >= self.nodes.len() {
                        return Err(Error::InvalidConfig(format!(
                            "shard {} maps to node {} of {}",
                            shard,
                            node_index,
                            self.nodes.len()
                        )));
                    }
                }
            }
            BucketType::NonSharded => {}
        }
        Ok(())
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_map.len() as u16
    }

    /// Shard owning `key`. Non-sharded buckets have no shard space.
    pub fn shard_of(&self, key: &[u8]) -> Option<u16> {
        match self.bucket_type {
            BucketType::Sharded => Some(shard_for_key(key, self.shard_count())),
            BucketType::NonSharded => None,
        }
    }

    /// Resolve `key` to its owning node and the shard stamped onto the
    /// request header (0 for non-sharded buckets).
    pub fn route(&self, key: &[u8]) -> Result<(u16, &NodeInfo)> {
        match self.bucket_type {
            BucketType::Sharded => {
                let shard = shard_for_key(key, self.shard_count());
                let node_index = usize::from(self.shard_map[usize::from(shard)]);
                Ok((shard, &self.nodes[node_index]))
            }
            BucketType::NonSharded => {
                let index = crc32fast::hash(key) as usize % self.nodes.len();
                Ok((0, &self.nodes[index]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample(rev: u64) -> ClusterTopology {
        ClusterTopology {
            rev,
            name: "travel".into(),
            bucket_type: BucketType::Sharded,
            nodes: vec![
                NodeInfo {
                    hostname: "10.0.0.1".into(),
                    services: ServicePorts {
                        kv: 11210,
                        mgmt: 8091,
                    },
                    state: NodeState::Alive,
                },
                NodeInfo {
                    hostname: "10.0.0.2".into(),
                    services: ServicePorts {
                        kv: 11210,
                        mgmt: 8091,
                    },
                    state: NodeState::Alive,
                },
            ],
            shard_map: (0..64).map(|i| (i % 2) as u16).collect(),
        }
    }

    #[test]
    fn test_routing_deterministic() {
        let topo = sample(1);
        for key in [&b"airline_10"[..], b"route_5966", b""] {
            let (shard_a, node_a) = topo.route(key).unwrap();
            let (shard_b, node_b) = topo.route(key).unwrap();
            assert_eq!(shard_a, shard_b);
            assert_eq!(node_a, node_b);
        }
    }

    #[test]
    fn test_shard_hash_stable() {
        // pin the formula so it never drifts silently
        let expected = (((crc32fast::hash(b"airline_10") >> 16) & 0x7fff) % 64) as u16;
        assert_eq!(shard_for_key(b"airline_10", 64), expected);
    }

    #[test]
    fn test_parse_valid_payload() {
        let json = serde_json::json!({
            "rev": 7,
            "name": "travel",
            "bucketType": "sharded",
            "nodes": [
                {"hostname": "10.0.0.1", "services": {"kv": 11210, "mgmt": 8091}}
            ],
            "shardMap": [0, 0, 0, 0]
        });
        let topo = ClusterTopology::parse(json.to_string().as_bytes()).unwrap();
        assert_eq!(topo.rev, 7);
        assert_eq!(topo.shard_count(), 4);
        assert_eq!(topo.nodes[0].state, NodeState::Alive);
    }

    #[test]
    fn test_parse_rejects_dangling_shard() {
        let json = serde_json::json!({
            "rev": 1,
            "name": "travel",
            "bucketType": "sharded",
            "nodes": [
                {"hostname": "10.0.0.1", "services": {"kv": 11210, "mgmt": 8091}}
            ],
            "shardMap": [0, 3]
        });
        assert!(ClusterTopology::parse(json.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_non_sharded_routes_off_node_list() {
        let mut topo = sample(1);
        topo.bucket_type = BucketType::NonSharded;
        topo.shard_map.clear();
        let (shard, node) = topo.route(b"some-key").unwrap();
        assert_eq!(shard, 0);
        assert!(topo.nodes.contains(node));
        assert_eq!(topo.shard_of(b"some-key"), None);
    }
}
