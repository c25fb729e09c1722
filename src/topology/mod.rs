//! Topology: snapshots, routing, and discovery

pub mod discovery;
pub mod manager;
pub mod snapshot;

pub use discovery::{discover, Seed};
pub use manager::{InstallOutcome, RouteTarget, TopologyManager};
pub use snapshot::{shard_for_key, BucketType, ClusterTopology, NodeInfo, NodeState, ServicePorts};
