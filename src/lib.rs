// Unicast gossip ping discovery for clustered nodes
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod executor;
pub mod logging;
pub mod node;
pub mod resolver;
pub mod scheduler;
pub mod transport;
pub mod util;
pub mod cli;

pub use cluster::{ClusterName, ClusterSnapshot, ClusterSnapshotProvider, DiscoveryNode, NodeRole, SharedClusterState, StateToken, Version};
pub use discovery::{PeerResponse, PingCollection, PingError, UnicastPing};
pub use node::SeedPingNode;
