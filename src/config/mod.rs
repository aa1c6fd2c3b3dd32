// Node configuration module
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::cluster::{ClusterName, DiscoveryNode, NodeRole};
use crate::logging::LoggingConfig;

pub mod manager;

pub const DEFAULT_PORT: u16 = 9300;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeSettings,
    pub discovery: DiscoverySettings,
    pub logging: LoggingConfig,
}

/// Identity and addresses of the local node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub node_name: String,
    pub cluster_name: String,
    pub listen_address: SocketAddr,
    /// Address advertised to peers when it differs from the bound one
    pub publish_address: Option<SocketAddr>,
    pub roles: BTreeSet<NodeRole>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        let mut roles = BTreeSet::new();
        roles.insert(NodeRole::MasterEligible);
        roles.insert(NodeRole::Data);
        Self {
            node_name: "seed-ping-node".to_string(),
            cluster_name: "seed-ping".to_string(),
            listen_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            publish_address: None,
            roles,
        }
    }
}

impl NodeSettings {
    pub fn cluster_name(&self) -> ClusterName {
        ClusterName::new(self.cluster_name.clone())
    }

    /// Describe the local node once the transport knows its bound address
    pub fn local_node(&self, bound_address: SocketAddr) -> DiscoveryNode {
        DiscoveryNode::with_random_id(
            self.node_name.clone(),
            self.publish_address.unwrap_or(bound_address),
            self.roles.clone(),
        )
    }
}

/// Seed resolution and round timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub seed_hosts: Vec<String>,
    /// Port applied to seed hosts that do not name one
    pub default_port: u16,
    pub max_concurrent_resolvers: usize,
    pub resolve_timeout: Duration,
    /// Length of one pinging round
    pub ping_timeout: Duration,
    /// Pause between rounds when running as a node
    pub ping_interval: Duration,
    /// Probes allowed to wait for a worker before submissions are rejected
    pub max_pending_probes: usize,
    /// Rounds with an unchanged peer set before the gossip cache is cleared
    pub clear_gossip_after: u32,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            seed_hosts: vec!["127.0.0.1".to_string()],
            default_port: DEFAULT_PORT,
            max_concurrent_resolvers: 10,
            resolve_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(3),
            ping_interval: Duration::from_secs(10),
            max_pending_probes: 1000,
            clear_gossip_after: 3,
        }
    }
}

impl DiscoverySettings {
    /// Worker count for resolution and probing, never below one
    pub fn concurrency(&self) -> usize {
        self.max_concurrent_resolvers.max(1)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value [{value}] for environment variable {var}")]
    InvalidEnv { var: String, value: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}
