// Cluster state snapshot consumed by discovery
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use serde::{Serialize, Deserialize};

pub mod node;

pub use node::{DiscoveryNode, NodeRole, Version};

/// Name shared by all nodes of one cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterName(pub String);

impl ClusterName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How far a node's cluster state has progressed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateToken {
    pub term: u64,
    pub version: u64,
}

impl StateToken {
    pub fn new(term: u64, version: u64) -> Self {
        Self { term, version }
    }
}

/// Latest cluster state as known by the local node
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub local_node: DiscoveryNode,
    pub master_node: Option<DiscoveryNode>,
    pub nodes: Vec<DiscoveryNode>,
    pub cluster_name: ClusterName,
    pub state: StateToken,
}

impl ClusterSnapshot {
    /// Snapshot of a node that has not joined anything yet
    pub fn initial(local_node: DiscoveryNode, cluster_name: ClusterName) -> Self {
        Self {
            nodes: vec![local_node.clone()],
            local_node,
            master_node: None,
            cluster_name,
            state: StateToken::default(),
        }
    }

    pub fn master_eligible_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.iter().filter(|node| node.is_master_eligible())
    }

    pub fn find_by_address(&self, address: &SocketAddr) -> Option<&DiscoveryNode> {
        self.nodes.iter().find(|node| node.address == *address)
    }
}

/// Source of the latest cluster snapshot
pub trait ClusterSnapshotProvider: Send + Sync {
    fn current(&self) -> Arc<ClusterSnapshot>;
}

/// Snapshot holder updated by whoever owns cluster formation
pub struct SharedClusterState {
    snapshot: RwLock<Arc<ClusterSnapshot>>,
}

impl SharedClusterState {
    pub fn new(snapshot: ClusterSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn update(&self, snapshot: ClusterSnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

impl ClusterSnapshotProvider for SharedClusterState {
    fn current(&self) -> Arc<ClusterSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn node(id: &str, port: u16, master: bool) -> DiscoveryNode {
        let mut roles = BTreeSet::new();
        if master {
            roles.insert(NodeRole::MasterEligible);
        }
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        DiscoveryNode::new(id, id, addr, roles, Version::CURRENT)
    }

    #[test]
    fn test_master_eligible_and_lookup() {
        let local = node("local", 9300, true);
        let mut snapshot = ClusterSnapshot::initial(local, ClusterName::new("main"));
        snapshot.nodes.push(node("data-1", 9301, false));
        snapshot.nodes.push(node("master-2", 9302, true));

        let masters: Vec<_> = snapshot.master_eligible_nodes().map(|n| n.id.as_str()).collect();
        assert_eq!(masters, vec!["local", "master-2"]);

        let addr = SocketAddr::from(([127, 0, 0, 1], 9301));
        assert_eq!(snapshot.find_by_address(&addr).map(|n| n.id.as_str()), Some("data-1"));
    }

    #[test]
    fn test_shared_state_update() {
        let state = SharedClusterState::new(ClusterSnapshot::initial(node("a", 1, true), ClusterName::new("main")));
        assert_eq!(state.current().state, StateToken::default());

        let mut next = (*state.current()).clone();
        next.state = StateToken::new(2, 17);
        state.update(next);
        assert_eq!(state.current().state, StateToken::new(2, 17));
    }
}
