// Node descriptors and protocol versions
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use serde::{Serialize, Deserialize};

/// Wire protocol version advertised by every node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl Version {
    pub const CURRENT: Version = Version { major: 1, minor: 3, revision: 0 };

    pub const fn new(major: u8, minor: u8, revision: u8) -> Self {
        Self { major, minor, revision }
    }

    /// Oldest version this one can still talk to
    pub fn minimum_compatibility(&self) -> Version {
        Version::new(self.major, 0, 0)
    }

    pub fn is_compatible(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// Roles a node can hold in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    MasterEligible,
    Data,
    Ingest,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::MasterEligible => "master_eligible",
            NodeRole::Data => "data",
            NodeRole::Ingest => "ingest",
        };
        f.write_str(name)
    }
}

/// Identity of a node as seen by discovery.
///
/// Equality and hashing go through `id` only: two descriptors for the same
/// node with different roles or versions are the same node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: String,
    pub name: String,
    pub address: SocketAddr,
    pub roles: BTreeSet<NodeRole>,
    pub version: Version,
}

impl DiscoveryNode {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: SocketAddr,
        roles: BTreeSet<NodeRole>,
        version: Version,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address,
            roles,
            version,
        }
    }

    /// Node with a fresh random id, used for the local node
    pub fn with_random_id(name: impl Into<String>, address: SocketAddr, roles: BTreeSet<NodeRole>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), name, address, roles, Version::CURRENT)
    }

    /// Stand-in for an address we have not talked to yet. The id is the
    /// address itself and the version is the oldest one we can handshake with.
    pub fn placeholder(address: SocketAddr) -> Self {
        Self::new(
            address.to_string(),
            address.to_string(),
            address,
            BTreeSet::new(),
            Version::CURRENT.minimum_compatibility(),
        )
    }

    pub fn is_master_eligible(&self) -> bool {
        self.roles.contains(&NodeRole::MasterEligible)
    }
}

impl PartialEq for DiscoveryNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DiscoveryNode {}

impl std::hash::Hash for DiscoveryNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DiscoveryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{{{}}}{{{}}}", self.name, self.id, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_equality_uses_id_only() {
        let addr: SocketAddr = "127.0.0.1:9300".parse().unwrap();
        let a = DiscoveryNode::new("n1", "alpha", addr, BTreeSet::new(), Version::CURRENT);
        let mut roles = BTreeSet::new();
        roles.insert(NodeRole::Data);
        let b = DiscoveryNode::new("n1", "renamed", addr, roles, Version::new(1, 0, 0));
        assert_eq!(a, b);
    }

    #[test]
    fn test_placeholder_uses_minimum_compatible_version() {
        let addr: SocketAddr = "10.0.0.7:9300".parse().unwrap();
        let node = DiscoveryNode::placeholder(addr);
        assert_eq!(node.id, "10.0.0.7:9300");
        assert_eq!(node.version, Version::new(Version::CURRENT.major, 0, 0));
        assert!(node.version.is_compatible(&Version::CURRENT));
        assert!(!node.is_master_eligible());
    }

    #[test]
    fn test_version_compatibility() {
        assert!(Version::new(1, 9, 2).is_compatible(&Version::new(1, 0, 0)));
        assert!(!Version::new(2, 0, 0).is_compatible(&Version::CURRENT));
    }
}
