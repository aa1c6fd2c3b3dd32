// Wire schema for the discovery ping action
use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::cluster::{ClusterName, DiscoveryNode, StateToken};
use super::error::PingError;

/// Action name the ping handler is registered under
pub const PING_ACTION: &str = "internal:discovery/ping";

/// What a node says about itself when pinged or pinging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerResponse {
    /// Increases with every response the sending node builds
    pub id: u64,
    pub node: DiscoveryNode,
    pub master: Option<DiscoveryNode>,
    pub cluster_name: ClusterName,
    pub state: StateToken,
}

impl PeerResponse {
    pub fn is_master_eligible(&self) -> bool {
        self.node.is_master_eligible()
    }
}

/// Probe sent to every candidate peer of a round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub round_id: i32,
    pub timeout_ms: i64,
    pub sender: PeerResponse,
}

impl PingRequest {
    pub fn new(round_id: i32, timeout: Duration, sender: PeerResponse) -> Self {
        Self {
            round_id,
            timeout_ms: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
            sender,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(0) as u64)
    }

    pub fn encode(&self) -> Result<Vec<u8>, PingError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PingError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Reply to a probe: the gossip cache plus the replying node itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingReply {
    pub round_id: i32,
    pub responses: Vec<PeerResponse>,
}

impl PingReply {
    pub fn encode(&self) -> Result<Vec<u8>, PingError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PingError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{NodeRole, Version};
    use std::collections::BTreeSet;
    use std::net::SocketAddr;

    #[test]
    fn test_request_survives_the_wire() {
        let mut roles = BTreeSet::new();
        roles.insert(NodeRole::MasterEligible);
        roles.insert(NodeRole::Data);
        let node = DiscoveryNode::new("n1", "alpha", SocketAddr::from(([10, 1, 2, 3], 9300)), roles, Version::CURRENT);
        let sender = PeerResponse {
            id: 12,
            node: node.clone(),
            master: Some(node),
            cluster_name: ClusterName::new("main"),
            state: StateToken::new(3, 41),
        };
        let request = PingRequest::new(7, Duration::from_millis(2500), sender.clone());

        let decoded = PingRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded.round_id, 7);
        assert_eq!(decoded.timeout(), Duration::from_millis(2500));
        assert_eq!(decoded.sender, sender);
        assert_eq!(decoded.sender.node.roles.len(), 2);
    }

    #[test]
    fn test_garbage_is_a_codec_error() {
        assert!(matches!(PingReply::decode(&[0xff, 0x01]), Err(PingError::Codec(_))));
    }

    #[test]
    fn test_negative_timeout_is_zero() {
        let node = DiscoveryNode::placeholder(SocketAddr::from(([127, 0, 0, 1], 1)));
        let mut request = PingRequest::new(
            1,
            Duration::from_secs(1),
            PeerResponse {
                id: 1,
                node,
                master: None,
                cluster_name: ClusterName::new("main"),
                state: StateToken::default(),
            },
        );
        request.timeout_ms = -5;
        assert_eq!(request.timeout(), Duration::ZERO);
    }
}
