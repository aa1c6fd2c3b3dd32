// In-process transport for tests and embedding
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{
    perform_handshake, Connection, ConnectionProfile, HandshakeHandler, RequestHandler, Transport, TransportError,
    HANDSHAKE_ACTION,
};
use crate::cluster::DiscoveryNode;

struct Endpoint {
    handlers: Arc<DashMap<String, Arc<dyn RequestHandler>>>,
}

/// Shared fabric connecting every `LocalTransport` created on it.
///
/// Addresses can be made unreachable or slow to connect to, and the
/// network keeps count of connections that were opened but not closed yet.
pub struct LocalNetwork {
    endpoints: DashMap<SocketAddr, Endpoint>,
    unreachable: DashMap<SocketAddr, ()>,
    connect_delays: DashMap<SocketAddr, Duration>,
    open_connections: AtomicUsize,
    opened_total: AtomicUsize,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            unreachable: DashMap::new(),
            connect_delays: DashMap::new(),
            open_connections: AtomicUsize::new(0),
            opened_total: AtomicUsize::new(0),
        })
    }

    /// Refuse every connection attempt to `address`
    pub fn set_unreachable(&self, address: SocketAddr) {
        self.unreachable.insert(address, ());
    }

    pub fn set_reachable(&self, address: SocketAddr) {
        self.unreachable.remove(&address);
    }

    /// Delay every connection attempt to `address`
    pub fn set_connect_delay(&self, address: SocketAddr, delay: Duration) {
        self.connect_delays.insert(address, delay);
    }

    /// Connections opened on this network and not closed yet
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Acquire)
    }

    pub fn connections_opened(&self) -> usize {
        self.opened_total.load(Ordering::Acquire)
    }

    pub fn addresses(&self) -> HashSet<SocketAddr> {
        self.endpoints.iter().map(|entry| *entry.key()).collect()
    }

    /// Drop the endpoint bound at `address`, as if its node went away
    pub fn unbind(&self, address: &SocketAddr) {
        self.endpoints.remove(address);
    }

    fn handler(&self, address: &SocketAddr, action: &str) -> Result<Arc<dyn RequestHandler>, TransportError> {
        if self.unreachable.contains_key(address) {
            return Err(TransportError::ConnectionClosed(*address));
        }
        let endpoint = self.endpoints.get(address).ok_or(TransportError::ConnectionClosed(*address))?;
        let handler = endpoint
            .handlers
            .get(action)
            .map(|handler| handler.value().clone())
            .ok_or_else(|| TransportError::Remote(format!("no handler for action [{}]", action)))?;
        Ok(handler)
    }

    async fn connect(self: &Arc<Self>, address: SocketAddr) -> Result<LocalConnection, TransportError> {
        if let Some(delay) = self.connect_delays.get(&address).map(|d| *d) {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.contains_key(&address) || !self.endpoints.contains_key(&address) {
            return Err(TransportError::Connect {
                address,
                reason: "connection refused".to_string(),
            });
        }
        self.open_connections.fetch_add(1, Ordering::AcqRel);
        self.opened_total.fetch_add(1, Ordering::AcqRel);
        Ok(LocalConnection {
            address,
            network: self.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Connection over a `LocalNetwork`
pub struct LocalConnection {
    address: SocketAddr,
    network: Arc<LocalNetwork>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for LocalConnection {
    fn remote_address(&self) -> SocketAddr {
        self.address
    }

    async fn send_request(&self, action: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed(self.address));
        }
        let handler = self.network.handler(&self.address, action)?;
        match tokio::time::timeout(timeout, handler.handle(payload)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(message)) => Err(TransportError::Remote(message)),
            Err(_) => Err(TransportError::Timeout {
                action: action.to_string(),
                timeout,
            }),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.network.open_connections.fetch_sub(1, Ordering::AcqRel);
            trace!(address = %self.address, "closed local connection");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Transport bound to one address of a `LocalNetwork`
pub struct LocalTransport {
    local_node: DiscoveryNode,
    network: Arc<LocalNetwork>,
    handlers: Arc<DashMap<String, Arc<dyn RequestHandler>>>,
    connected: DashMap<String, Arc<dyn Connection>>,
}

impl LocalTransport {
    pub fn new(network: Arc<LocalNetwork>, local_node: DiscoveryNode) -> Self {
        let handlers: Arc<DashMap<String, Arc<dyn RequestHandler>>> = Arc::new(DashMap::new());
        handlers.insert(
            HANDSHAKE_ACTION.to_string(),
            Arc::new(HandshakeHandler::new(local_node.clone())),
        );
        network.endpoints.insert(
            local_node.address,
            Endpoint {
                handlers: handlers.clone(),
            },
        );
        Self {
            local_node,
            network,
            handlers,
            connected: DashMap::new(),
        }
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Open and keep a long-lived connection to `node`
    pub async fn connect_to_node(&self, node: &DiscoveryNode) -> Result<(), TransportError> {
        let connection = self.open_connection(node, &ConnectionProfile::default()).await?;
        if let Err(e) = self.handshake(&connection, ConnectionProfile::default().handshake_timeout).await {
            connection.close().await;
            return Err(e);
        }
        if let Some(previous) = self.connected.insert(node.id.clone(), connection) {
            previous.close().await;
        }
        Ok(())
    }

    pub async fn disconnect_from_node(&self, node: &DiscoveryNode) {
        if let Some((_, connection)) = self.connected.remove(&node.id) {
            connection.close().await;
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_node(&self) -> DiscoveryNode {
        self.local_node.clone()
    }

    fn node_connected(&self, node: &DiscoveryNode) -> bool {
        self.connected
            .get(&node.id)
            .map(|connection| !connection.is_closed())
            .unwrap_or(false)
    }

    fn get_connection(&self, node: &DiscoveryNode) -> Result<Arc<dyn Connection>, TransportError> {
        self.connected
            .get(&node.id)
            .filter(|connection| !connection.is_closed())
            .map(|connection| connection.value().clone())
            .ok_or_else(|| TransportError::NodeNotConnected(node.to_string()))
    }

    async fn open_connection(
        &self,
        node: &DiscoveryNode,
        profile: &ConnectionProfile,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let address = node.address;
        match tokio::time::timeout(profile.connect_timeout, self.network.connect(address)).await {
            Ok(Ok(connection)) => Ok(Arc::new(connection)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Connect {
                address,
                reason: format!("connect timed out after {:?}", profile.connect_timeout),
            }),
        }
    }

    async fn handshake(&self, connection: &Arc<dyn Connection>, timeout: Duration) -> Result<DiscoveryNode, TransportError> {
        perform_handshake(connection, self.local_node.version, timeout).await
    }

    fn register_handler(&self, action: &str, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(action.to_string(), handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{NodeRole, Version};
    use std::collections::BTreeSet;

    fn node(id: &str, port: u16) -> DiscoveryNode {
        let mut roles = BTreeSet::new();
        roles.insert(NodeRole::MasterEligible);
        DiscoveryNode::new(id, id, SocketAddr::from(([127, 0, 0, 1], port)), roles, Version::CURRENT)
    }

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, payload: Vec<u8>) -> Result<Vec<u8>, String> {
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn test_open_handshake_and_request() {
        let network = LocalNetwork::new();
        let a = LocalTransport::new(network.clone(), node("a", 1));
        let b = LocalTransport::new(network.clone(), node("b", 2));
        b.register_handler("echo", Arc::new(Echo));

        let connection = a.open_connection(&node("b", 2), &ConnectionProfile::default()).await.unwrap();
        let remote = a.handshake(&connection, Duration::from_secs(1)).await.unwrap();
        assert_eq!(remote.id, "b");

        let reply = connection.send_request("echo", vec![1, 2, 3], Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, vec![1, 2, 3]);
        assert_eq!(network.open_connections(), 1);

        connection.close().await;
        connection.close().await;
        assert_eq!(network.open_connections(), 0);
        assert!(matches!(
            connection.send_request("echo", vec![], Duration::from_secs(1)).await,
            Err(TransportError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_incompatible_handshake_is_rejected() {
        let network = LocalNetwork::new();
        let a = LocalTransport::new(network.clone(), node("a", 1));
        let mut old = node("old", 2);
        old.version = Version::new(Version::CURRENT.major + 1, 0, 0);
        let _old = LocalTransport::new(network.clone(), old.clone());

        let connection = a.open_connection(&old, &ConnectionProfile::default()).await.unwrap();
        let result = a.handshake(&connection, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::Handshake { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_and_slow_addresses() {
        let network = LocalNetwork::new();
        let a = LocalTransport::new(network.clone(), node("a", 1));
        let _b = LocalTransport::new(network.clone(), node("b", 2));

        network.set_unreachable(node("b", 2).address);
        let refused = a.open_connection(&node("b", 2), &ConnectionProfile::default()).await;
        assert!(matches!(refused, Err(TransportError::Connect { .. })));

        network.set_reachable(node("b", 2).address);
        network.set_connect_delay(node("b", 2).address, Duration::from_secs(10));
        let slow = a
            .open_connection(&node("b", 2), &ConnectionProfile::single(Duration::from_secs(1)))
            .await;
        assert!(matches!(slow, Err(TransportError::Connect { .. })));
        assert_eq!(network.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_long_lived_connections() {
        let network = LocalNetwork::new();
        let a = LocalTransport::new(network.clone(), node("a", 1));
        let _b = LocalTransport::new(network.clone(), node("b", 2));

        assert!(!a.node_connected(&node("b", 2)));
        a.connect_to_node(&node("b", 2)).await.unwrap();
        assert!(a.node_connected(&node("b", 2)));
        assert!(a.get_connection(&node("b", 2)).is_ok());

        a.disconnect_from_node(&node("b", 2)).await;
        assert!(matches!(a.get_connection(&node("b", 2)), Err(TransportError::NodeNotConnected(_))));
    }
}
