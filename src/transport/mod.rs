// Connection abstraction used by discovery
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Serialize, Deserialize};

use crate::cluster::{DiscoveryNode, Version};

pub mod local;
pub mod tcp;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: SocketAddr, reason: String },

    #[error("handshake with {address} failed: {reason}")]
    Handshake { address: SocketAddr, reason: String },

    #[error("node {0} is not connected")]
    NodeNotConnected(String),

    #[error("connection to {0} is closed")]
    ConnectionClosed(SocketAddr),

    #[error("request [{action}] timed out after {timeout:?}")]
    Timeout { action: String, timeout: Duration },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("no handler registered for action [{0}]")]
    UnknownAction(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Timeouts used when opening a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl ConnectionProfile {
    /// Profile where connecting and handshaking share one timeout
    pub fn single(timeout: Duration) -> Self {
        Self {
            connect_timeout: timeout,
            handshake_timeout: timeout,
        }
    }
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self::single(Duration::from_secs(30))
    }
}

/// An open connection to a remote node
#[async_trait]
pub trait Connection: Send + Sync {
    fn remote_address(&self) -> SocketAddr;

    /// Send a request for `action` and wait for the matching reply
    async fn send_request(&self, action: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Close the connection; closing twice is a no-op
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Server side of an action
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request. An `Err` is sent back to the caller as a remote error.
    async fn handle(&self, payload: Vec<u8>) -> Result<Vec<u8>, String>;
}

/// Network layer discovery runs on
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_node(&self) -> DiscoveryNode;

    /// Whether a long-lived connection to `node` is currently established
    fn node_connected(&self, node: &DiscoveryNode) -> bool;

    /// The long-lived connection to `node`, if any
    fn get_connection(&self, node: &DiscoveryNode) -> Result<Arc<dyn Connection>, TransportError>;

    /// Open a fresh connection owned by the caller
    async fn open_connection(
        &self,
        node: &DiscoveryNode,
        profile: &ConnectionProfile,
    ) -> Result<Arc<dyn Connection>, TransportError>;

    /// Exchange versions over `connection`, returning the remote node
    async fn handshake(&self, connection: &Arc<dyn Connection>, timeout: Duration) -> Result<DiscoveryNode, TransportError>;

    fn register_handler(&self, action: &str, handler: Arc<dyn RequestHandler>);
}

/// Action every transport answers to exchange versions
pub const HANDSHAKE_ACTION: &str = "internal:transport/handshake";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandshakeRequest {
    version: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandshakeResponse {
    node: DiscoveryNode,
}

/// Answers handshakes on behalf of the local node
pub(crate) struct HandshakeHandler {
    local_node: DiscoveryNode,
}

impl HandshakeHandler {
    pub(crate) fn new(local_node: DiscoveryNode) -> Self {
        Self { local_node }
    }
}

#[async_trait]
impl RequestHandler for HandshakeHandler {
    async fn handle(&self, payload: Vec<u8>) -> Result<Vec<u8>, String> {
        let request: HandshakeRequest = bincode::deserialize(&payload).map_err(|e| e.to_string())?;
        if !self.local_node.version.is_compatible(&request.version) {
            return Err(format!(
                "incompatible version [{}], local node is on [{}]",
                request.version, self.local_node.version
            ));
        }
        bincode::serialize(&HandshakeResponse { node: self.local_node.clone() }).map_err(|e| e.to_string())
    }
}

/// Client side of the handshake shared by all transports
pub(crate) async fn perform_handshake(
    connection: &Arc<dyn Connection>,
    local_version: Version,
    timeout: Duration,
) -> Result<DiscoveryNode, TransportError> {
    let address = connection.remote_address();
    let payload = bincode::serialize(&HandshakeRequest { version: local_version })?;
    let reply = connection
        .send_request(HANDSHAKE_ACTION, payload, timeout)
        .await
        .map_err(|e| TransportError::Handshake { address, reason: e.to_string() })?;
    let response: HandshakeResponse = bincode::deserialize(&reply)?;
    if !response.node.version.is_compatible(&local_version) {
        return Err(TransportError::Handshake {
            address,
            reason: format!("remote version [{}] is incompatible with [{}]", response.node.version, local_version),
        });
    }
    Ok(response.node)
}
