// TCP transport with length-prefixed bincode frames
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Serialize, Deserialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    perform_handshake, Connection, ConnectionProfile, HandshakeHandler, RequestHandler, Transport, TransportError,
    HANDSHAKE_ACTION,
};
use crate::cluster::DiscoveryNode;

/// Largest frame we accept from a peer
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

type Handlers = Arc<DashMap<String, Arc<dyn RequestHandler>>>;
type PendingReplies = DashMap<u64, oneshot::Sender<Result<Vec<u8>, String>>>;

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Request {
        request_id: u64,
        action: String,
        payload: Vec<u8>,
    },
    Response {
        request_id: u64,
        result: Result<Vec<u8>, String>,
    },
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &Frame) -> Result<(), TransportError> {
    let data = bincode::serialize(frame)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", data.len()),
        )));
    }
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Option<Frame>, TransportError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("peer sent a frame of {} bytes", len),
        )));
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some(bincode::deserialize(&data)?))
}

/// State shared between a connection handle and its reader task
struct ConnectionShared {
    address: SocketAddr,
    writer: AsyncMutex<OwnedWriteHalf>,
    pending: PendingReplies,
    handlers: Handlers,
    closed: AtomicBool,
}

impl ConnectionShared {
    async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut writer, frame).await
    }

    fn fail_pending(&self) {
        // dropping the senders wakes every waiter with a closed channel
        self.pending.clear();
    }
}

async fn read_loop(shared: Arc<ConnectionShared>, mut reader: OwnedReadHalf) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                trace!(address = %shared.address, "connection closed by peer");
                break;
            }
            Err(e) => {
                if !shared.closed.load(Ordering::Acquire) {
                    debug!(address = %shared.address, error = %e, "connection read failed");
                }
                break;
            }
        };

        match frame {
            Frame::Response { request_id, result } => {
                if let Some((_, reply)) = shared.pending.remove(&request_id) {
                    let _ = reply.send(result);
                } else {
                    trace!(address = %shared.address, request_id, "dropping reply for unknown request");
                }
            }
            Frame::Request { request_id, action, payload } => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let handler = shared.handlers.get(&action).map(|handler| handler.value().clone());
                    let result = match handler {
                        Some(handler) => handler.handle(payload).await,
                        None => Err(TransportError::UnknownAction(action.clone()).to_string()),
                    };
                    if let Err(e) = shared.send_frame(&Frame::Response { request_id, result }).await {
                        debug!(address = %shared.address, action = %action, error = %e, "failed to send reply");
                    }
                });
            }
        }
    }
    shared.closed.store(true, Ordering::Release);
    shared.fail_pending();
}

/// One TCP connection; both sides may send requests over it
pub struct TcpConnection {
    shared: Arc<ConnectionShared>,
    next_request_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpConnection {
    fn start(stream: TcpStream, handlers: Handlers) -> Result<(Arc<Self>, Arc<ConnectionShared>, OwnedReadHalf), TransportError> {
        let address = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let shared = Arc::new(ConnectionShared {
            address,
            writer: AsyncMutex::new(writer),
            pending: DashMap::new(),
            handlers,
            closed: AtomicBool::new(false),
        });
        let connection = Arc::new(Self {
            shared: shared.clone(),
            next_request_id: AtomicU64::new(1),
            reader: Mutex::new(None),
        });
        Ok((connection, shared, reader))
    }

    fn set_reader(&self, handle: JoinHandle<()>) {
        match self.reader.lock() {
            Ok(mut reader) => *reader = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }

    fn take_reader(&self) -> Option<JoinHandle<()>> {
        match self.reader.lock() {
            Ok(mut reader) => reader.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Wrap an outbound stream and start reading from it
    fn spawn_outbound(stream: TcpStream, handlers: Handlers) -> Result<Arc<Self>, TransportError> {
        let (connection, shared, reader) = Self::start(stream, handlers)?;
        connection.set_reader(tokio::spawn(read_loop(shared, reader)));
        Ok(connection)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn remote_address(&self) -> SocketAddr {
        self.shared.address
    }

    async fn send_request(&self, action: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed(self.shared.address));
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(request_id, tx);

        let frame = Frame::Request {
            request_id,
            action: action.to_string(),
            payload,
        };
        if let Err(e) = self.shared.send_frame(&frame).await {
            self.shared.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(message))) => Err(TransportError::Remote(message)),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed(self.shared.address)),
            Err(_) => {
                self.shared.pending.remove(&request_id);
                Err(TransportError::Timeout {
                    action: action.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reader) = self.take_reader() {
            reader.abort();
        }
        let mut writer = self.shared.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);
        self.shared.fail_pending();
        trace!(address = %self.shared.address, "closed connection");
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// TCP transport: listens for peers and opens connections to them
pub struct TcpTransport {
    local_node: DiscoveryNode,
    bound_address: SocketAddr,
    handlers: Handlers,
    connected: DashMap<String, Arc<TcpConnection>>,
    inbound: Arc<DashMap<u64, Arc<TcpConnection>>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind `listen_address` and start accepting peers.
    ///
    /// `make_local_node` receives the address other nodes should use to reach
    /// us: `publish_address` when set, otherwise the bound address.
    pub async fn bind<F>(
        listen_address: SocketAddr,
        publish_address: Option<SocketAddr>,
        make_local_node: F,
    ) -> Result<Self, TransportError>
    where
        F: FnOnce(SocketAddr) -> DiscoveryNode,
    {
        let listener = TcpListener::bind(listen_address).await?;
        let bound_address = listener.local_addr()?;
        let local_node = make_local_node(publish_address.unwrap_or(bound_address));
        info!(bound = %bound_address, publish = %local_node.address, node = %local_node, "transport listening");

        let handlers: Handlers = Arc::new(DashMap::new());
        handlers.insert(
            HANDSHAKE_ACTION.to_string(),
            Arc::new(HandshakeHandler::new(local_node.clone())),
        );
        let inbound: Arc<DashMap<u64, Arc<TcpConnection>>> = Arc::new(DashMap::new());
        let acceptor = tokio::spawn(accept_loop(listener, handlers.clone(), inbound.clone()));

        Ok(Self {
            local_node,
            bound_address,
            handlers,
            connected: DashMap::new(),
            inbound,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn bound_address(&self) -> SocketAddr {
        self.bound_address
    }

    /// Open and keep a long-lived connection to `node`
    pub async fn connect_to_node(&self, node: &DiscoveryNode, profile: &ConnectionProfile) -> Result<(), TransportError> {
        let stream = connect_stream(node.address, profile.connect_timeout).await?;
        let connection = TcpConnection::spawn_outbound(stream, self.handlers.clone())?;
        let as_dyn: Arc<dyn Connection> = connection.clone();
        if let Err(e) = self.handshake(&as_dyn, profile.handshake_timeout).await {
            connection.close().await;
            return Err(e);
        }
        if let Some(previous) = self.connected.insert(node.id.clone(), connection) {
            previous.close().await;
        }
        Ok(())
    }

    /// Stop accepting and close every connection this transport holds
    pub async fn stop(&self) {
        let acceptor = match self.acceptor.lock() {
            Ok(mut acceptor) => acceptor.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(acceptor) = acceptor {
            acceptor.abort();
        }
        let connected: Vec<_> = self.connected.iter().map(|entry| entry.value().clone()).collect();
        self.connected.clear();
        let inbound: Vec<_> = self.inbound.iter().map(|entry| entry.value().clone()).collect();
        self.inbound.clear();
        for connection in connected.into_iter().chain(inbound) {
            connection.close().await;
        }
        info!(bound = %self.bound_address, "transport stopped");
    }
}

async fn connect_stream(address: SocketAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TransportError::Connect {
            address,
            reason: e.to_string(),
        }),
        Err(_) => Err(TransportError::Connect {
            address,
            reason: format!("connect timed out after {:?}", timeout),
        }),
    }
}

async fn accept_loop(listener: TcpListener, handlers: Handlers, inbound: Arc<DashMap<u64, Arc<TcpConnection>>>) {
    let mut next_id = 0u64;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let (connection, shared, reader) = match TcpConnection::start(stream, handlers.clone()) {
            Ok(started) => started,
            Err(e) => {
                debug!(peer = %peer, error = %e, "dropping inbound connection");
                continue;
            }
        };
        next_id += 1;
        let id = next_id;
        inbound.insert(id, connection.clone());
        trace!(peer = %peer, "accepted connection");

        let inbound = inbound.clone();
        connection.set_reader(tokio::spawn(async move {
            read_loop(shared, reader).await;
            inbound.remove(&id);
        }));
    }
}

#[async_trait]
impl Transport for TcpTransport {
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
        match self.connected.get(&node.id) {
            Some(connection) if !connection.is_closed() => {
                let connection: Arc<dyn Connection> = connection.value().clone();
                Ok(connection)
            }
            _ => Err(TransportError::NodeNotConnected(node.to_string())),
        }
    }

    async fn open_connection(
        &self,
        node: &DiscoveryNode,
        profile: &ConnectionProfile,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let stream = connect_stream(node.address, profile.connect_timeout).await?;
        let connection: Arc<dyn Connection> = TcpConnection::spawn_outbound(stream, self.handlers.clone())?;
        Ok(connection)
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

    fn make_node(name: &'static str) -> impl FnOnce(SocketAddr) -> DiscoveryNode {
        move |address| {
            let mut roles = BTreeSet::new();
            roles.insert(NodeRole::MasterEligible);
            DiscoveryNode::new(name, name, address, roles, Version::CURRENT)
        }
    }

    struct Upper;

    #[async_trait]
    impl RequestHandler for Upper {
        async fn handle(&self, payload: Vec<u8>) -> Result<Vec<u8>, String> {
            if payload.is_empty() {
                return Err("empty payload".to_string());
            }
            Ok(payload.to_ascii_uppercase())
        }
    }

    #[tokio::test]
    async fn test_request_reply_over_tcp() {
        let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpTransport::bind(localhost, None, make_node("server")).await.unwrap();
        server.register_handler("upper", Arc::new(Upper));
        let client = TcpTransport::bind(localhost, None, make_node("client")).await.unwrap();

        let target = server.local_node();
        let connection = client
            .open_connection(&target, &ConnectionProfile::single(Duration::from_secs(2)))
            .await
            .unwrap();
        let remote = client.handshake(&connection, Duration::from_secs(2)).await.unwrap();
        assert_eq!(remote.id, "server");

        let reply = connection
            .send_request("upper", b"ping".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, b"PING".to_vec());

        let remote_error = connection.send_request("upper", vec![], Duration::from_secs(2)).await;
        assert!(matches!(remote_error, Err(TransportError::Remote(_))));

        let unknown = connection.send_request("missing", vec![1], Duration::from_secs(2)).await;
        assert!(matches!(unknown, Err(TransportError::Remote(_))));

        connection.close().await;
        assert!(connection.is_closed());
        server.stop().await;
        client.stop().await;
    }

    #[tokio::test]
    async fn test_long_lived_connection_over_tcp() {
        let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpTransport::bind(localhost, None, make_node("server")).await.unwrap();
        server.register_handler("upper", Arc::new(Upper));
        let client = TcpTransport::bind(localhost, None, make_node("client")).await.unwrap();

        let target = server.local_node();
        assert!(!client.node_connected(&target));
        client
            .connect_to_node(&target, &ConnectionProfile::single(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(client.node_connected(&target));

        let connection = client.get_connection(&target).unwrap();
        let reply = connection
            .send_request("upper", b"live".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, b"LIVE".to_vec());

        client.stop().await;
        assert!(connection.is_closed());
        assert!(!client.node_connected(&target));
        assert!(matches!(client.get_connection(&target), Err(TransportError::NodeNotConnected(_))));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let client = TcpTransport::bind(localhost, None, make_node("client")).await.unwrap();

        // bind then drop to get a port nobody listens on
        let unused = TcpListener::bind(localhost).await.unwrap().local_addr().unwrap();
        let target = DiscoveryNode::placeholder(unused);
        let result = client
            .open_connection(&target, &ConnectionProfile::single(Duration::from_secs(2)))
            .await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        client.stop().await;
    }
}
