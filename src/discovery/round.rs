// A single pinging round and the registry of rounds in flight
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use dashmap::DashMap;
use tracing::trace;

use super::collection::PingCollection;
use super::error::PingError;
use super::messages::PeerResponse;
use crate::cluster::DiscoveryNode;
use crate::transport::{Connection, ConnectionProfile, Transport};
use crate::util::KeyedLock;

/// Callback receiving the responses of a round, invoked exactly once
pub type PingResultsConsumer = Box<dyn FnOnce(PingCollection) + Send + 'static>;

/// Rounds that have started and not been closed yet, by round id
#[derive(Default)]
pub struct ActiveRounds {
    rounds: DashMap<i32, Arc<PingingRound>>,
}

impl ActiveRounds {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, round: Arc<PingingRound>) {
        self.rounds.insert(round.id(), round);
    }

    pub(crate) fn remove(&self, id: i32) -> Option<Arc<PingingRound>> {
        self.rounds.remove(&id).map(|(_, round)| round)
    }

    pub fn get(&self, id: i32) -> Option<Arc<PingingRound>> {
        self.rounds.get(&id).map(|round| round.value().clone())
    }

    pub fn contains(&self, id: i32) -> bool {
        self.rounds.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.rounds.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Clone out every round so callers never hold a shard lock while working
    pub fn snapshot(&self) -> Vec<Arc<PingingRound>> {
        self.rounds.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}

/// State of one discovery round.
///
/// A round owns the temporary connections it opens. Once `close` has run,
/// no new connection is published and every one it held has been closed.
pub struct PingingRound {
    id: i32,
    seed_addresses: Vec<SocketAddr>,
    temp_connections: Mutex<HashMap<SocketAddr, Arc<dyn Connection>>>,
    connect_lock: KeyedLock<SocketAddr>,
    collection: PingCollection,
    consumer: Mutex<Option<PingResultsConsumer>>,
    local_node: DiscoveryNode,
    profile: ConnectionProfile,
    closed: AtomicBool,
    registry: Weak<ActiveRounds>,
    transport: Arc<dyn Transport>,
}

impl PingingRound {
    pub(crate) fn new(
        id: i32,
        seed_addresses: impl IntoIterator<Item = SocketAddr>,
        consumer: PingResultsConsumer,
        local_node: DiscoveryNode,
        profile: ConnectionProfile,
        registry: Weak<ActiveRounds>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let mut seen = HashSet::new();
        let seed_addresses = seed_addresses.into_iter().filter(|address| seen.insert(*address)).collect();
        Self {
            id,
            seed_addresses,
            temp_connections: Mutex::new(HashMap::new()),
            connect_lock: KeyedLock::new(),
            collection: PingCollection::new(),
            consumer: Mutex::new(Some(consumer)),
            local_node,
            profile,
            closed: AtomicBool::new(false),
            registry,
            transport,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deduplicated seed addresses, in the order they were resolved
    pub fn seed_addresses(&self) -> Result<&[SocketAddr], PingError> {
        self.ensure_open()?;
        Ok(&self.seed_addresses)
    }

    /// Responses collected so far
    pub fn collected(&self) -> PingCollection {
        self.collection.snapshot()
    }

    pub fn collected_len(&self) -> usize {
        self.collection.size()
    }

    /// Temporary connections currently held by the round
    pub fn temp_connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Record a response unless it is our own or the round is over
    pub fn add_response(&self, response: PeerResponse) -> bool {
        if response.node == self.local_node {
            return false;
        }
        if self.is_closed() {
            trace!(round = self.id, node = %response.node, "discarding response for a finished round");
            return false;
        }
        self.collection.add_ping(response)
    }

    /// Return the round's connection to `node`, opening and handshaking
    /// one if there is none. Concurrent callers for the same address share
    /// a single attempt.
    pub async fn get_or_connect(&self, node: &DiscoveryNode) -> Result<Arc<dyn Connection>, PingError> {
        let _guard = self.connect_lock.acquire(node.address).await;
        let existing = self.connections().get(&node.address).cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }
        self.ensure_open()?;

        trace!(round = self.id, node = %node, "opening temporary connection");
        let connection = self.transport.open_connection(node, &self.profile).await?;
        let published = match self.transport.handshake(&connection, self.profile.handshake_timeout).await {
            Ok(_) => self.publish(node.address, connection.clone()),
            Err(e) => Err(PingError::from(e)),
        };
        if let Err(e) = published {
            trace!(round = self.id, node = %node, error = %e, "closing connection after failure");
            connection.close().await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Finish the round: leave the registry, close every temporary
    /// connection and hand the responses to the consumer. Returns `false`
    /// when the round had already been closed.
    pub async fn close(&self) -> bool {
        let connections: Vec<Arc<dyn Connection>> = {
            let mut temp = self.connections();
            if self
                .closed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(self.id);
            }
            temp.drain().map(|(_, connection)| connection).collect()
        };

        for connection in connections {
            connection.close().await;
        }

        // connections are already released if the consumer panics
        let consumer = self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(consumer) = consumer {
            consumer(self.collection.snapshot());
        }
        trace!(round = self.id, "closed pinging round");
        true
    }

    // the closed check shares the map lock with close() so nothing is
    // published after the connections were drained
    fn publish(&self, address: SocketAddr, connection: Arc<dyn Connection>) -> Result<(), PingError> {
        let mut temp = self.connections();
        self.ensure_open()?;
        let previous = temp.insert(address, connection);
        debug_assert!(previous.is_none(), "temporary connection published twice");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), PingError> {
        if self.is_closed() {
            return Err(PingError::AlreadyClosed(format!("pinging round [{}] is finished", self.id)));
        }
        Ok(())
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<SocketAddr, Arc<dyn Connection>>> {
        self.temp_connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}
