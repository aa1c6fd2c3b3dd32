// Unicast gossip ping discovery
//
// A round pings every seed address and every address that recently pinged
// us, three times over the round duration, and hands whatever responses it
// collected to a callback once the duration has elapsed. Inbound pings are
// answered with the gossip cache plus a response describing this node,
// which is how peers learn about each other without being listed as seeds.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cluster::{ClusterSnapshot, ClusterSnapshotProvider, DiscoveryNode};
use crate::config::DiscoverySettings;
use crate::executor::ProbeExecutor;
use crate::resolver::{HostsResolver, SeedHostsProvider, SeedResolution};
use crate::scheduler::Scheduler;
use crate::transport::{Connection, ConnectionProfile, Transport};

pub mod collection;
pub mod error;
pub mod gossip;
mod handler;
pub mod messages;
pub mod round;
pub mod stats;

pub use collection::PingCollection;
pub use error::PingError;
pub use gossip::{GossipCache, GossipCacheEntry};
pub use messages::{PeerResponse, PingReply, PingRequest, PING_ACTION};
pub use round::{ActiveRounds, PingResultsConsumer, PingingRound};
pub use stats::{PingStats, PingStatsSnapshot};

use handler::PingRequestHandler;

/// How much longer than the request duration a single probe may take
const PROBE_TIMEOUT_FACTOR: f64 = 1.25;

/// Gossip entries outlive the sender's request timeout by this factor
const GOSSIP_TTL_FACTOR: u32 = 2;

/// Probe timeout for a round whose requests last `request_duration`
pub fn probe_timeout(request_duration: Duration) -> Duration {
    request_duration.mul_f64(PROBE_TIMEOUT_FACTOR)
}

/// Discovery component. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct UnicastPing {
    shared: Arc<PingShared>,
}

pub(crate) struct PingShared {
    transport: Arc<dyn Transport>,
    cluster_state: Arc<dyn ClusterSnapshotProvider>,
    hosts_provider: Arc<dyn SeedHostsProvider>,
    hosts_resolver: Arc<dyn HostsResolver>,
    scheduler: Arc<dyn Scheduler>,
    executor: ProbeExecutor,
    resolve_timeout: Duration,
    active_rounds: Arc<ActiveRounds>,
    gossip: Arc<GossipCache>,
    round_ids: AtomicI32,
    response_ids: AtomicU64,
    stats: PingStats,
    closed: AtomicBool,
}

impl UnicastPing {
    /// Build the component and register its handler on `transport`.
    /// Must be called from within a tokio runtime.
    pub fn new(
        settings: &DiscoverySettings,
        transport: Arc<dyn Transport>,
        cluster_state: Arc<dyn ClusterSnapshotProvider>,
        hosts_provider: Arc<dyn SeedHostsProvider>,
        hosts_resolver: Arc<dyn HostsResolver>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let shared = Arc::new(PingShared {
            transport: transport.clone(),
            cluster_state,
            hosts_provider,
            hosts_resolver,
            scheduler,
            executor: ProbeExecutor::new("unicast_connect", settings.concurrency(), settings.max_pending_probes),
            resolve_timeout: settings.resolve_timeout,
            active_rounds: Arc::new(ActiveRounds::new()),
            gossip: Arc::new(GossipCache::new()),
            round_ids: AtomicI32::new(0),
            response_ids: AtomicU64::new(0),
            stats: PingStats::new(),
            closed: AtomicBool::new(false),
        });
        transport.register_handler(PING_ACTION, Arc::new(PingRequestHandler::new(Arc::downgrade(&shared))));
        debug!(
            concurrent_connects = settings.concurrency(),
            resolve_timeout = ?settings.resolve_timeout,
            "using unicast gossip ping"
        );
        Self { shared }
    }

    /// Start a round of `duration`; `consumer` receives the collected
    /// responses when it finishes. Returns the round id.
    pub async fn ping(&self, consumer: PingResultsConsumer, duration: Duration) -> Result<i32, PingError> {
        self.ping_with_durations(consumer, duration, duration).await
    }

    /// Like `ping`, with the wave schedule decoupled from the per-request
    /// timeouts. Waves run at 0, 1/3 and 2/3 of `schedule_duration` and the
    /// round finishes at `schedule_duration`.
    pub async fn ping_with_durations(
        &self,
        consumer: PingResultsConsumer,
        schedule_duration: Duration,
        request_duration: Duration,
    ) -> Result<i32, PingError> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let resolution = SeedResolution::new(shared.hosts_resolver.as_ref(), shared.resolve_timeout);
        let mut seeds = shared.hosts_provider.seed_addresses(&resolution).await;
        let snapshot = shared.cluster_state.current();
        seeds.extend(snapshot.master_eligible_nodes().map(|node| node.address));

        let id = shared.round_ids.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let round = Arc::new(PingingRound::new(
            id,
            seeds,
            consumer,
            snapshot.local_node.clone(),
            ConnectionProfile::single(request_duration),
            Arc::downgrade(&shared.active_rounds),
            shared.transport.clone(),
        ));
        shared.active_rounds.insert(round.clone());
        shared.stats.record_round_started();
        debug!(round = id, seeds = ?round.seed_addresses().unwrap_or_default(), "starting pinging round");

        let third = schedule_duration / 3;
        shared.scheduler.execute(shared.wave(round.clone(), request_duration));
        shared.scheduler.schedule(third, shared.wave(round.clone(), request_duration));
        shared.scheduler.schedule(third * 2, shared.wave(round.clone(), request_duration));

        let finisher = shared.clone();
        shared.scheduler.schedule(
            schedule_duration,
            async move {
                finisher.finish_round(&round).await;
            }
            .boxed(),
        );
        Ok(id)
    }

    /// Run a round and wait for its responses
    pub async fn ping_and_wait(&self, duration: Duration) -> Result<PingCollection, PingError> {
        let (tx, rx) = oneshot::channel();
        self.ping(
            Box::new(move |collection| {
                let _ = tx.send(collection);
            }),
            duration,
        )
        .await?;
        rx.await
            .map_err(|_| PingError::AlreadyClosed("pinging round ended without results".to_string()))
    }

    /// Answer an inbound ping. Fails with `AlreadyClosed` once closed and
    /// with `ProtocolMismatch` for a sender from another cluster.
    pub fn handle_ping_request(&self, request: PingRequest) -> Result<PingReply, PingError> {
        self.shared.handle_ping_request(request)
    }

    /// Response describing this node; every call gets a fresh id
    pub fn create_ping_response(&self, snapshot: &ClusterSnapshot) -> PeerResponse {
        self.shared.create_ping_response(snapshot)
    }

    /// Forget every gossip entry
    pub fn clear_temporal_responses(&self) {
        self.shared.gossip.clear();
    }

    /// Stop probing, finish every active round and refuse inbound pings.
    /// Calling it again has no effect.
    pub async fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.executor.shutdown();
        for round in shared.active_rounds.snapshot() {
            if round.close().await {
                shared.stats.record_round_finished();
            }
        }
        shared.gossip.clear();
        info!("unicast ping closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn active_rounds(&self) -> &Arc<ActiveRounds> {
        &self.shared.active_rounds
    }

    pub fn gossip_cache(&self) -> &Arc<GossipCache> {
        &self.shared.gossip
    }

    pub fn stats(&self) -> PingStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn local_node(&self) -> DiscoveryNode {
        self.shared.cluster_state.current().local_node.clone()
    }
}

impl PingShared {
    fn ensure_open(&self) -> Result<(), PingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PingError::AlreadyClosed("node is shutting down".to_string()));
        }
        Ok(())
    }

    fn wave(self: &Arc<Self>, round: Arc<PingingRound>, request_duration: Duration) -> BoxFuture<'static, ()> {
        let shared = self.clone();
        async move {
            match shared.send_pings(request_duration, &round) {
                Ok(()) => {}
                Err(e @ PingError::AlreadyClosed(_)) => trace!(round = round.id(), error = %e, "skipping wave"),
                Err(e) => warn!(round = round.id(), error = %e, "unexpected error while pinging"),
            }
        }
        .boxed()
    }

    async fn finish_round(&self, round: &PingingRound) {
        let peers = round.collected_len();
        if round.close().await {
            self.stats.record_round_finished();
            debug!(round = round.id(), peers, "finished pinging round");
        }
    }

    /// Submit one probe per candidate address: seeds first, then addresses
    /// learned from gossip, each address once
    fn send_pings(self: &Arc<Self>, request_duration: Duration, round: &Arc<PingingRound>) -> Result<(), PingError> {
        let seeds = round.seed_addresses()?;
        let snapshot = self.cluster_state.current();
        let request = PingRequest::new(round.id(), request_duration, self.create_ping_response(&snapshot));
        let payload: Arc<[u8]> = request.encode()?.into();

        let mut seen = HashSet::new();
        let nodes: Vec<DiscoveryNode> = seeds
            .iter()
            .copied()
            .chain(self.gossip.addresses())
            .filter(|address| seen.insert(*address))
            .map(|address| match snapshot.find_by_address(&address) {
                Some(node) if self.transport.node_connected(node) => node.clone(),
                _ => DiscoveryNode::placeholder(address),
            })
            .collect();

        trace!(round = round.id(), nodes = nodes.len(), "sending pings");
        for node in nodes {
            self.send_ping_to_node(node, request_duration, round.clone(), payload.clone());
        }
        Ok(())
    }

    fn send_ping_to_node(
        self: &Arc<Self>,
        node: DiscoveryNode,
        request_duration: Duration,
        round: Arc<PingingRound>,
        payload: Arc<[u8]>,
    ) {
        let round_id = round.id();
        let address = node.address;
        let shared = self.clone();
        let submitted = self.executor.submit(async move {
            match shared.ping_node(&node, request_duration, &round, &payload).await {
                Ok(()) => {}
                Err(e) => {
                    shared.stats.record_probe_failed();
                    shared.log_probe_failure(round_id, &node, &e);
                }
            }
        });
        if let Err(rejected) = submitted {
            self.stats.record_probe_rejected();
            debug!(round = round_id, node = %address, error = %rejected, "ping execution rejected");
        }
    }

    async fn ping_node(
        &self,
        node: &DiscoveryNode,
        request_duration: Duration,
        round: &PingingRound,
        payload: &[u8],
    ) -> Result<(), PingError> {
        let connection = match self.live_connection(node) {
            Some(connection) => connection,
            None => round.get_or_connect(node).await?,
        };

        trace!(round = round.id(), node = %node, "sending ping");
        let started = Instant::now();
        let bytes = connection
            .send_request(PING_ACTION, payload.to_vec(), probe_timeout(request_duration))
            .await?;
        let reply = PingReply::decode(&bytes)?;
        self.stats.record_probe_reply(started.elapsed());

        if round.is_closed() {
            trace!(round = round.id(), node = %node, "ping response received after round closed, ignoring");
            return Ok(());
        }
        trace!(round = round.id(), node = %node, responses = reply.responses.len(), "received ping response");
        for response in reply.responses {
            round.add_response(response);
        }
        Ok(())
    }

    fn live_connection(&self, node: &DiscoveryNode) -> Option<Arc<dyn Connection>> {
        if !self.transport.node_connected(node) {
            return None;
        }
        match self.transport.get_connection(node) {
            Ok(connection) => Some(connection),
            Err(e) => {
                trace!(node = %node, error = %e, "node disconnected, using a temporary connection");
                None
            }
        }
    }

    fn log_probe_failure(&self, round_id: i32, node: &DiscoveryNode, error: &PingError) {
        match error {
            PingError::AlreadyClosed(_) | PingError::ConnectFailure { .. } => {
                trace!(round = round_id, node = %node, error = %error, "failed to ping");
            }
            PingError::RemoteError(_) => {
                debug!(round = round_id, node = %node, error = %error, "received a remote error as a response to ping");
            }
            _ if self.closed.load(Ordering::Acquire) => {
                trace!(round = round_id, node = %node, error = %error, "failed to ping while closing");
            }
            _ => warn!(round = round_id, node = %node, error = %error, "failed to send ping"),
        }
    }

    fn handle_ping_request(&self, request: PingRequest) -> Result<PingReply, PingError> {
        if let Err(e) = self.ensure_open() {
            self.stats.record_inbound(false);
            return Err(e);
        }
        let snapshot = self.cluster_state.current();
        if request.sender.cluster_name != snapshot.cluster_name {
            self.stats.record_inbound(false);
            return Err(PingError::ProtocolMismatch {
                request: request.sender.cluster_name,
                local: snapshot.cluster_name.clone(),
            });
        }
        self.stats.record_inbound(true);

        let ttl = request.timeout() * GOSSIP_TTL_FACTOR;
        self.gossip.add(request.sender.clone(), ttl, self.scheduler.as_ref());
        for round in self.active_rounds.snapshot() {
            round.add_response(request.sender.clone());
        }

        let mut responses = self.gossip.snapshot();
        responses.push(self.create_ping_response(&snapshot));
        Ok(PingReply {
            round_id: request.round_id,
            responses,
        })
    }

    fn create_ping_response(&self, snapshot: &ClusterSnapshot) -> PeerResponse {
        PeerResponse {
            id: self.response_ids.fetch_add(1, Ordering::AcqRel) + 1,
            node: snapshot.local_node.clone(),
            master: snapshot.master_node.clone(),
            cluster_name: snapshot.cluster_name.clone(),
            state: snapshot.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterName, NodeRole, SharedClusterState, StateToken, Version};
    use crate::resolver::{DnsHostsResolver, FixedSeedAddresses};
    use crate::scheduler::TokioScheduler;
    use crate::transport::local::{LocalNetwork, LocalTransport};
    use std::collections::BTreeSet;
    use std::net::SocketAddr;

    fn node(id: &str, port: u16) -> DiscoveryNode {
        let mut roles = BTreeSet::new();
        roles.insert(NodeRole::MasterEligible);
        DiscoveryNode::new(id, id, SocketAddr::from(([127, 0, 0, 1], port)), roles, Version::CURRENT)
    }

    fn unicast_ping(network: &Arc<LocalNetwork>, local: DiscoveryNode) -> UnicastPing {
        let transport = Arc::new(LocalTransport::new(network.clone(), local.clone()));
        let state = Arc::new(SharedClusterState::new(ClusterSnapshot::initial(local, ClusterName::new("main"))));
        UnicastPing::new(
            &DiscoverySettings::default(),
            transport,
            state,
            Arc::new(FixedSeedAddresses::default()),
            Arc::new(DnsHostsResolver::new(1, 9300)),
            Arc::new(TokioScheduler::current()),
        )
    }

    fn sender(from: DiscoveryNode, cluster: &str) -> PeerResponse {
        PeerResponse {
            id: 1,
            node: from,
            master: None,
            cluster_name: ClusterName::new(cluster),
            state: StateToken::default(),
        }
    }

    #[test]
    fn test_probe_timeout_is_a_quarter_longer() {
        assert_eq!(probe_timeout(Duration::from_secs(4)), Duration::from_secs(5));
        assert_eq!(probe_timeout(Duration::from_millis(800)), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_reply_carries_gossip_and_local_response() {
        let network = LocalNetwork::new();
        let ping = unicast_ping(&network, node("local", 1));

        let request = PingRequest::new(4, Duration::from_secs(1), sender(node("remote", 2), "main"));
        let reply = ping.handle_ping_request(request).unwrap();

        assert_eq!(reply.round_id, 4);
        let ids: Vec<&str> = reply.responses.iter().map(|r| r.node.id.as_str()).collect();
        assert_eq!(ids, vec!["remote", "local"]);
        assert_eq!(ping.gossip_cache().len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_cluster_is_rejected() {
        let network = LocalNetwork::new();
        let ping = unicast_ping(&network, node("local", 1));

        let request = PingRequest::new(1, Duration::from_secs(1), sender(node("remote", 2), "other"));
        let result = ping.handle_ping_request(request);

        match result {
            Err(e @ PingError::ProtocolMismatch { .. }) => {
                assert_eq!(e.to_string(), "mismatched cluster names; request: [other], local: [main]");
            }
            other => panic!("expected a protocol mismatch, got {:?}", other.map(|r| r.round_id)),
        }
        assert!(ping.gossip_cache().is_empty());
        assert_eq!(ping.stats().inbound_rejected, 1);
    }

    #[tokio::test]
    async fn test_response_ids_increase() {
        let network = LocalNetwork::new();
        let ping = unicast_ping(&network, node("local", 1));
        let snapshot = ClusterSnapshot::initial(node("local", 1), ClusterName::new("main"));

        let first = ping.create_ping_response(&snapshot);
        let second = ping.create_ping_response(&snapshot);
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_closed_node_refuses_pings_and_rounds() {
        let network = LocalNetwork::new();
        let ping = unicast_ping(&network, node("local", 1));
        ping.close().await;
        ping.close().await;

        let request = PingRequest::new(1, Duration::from_secs(1), sender(node("remote", 2), "main"));
        assert!(matches!(ping.handle_ping_request(request), Err(PingError::AlreadyClosed(_))));
        assert!(matches!(
            ping.ping(Box::new(|_| {}), Duration::from_secs(1)).await,
            Err(PingError::AlreadyClosed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_finishes_active_rounds() {
        let network = LocalNetwork::new();
        let ping = unicast_ping(&network, node("local", 1));
        let (tx, rx) = oneshot::channel();
        ping.ping(
            Box::new(move |collection| {
                let _ = tx.send(collection.size());
            }),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        assert_eq!(ping.active_rounds().len(), 1);

        ping.close().await;
        assert_eq!(rx.await.unwrap(), 0);
        assert!(ping.active_rounds().is_empty());
        assert_eq!(ping.stats().rounds_finished, 1);
    }
}
