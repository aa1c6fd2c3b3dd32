// A discovery node over TCP, as run by the binary
use std::collections::BTreeSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterSnapshot, DiscoveryNode, SharedClusterState};
use crate::config::AppConfig;
use crate::discovery::{PingCollection, PingError, UnicastPing};
use crate::resolver::{DnsHostsResolver, SettingsSeedHostsProvider};
use crate::scheduler::TokioScheduler;
use crate::transport::tcp::TcpTransport;
use crate::transport::{Transport, TransportError};

/// TCP transport, cluster state and discovery wired together
pub struct SeedPingNode {
    config: AppConfig,
    transport: Arc<TcpTransport>,
    cluster_state: Arc<SharedClusterState>,
    ping: UnicastPing,
}

impl SeedPingNode {
    /// Bind the configured listen address and register the ping handler
    pub async fn start(config: AppConfig) -> Result<Self, TransportError> {
        let node_settings = config.node.clone();
        let transport = Arc::new(
            TcpTransport::bind(node_settings.listen_address, node_settings.publish_address, |address| {
                node_settings.local_node(address)
            })
            .await?,
        );
        let cluster_state = Arc::new(SharedClusterState::new(ClusterSnapshot::initial(
            transport.local_node(),
            config.node.cluster_name(),
        )));

        let discovery = &config.discovery;
        let ping = UnicastPing::new(
            discovery,
            transport.clone(),
            cluster_state.clone(),
            Arc::new(SettingsSeedHostsProvider::new(discovery.seed_hosts.clone())),
            Arc::new(DnsHostsResolver::new(discovery.concurrency(), discovery.default_port)),
            Arc::new(TokioScheduler::current()),
        );
        info!(node = %transport.local_node(), cluster = %config.node.cluster_name, "node started");

        Ok(Self {
            config,
            transport,
            cluster_state,
            ping,
        })
    }

    pub fn local_node(&self) -> DiscoveryNode {
        self.transport.local_node()
    }

    pub fn bound_address(&self) -> SocketAddr {
        self.transport.bound_address()
    }

    pub fn ping(&self) -> &UnicastPing {
        &self.ping
    }

    pub fn cluster_state(&self) -> &Arc<SharedClusterState> {
        &self.cluster_state
    }

    pub fn transport(&self) -> &Arc<TcpTransport> {
        &self.transport
    }

    /// One round lasting the configured ping timeout
    pub async fn discover(&self) -> Result<PingCollection, PingError> {
        self.ping.ping_and_wait(self.config.discovery.ping_timeout).await
    }

    /// Run a round every `ping_interval` until `shutdown` resolves. The
    /// gossip cache is cleared once the peer set has stayed the same for
    /// `clear_gossip_after` rounds in a row.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.discovery.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let clear_after = self.config.discovery.clear_gossip_after;
        let mut last_peers: Option<BTreeSet<String>> = None;
        let mut unchanged = 0u32;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            let collection = match self.discover().await {
                Ok(collection) => collection,
                Err(e) if e.is_expected() => break,
                Err(e) => {
                    warn!(error = %e, "discovery round failed");
                    continue;
                }
            };
            let peers = collection.node_ids();
            info!(peers = peers.len(), "discovery round finished");
            for response in collection.to_list() {
                debug!(
                    node = %response.node,
                    master = ?response.master.as_ref().map(|m| m.id.as_str()),
                    term = response.state.term,
                    version = response.state.version,
                    "discovered peer"
                );
            }

            if last_peers.as_ref() == Some(&peers) {
                unchanged += 1;
            } else {
                unchanged = 0;
                last_peers = Some(peers);
            }
            if clear_after > 0 && unchanged >= clear_after {
                debug!(rounds = unchanged, "peer set converged, clearing gossip cache");
                self.ping.clear_temporal_responses();
                unchanged = 0;
            }
        }
    }

    /// Close discovery, then the transport
    pub async fn stop(&self) {
        self.ping.close().await;
        self.transport.stop().await;
        info!(node = %self.local_node(), "node stopped");
    }
}
