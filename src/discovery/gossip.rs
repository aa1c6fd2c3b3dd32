// Short-lived cache of peers that recently pinged us
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::trace;

use super::messages::PeerResponse;
use crate::scheduler::Scheduler;

/// A cached response and when it stops being shared
#[derive(Debug, Clone)]
pub struct GossipCacheEntry {
    pub response: PeerResponse,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl GossipCacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.inserted_at + self.ttl
    }
}

/// One-hop epidemic buffer. Every inbound ping leaves the sender's response
/// here for a while; the contents are handed back to whoever pings us next
/// and added to the node set of our own waves.
///
/// Entries leave only when their TTL runs out or on `clear()`.
#[derive(Debug, Default)]
pub struct GossipCache {
    entries: DashMap<u64, GossipCacheEntry>,
    next_key: AtomicU64,
}

impl GossipCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert without scheduling removal; returns the entry key
    pub fn insert(&self, response: PeerResponse, ttl: Duration) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key,
            GossipCacheEntry {
                response,
                inserted_at: Instant::now(),
                ttl,
            },
        );
        key
    }

    /// Insert and have `scheduler` drop the entry once `ttl` has passed
    pub fn add(self: &Arc<Self>, response: PeerResponse, ttl: Duration, scheduler: &dyn Scheduler) {
        let node = response.node.id.clone();
        let key = self.insert(response, ttl);
        let cache = Arc::downgrade(self);
        scheduler.schedule(
            ttl,
            async move {
                if let Some(cache) = cache.upgrade() {
                    if cache.remove(key) {
                        trace!(node = %node, "gossip entry expired");
                    }
                }
            }
            .boxed(),
        );
    }

    pub fn remove(&self, key: u64) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// Live responses in insertion order
    pub fn snapshot(&self) -> Vec<PeerResponse> {
        let now = Instant::now();
        let mut live: Vec<(u64, PeerResponse)> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| (*entry.key(), entry.value().response.clone()))
            .collect();
        live.sort_by_key(|(key, _)| *key);
        live.into_iter().map(|(_, response)| response).collect()
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.snapshot().into_iter().map(|response| response.node.address).collect()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterName, DiscoveryNode, StateToken};
    use crate::scheduler::TokioScheduler;

    fn response(port: u16) -> PeerResponse {
        PeerResponse {
            id: port as u64,
            node: DiscoveryNode::placeholder(SocketAddr::from(([127, 0, 0, 1], port))),
            master: None,
            cluster_name: ClusterName::new("main"),
            state: StateToken::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = Arc::new(GossipCache::new());
        let scheduler = TokioScheduler::current();

        cache.add(response(1), Duration::from_secs(2), &scheduler);
        tokio::time::sleep(Duration::from_secs(1)).await;
        cache.add(response(2), Duration::from_secs(2), &scheduler);
        assert_eq!(cache.len(), 2);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        tokio::task::yield_now().await;
        assert_eq!(cache.addresses(), vec![SocketAddr::from(([127, 0, 0, 1], 2))]);
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(cache.is_empty());
        assert!(cache.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_empties_immediately() {
        let cache = Arc::new(GossipCache::new());
        let scheduler = TokioScheduler::current();
        cache.add(response(1), Duration::from_secs(60), &scheduler);
        cache.add(response(2), Duration::from_secs(60), &scheduler);

        cache.clear();
        assert!(cache.is_empty());

        // the pending expiry of a cleared entry does nothing
        cache.add(response(3), Duration::from_secs(120), &scheduler);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_keeps_insertion_order() {
        let cache = GossipCache::new();
        for port in [5, 3, 9] {
            cache.insert(response(port), Duration::from_secs(30));
        }
        let ports: Vec<u16> = cache.addresses().iter().map(|a| a.port()).collect();
        assert_eq!(ports, vec![5, 3, 9]);
    }
}
