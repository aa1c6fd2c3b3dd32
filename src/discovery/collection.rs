// Responses collected by a round, deduplicated by node
use std::collections::BTreeSet;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::messages::PeerResponse;

/// Peer responses keyed by node id. Merging is commutative and idempotent:
/// for each node the response with the highest id wins, whatever order the
/// responses arrive in.
#[derive(Debug, Default)]
pub struct PingCollection {
    pings: DashMap<String, PeerResponse>,
}

impl PingCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a response, returning true if it is now the one kept for its node
    pub fn add_ping(&self, response: PeerResponse) -> bool {
        match self.pings.entry(response.node.id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().id <= response.id {
                    existing.insert(response);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(response);
                true
            }
        }
    }

    pub fn add_pings(&self, responses: impl IntoIterator<Item = PeerResponse>) {
        for response in responses {
            self.add_ping(response);
        }
    }

    /// Collected responses ordered by node id
    pub fn to_list(&self) -> Vec<PeerResponse> {
        let mut list: Vec<PeerResponse> = self.pings.iter().map(|entry| entry.value().clone()).collect();
        list.sort_by(|a, b| a.node.id.cmp(&b.node.id));
        list
    }

    pub fn node_ids(&self) -> BTreeSet<String> {
        self.pings.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.pings.contains_key(node_id)
    }

    pub fn size(&self) -> usize {
        self.pings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pings.is_empty()
    }

    /// Independent copy of the current contents
    pub fn snapshot(&self) -> PingCollection {
        let copy = PingCollection::new();
        copy.add_pings(self.to_list());
        copy
    }
}

impl FromIterator<PeerResponse> for PingCollection {
    fn from_iter<I: IntoIterator<Item = PeerResponse>>(iter: I) -> Self {
        let collection = PingCollection::new();
        collection.add_pings(iter);
        collection
    }
}
