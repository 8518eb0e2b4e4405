//! Remote subscription state: which peers care about which topics.
//!
//! The table is shared between the control-plane actor, every peer pipeline,
//! and the injected propagation strategy, so all access goes through an
//! interior lock. Mutations come from inbound subscription actions (applied
//! in frame arrival order per peer, last writer wins) and from peer
//! disconnects.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::messages::SubscriptionAction;
use crate::peer::PeerId;

/// Maximum peers tracked per topic.
/// SECURITY: Bounds per-topic growth from hostile subscription floods.
pub const MAX_PEERS_PER_TOPIC: usize = 1000;

/// Maximum topics tracked in the table.
/// SECURITY: Prevents memory exhaustion from topic proliferation.
pub const MAX_TRACKED_TOPICS: usize = 10_000;

/// Summary of one processed control frame's subscription actions, raised for
/// observers (typically the propagation strategy) to react to membership
/// changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub peer: PeerId,
    /// The peer's full topic set after applying the frame.
    pub topics: HashSet<String>,
    /// The raw actions the frame carried, in wire order.
    pub actions: Vec<SubscriptionAction>,
}

#[derive(Default)]
pub struct SubscriptionTable {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_topic: HashMap<String, HashSet<PeerId>>,
    by_peer: HashMap<PeerId, HashSet<String>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one subscribe/unsubscribe action. Idempotent; returns true when
    /// membership actually changed.
    pub fn apply(&self, peer: &PeerId, topic: &str, subscribe: bool) -> bool {
        let mut guard = self.write();
        let inner = &mut *guard;
        if subscribe {
            if !inner.by_topic.contains_key(topic) && inner.by_topic.len() >= MAX_TRACKED_TOPICS {
                debug!(topic = %topic, "topic table full, ignoring subscription");
                return false;
            }
            let peers = inner.by_topic.entry(topic.to_string()).or_default();
            if peers.len() >= MAX_PEERS_PER_TOPIC && !peers.contains(peer) {
                debug!(topic = %topic, peer = %peer, "topic peer set full, ignoring subscription");
                return false;
            }
            let added = peers.insert(peer.clone());
            if added {
                inner
                    .by_peer
                    .entry(peer.clone())
                    .or_default()
                    .insert(topic.to_string());
            }
            added
        } else {
            let mut removed = false;
            let mut topic_now_empty = false;
            if let Some(peers) = inner.by_topic.get_mut(topic) {
                removed = peers.remove(peer);
                topic_now_empty = peers.is_empty();
            }
            if topic_now_empty {
                inner.by_topic.remove(topic);
            }
            if removed {
                let mut peer_now_empty = false;
                if let Some(topics) = inner.by_peer.get_mut(peer) {
                    topics.remove(topic);
                    peer_now_empty = topics.is_empty();
                }
                if peer_now_empty {
                    inner.by_peer.remove(peer);
                }
            }
            removed
        }
    }

    /// Drop the peer from every topic. Returns the topics it was removed
    /// from; invoked on disconnect.
    pub fn remove_peer(&self, peer: &PeerId) -> Vec<String> {
        let mut guard = self.write();
        let inner = &mut *guard;
        let Some(topics) = inner.by_peer.remove(peer) else {
            return Vec::new();
        };
        let mut removed: Vec<String> = Vec::with_capacity(topics.len());
        for topic in topics {
            let mut now_empty = false;
            if let Some(peers) = inner.by_topic.get_mut(&topic) {
                peers.remove(peer);
                now_empty = peers.is_empty();
            }
            if now_empty {
                inner.by_topic.remove(&topic);
            }
            removed.push(topic);
        }
        removed
    }

    /// Peers currently known to be interested in the topic.
    pub fn interested_peers(&self, topic: &str) -> Vec<PeerId> {
        self.read()
            .by_topic
            .get(topic)
            .map(|peers| peers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The topic set a peer currently declares interest in.
    pub fn peer_topics(&self, peer: &PeerId) -> HashSet<String> {
        self.read().by_peer.get(peer).cloned().unwrap_or_default()
    }

    /// All topics with at least one interested peer.
    pub fn topics(&self) -> Vec<String> {
        self.read().by_topic.keys().cloned().collect()
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        inner.by_topic.clear();
        inner.by_peer.clear();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
