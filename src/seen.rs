//! Time-bounded cache of already-processed message identities.
//!
//! Exactly-once local delivery in a best-effort overlay hangs on this cache:
//! every pipeline and the publish path share one instance, and the
//! check-then-insert for a given identity happens under a single lock
//! acquisition, so two pipelines racing on the same identity can never both
//! treat it as new.
//!
//! The cache approximates "recently seen". Entries expire after the
//! retention window; a very late duplicate may therefore be redelivered.
//! Within the window an inserted identity stays authoritative.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::messages::MessageId;

/// How long a seen identity suppresses duplicates.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);

/// Maximum identities tracked at once.
/// SECURITY: Bounds cache memory; sized well above the message volume a
/// node processes within one retention window.
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

pub struct SeenCache {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: LruCache<MessageId, Instant>,
    ttl: Duration,
    last_sweep: Instant,
}

impl SeenCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::new(DEFAULT_SEEN_CAPACITY).expect("default capacity is non-zero"));
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(cap),
                ttl,
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Whether the identity was inserted within the retention window.
    pub fn contains(&self, id: &MessageId) -> bool {
        let inner = self.lock();
        match inner.entries.peek(id) {
            Some(at) => at.elapsed() < inner.ttl,
            None => false,
        }
    }

    /// Record the identity unless it is already present and fresh.
    ///
    /// Returns true when the identity was new (or had expired) and is now
    /// recorded; false when it was already seen within the window. The
    /// check and the insert happen under one lock acquisition.
    pub fn insert_if_absent(&self, id: MessageId) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.maybe_sweep();

        if let Some(at) = inner.entries.get(&id)
            && at.elapsed() < inner.ttl
        {
            return false;
        }
        inner.entries.put(id, Instant::now());
        true
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    /// Drop expired entries, at most once per retention window. Eviction is
    /// lazy: a stale entry that survives until the next probe still answers
    /// correctly because reads check the insertion time.
    fn maybe_sweep(&mut self) {
        if self.last_sweep.elapsed() < self.ttl {
            return;
        }
        let ttl = self.ttl;
        let expired: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|(_, at)| at.elapsed() >= ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.entries.pop(&id);
        }
        self.last_sweep = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::default_message_id;
    use crate::peer::PeerId;

    fn id(seqno: u64) -> MessageId {
        default_message_id(&PeerId::from("origin"), seqno)
    }

    #[test]
    fn first_insert_wins_second_loses() {
        let cache = SeenCache::new(DEFAULT_SEEN_TTL, 16);

        assert!(cache.insert_if_absent(id(1)));
        assert!(!cache.insert_if_absent(id(1)));
        assert!(cache.contains(&id(1)));
    }

    #[test]
    fn identities_are_independent() {
        let cache = SeenCache::new(DEFAULT_SEEN_TTL, 16);

        assert!(cache.insert_if_absent(id(1)));
        assert!(!cache.contains(&id(2)));
        assert!(cache.insert_if_absent(id(2)));
        assert!(!cache.insert_if_absent(id(1)));
        assert!(!cache.insert_if_absent(id(2)));
    }

    #[test]
    fn expired_entries_are_forgotten() {
        let cache = SeenCache::new(Duration::from_millis(40), 16);

        assert!(cache.insert_if_absent(id(1)));
        assert!(cache.contains(&id(1)));

        std::thread::sleep(Duration::from_millis(80));

        assert!(!cache.contains(&id(1)));
        assert!(cache.insert_if_absent(id(1)));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let cache = SeenCache::new(Duration::from_millis(40), 16);

        for seqno in 0..8 {
            cache.insert_if_absent(id(seqno));
        }
        assert_eq!(cache.len(), 8);

        std::thread::sleep(Duration::from_millis(80));

        // Insert triggers the sweep once the window has fully elapsed.
        cache.insert_if_absent(id(100));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_bound_evicts_oldest() {
        let cache = SeenCache::new(DEFAULT_SEEN_TTL, 4);

        for seqno in 0..5 {
            assert!(cache.insert_if_absent(id(seqno)));
        }
        assert_eq!(cache.len(), 4);
        // The least-recently-used identity fell out and reads as new again.
        assert!(!cache.contains(&id(0)));
        assert!(cache.contains(&id(4)));
    }
}
