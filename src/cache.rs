use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::hash::Hasher;
use std::time::{Duration, Instant};

use ahash::AHasher;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{Error, Result};
use crate::metrics;
use crate::protocol::RespValue;

const SHARD_COUNT: usize = 16;

/// Client-side cache fed by server-assisted invalidation.
///
/// Entries are keyed by `(cache key, command fingerprint)` so `GET k` and
/// `HGET k f` cache independently while both fall to an invalidation of
/// `k`. Each key has at most one in-flight server fetch; concurrent
/// lookups join the pending entry as waiters.
pub(crate) struct ClientCache {
    shards: Vec<Shard>,
}

/// Outcome of a cache lookup.
pub(crate) enum Flight {
    /// Fresh entry served locally.
    Hit(RespValue),
    /// Another caller owns the fetch; wait for its completion.
    Join(oneshot::Receiver<Result<RespValue>>),
    /// This caller must perform the server fetch and settle the entry.
    Fetch(FetchTicket),
}

/// Obligation to settle a pending entry via [`ClientCache::complete_fetch`]
/// or [`ClientCache::fail_fetch`].
pub(crate) struct FetchTicket {
    key: Bytes,
    fingerprint: u64,
}

enum Lookup {
    Hit(RespValue),
    Expired,
    Join(oneshot::Receiver<Result<RespValue>>),
    Absent,
}

impl ClientCache {
    pub fn new(max_entries: usize) -> Self {
        let per_shard = (max_entries.max(1) + SHARD_COUNT - 1) / SHARD_COUNT;
        let shards = (0..SHARD_COUNT).map(|_| Shard::new(per_shard)).collect();
        Self { shards }
    }

    /// Look up `(key, fingerprint)`, claiming the fetch when absent.
    pub fn begin(&self, key: &Bytes, fingerprint: u64) -> Flight {
        let now = Instant::now();
        let shard = self.shard_for(key);
        let mut inner = shard.inner.lock();
        let entry_key = EntryKey {
            key: key.clone(),
            fingerprint,
        };
        let decision = match inner.entries.get_mut(&entry_key) {
            Some(Entry::Ready {
                value, expires_at, ..
            }) if *expires_at > now => Lookup::Hit(value.clone()),
            // expired entries are collected on access
            Some(Entry::Ready { .. }) => Lookup::Expired,
            Some(Entry::Pending { waiters, .. }) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Lookup::Join(rx)
            }
            None => Lookup::Absent,
        };
        match decision {
            Lookup::Hit(value) => {
                inner.touch(&entry_key);
                metrics::cache_hit();
                return Flight::Hit(value);
            }
            Lookup::Join(rx) => {
                metrics::cache_hit();
                return Flight::Join(rx);
            }
            Lookup::Expired => inner.remove(&entry_key),
            Lookup::Absent => {}
        }
        inner.insert_pending(entry_key);
        metrics::cache_miss();
        Flight::Fetch(FetchTicket {
            key: key.clone(),
            fingerprint,
        })
    }

    /// Settle a fetch with the server reply. The entry only becomes Ready
    /// when no invalidation arrived while it was pending; waiters receive
    /// the value either way. `server_pttl_ms` caps the requested TTL with
    /// the server-side expiry hint.
    pub fn complete_fetch(
        &self,
        ticket: FetchTicket,
        value: &RespValue,
        ttl: Duration,
        server_pttl_ms: Option<i64>,
    ) {
        let ttl = match server_pttl_ms {
            Some(hint) if hint >= 0 => ttl.min(Duration::from_millis(hint as u64)),
            _ => ttl,
        };
        let expires_at = Instant::now() + ttl;
        let shard = self.shard_for(&ticket.key);
        let mut inner = shard.inner.lock();
        let entry_key = EntryKey {
            key: ticket.key,
            fingerprint: ticket.fingerprint,
        };
        let (waiters, poisoned) = match inner.entries.get_mut(&entry_key) {
            Some(Entry::Pending {
                waiters,
                invalidated,
            }) => (std::mem::take(waiters), *invalidated),
            // a flush raced the reply; nothing to settle
            _ => return,
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(value.clone()));
        }
        if poisoned || value.is_error() {
            inner.remove(&entry_key);
        } else {
            inner.settle_ready(entry_key, value.clone(), expires_at);
        }
    }

    /// Fail a fetch, releasing all waiters with the same error.
    pub fn fail_fetch(&self, ticket: FetchTicket, err: &Error) {
        let shard = self.shard_for(&ticket.key);
        let mut inner = shard.inner.lock();
        let entry_key = EntryKey {
            key: ticket.key,
            fingerprint: ticket.fingerprint,
        };
        if let Some(Entry::Pending { waiters, .. }) = inner.entries.get_mut(&entry_key) {
            for waiter in std::mem::take(waiters) {
                let _ = waiter.send(Err(err.clone()));
            }
        }
        inner.remove(&entry_key);
    }

    /// Server-pushed invalidation for a list of tracked keys.
    pub fn invalidate_keys<B: AsRef<[u8]>>(&self, keys: &[B]) {
        let mut removed = 0usize;
        for key in keys {
            let key = key.as_ref();
            let shard = self.shard_for_bytes(key);
            removed += shard.inner.lock().invalidate_key(key);
        }
        if removed > 0 {
            trace!(removed, "cache entries invalidated by server push");
            metrics::cache_invalidate(removed);
        }
    }

    /// A null invalidation payload: drop the whole tracking scope.
    pub fn flush(&self) {
        let mut removed = 0usize;
        for shard in &self.shards {
            removed += shard.inner.lock().flush();
        }
        if removed > 0 {
            metrics::cache_invalidate(removed);
        }
    }

    fn shard_for(&self, key: &Bytes) -> &Shard {
        self.shard_for_bytes(key.as_ref())
    }

    fn shard_for_bytes(&self, key: &[u8]) -> &Shard {
        let mut hasher = AHasher::default();
        hasher.write(key);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    key: Bytes,
    fingerprint: u64,
}

enum Entry {
    Pending {
        waiters: Vec<oneshot::Sender<Result<RespValue>>>,
        /// Set when an invalidation lands while the fetch is in flight;
        /// the eventual reply is delivered but never cached.
        invalidated: bool,
    },
    Ready {
        value: RespValue,
        expires_at: Instant,
        access: u64,
    },
}

struct Shard {
    inner: Mutex<ShardInner>,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ShardInner {
                entries: HashMap::new(),
                by_key: HashMap::new(),
                order: BinaryHeap::new(),
                counter: 0,
                capacity: capacity.max(1),
            }),
        }
    }
}

struct ShardInner {
    entries: HashMap<EntryKey, Entry>,
    /// cache key -> fingerprints resident under it, for invalidation.
    by_key: HashMap<Bytes, SmallVec<[u64; 4]>>,
    /// Lazy LRU: stale stamps are skipped during eviction.
    order: BinaryHeap<Reverse<HeapStamp>>,
    counter: u64,
    capacity: usize,
}

impl ShardInner {
    fn insert_pending(&mut self, entry_key: EntryKey) {
        self.by_key
            .entry(entry_key.key.clone())
            .or_default()
            .push(entry_key.fingerprint);
        self.entries.insert(
            entry_key,
            Entry::Pending {
                waiters: Vec::new(),
                invalidated: false,
            },
        );
    }

    fn settle_ready(&mut self, entry_key: EntryKey, value: RespValue, expires_at: Instant) {
        let access = self.next_access();
        self.order.push(Reverse(HeapStamp {
            access,
            key: entry_key.clone(),
        }));
        self.entries.insert(
            entry_key,
            Entry::Ready {
                value,
                expires_at,
                access,
            },
        );
        self.enforce_capacity();
    }

    fn touch(&mut self, entry_key: &EntryKey) {
        let access = self.next_access();
        if let Some(Entry::Ready { access: stamp, .. }) = self.entries.get_mut(entry_key) {
            *stamp = access;
            self.order.push(Reverse(HeapStamp {
                access,
                key: entry_key.clone(),
            }));
        }
    }

    fn remove(&mut self, entry_key: &EntryKey) {
        if self.entries.remove(entry_key).is_some() {
            self.detach(entry_key);
        }
    }

    fn detach(&mut self, entry_key: &EntryKey) {
        if let Some(fingerprints) = self.by_key.get_mut(entry_key.key.as_ref()) {
            if let Some(pos) = fingerprints
                .iter()
                .position(|fp| *fp == entry_key.fingerprint)
            {
                fingerprints.swap_remove(pos);
            }
            if fingerprints.is_empty() {
                self.by_key.remove(entry_key.key.as_ref());
            }
        }
    }

    fn invalidate_key(&mut self, key: &[u8]) -> usize {
        let fingerprints = match self.by_key.get(key) {
            Some(fps) => fps.clone(),
            None => return 0,
        };
        let mut removed = 0usize;
        for fingerprint in fingerprints {
            let entry_key = EntryKey {
                key: Bytes::copy_from_slice(key),
                fingerprint,
            };
            let drop_entry = match self.entries.get_mut(&entry_key) {
                Some(Entry::Ready { .. }) => true,
                Some(Entry::Pending { invalidated, .. }) => {
                    *invalidated = true;
                    false
                }
                None => false,
            };
            if drop_entry {
                self.remove(&entry_key);
                removed += 1;
            }
        }
        removed
    }

    fn flush(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry {
            Entry::Ready { .. } => false,
            Entry::Pending { invalidated, .. } => {
                *invalidated = true;
                true
            }
        });
        self.order.clear();
        let entries = &self.entries;
        self.by_key.retain(|key, fingerprints| {
            fingerprints.retain(|fp| {
                entries.contains_key(&EntryKey {
                    key: key.clone(),
                    fingerprint: *fp,
                })
            });
            !fingerprints.is_empty()
        });
        before - self.entries.len()
    }

    fn enforce_capacity(&mut self) {
        while self.entries.len() > self.capacity {
            if !self.pop_lru() {
                break;
            }
        }
    }

    fn pop_lru(&mut self) -> bool {
        while let Some(Reverse(stamp)) = self.order.pop() {
            match self.entries.get(&stamp.key) {
                Some(Entry::Ready { access, .. }) if *access == stamp.access => {
                    self.remove(&stamp.key);
                    return true;
                }
                _ => {} // stale stamp
            }
        }
        false
    }

    fn next_access(&mut self) -> u64 {
        self.counter = self.counter.wrapping_add(1);
        self.counter
    }
}

struct HeapStamp {
    access: u64,
    key: EntryKey,
}

impl PartialEq for HeapStamp {
    fn eq(&self, other: &Self) -> bool {
        self.access == other.access
    }
}

impl Eq for HeapStamp {}

impl PartialOrd for HeapStamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapStamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.access.cmp(&other.access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> Bytes {
        Bytes::copy_from_slice(name.as_bytes())
    }

    #[test]
    fn single_flight_second_lookup_joins() {
        let cache = ClientCache::new(64);
        let k = key("user:1");
        let ticket = match cache.begin(&k, 7) {
            Flight::Fetch(ticket) => ticket,
            _ => panic!("first lookup must own the fetch"),
        };
        let mut join = match cache.begin(&k, 7) {
            Flight::Join(rx) => rx,
            _ => panic!("second lookup must join"),
        };
        assert!(join.try_recv().is_err());

        cache.complete_fetch(ticket, &RespValue::bulk("v"), secs(60), None);
        let joined = join.blocking_recv().unwrap().unwrap();
        assert_eq!(joined, RespValue::bulk("v"));

        match cache.begin(&k, 7) {
            Flight::Hit(value) => assert_eq!(value, RespValue::bulk("v")),
            _ => panic!("third lookup must hit"),
        }
    }

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn invalidation_during_flight_poisons_the_entry() {
        let cache = ClientCache::new(64);
        let k = key("user:2");
        let ticket = match cache.begin(&k, 1) {
            Flight::Fetch(ticket) => ticket,
            _ => panic!("expected fetch"),
        };
        cache.invalidate_keys(&[k.clone()]);
        cache.complete_fetch(ticket, &RespValue::bulk("stale"), secs(60), None);
        // reply was delivered but never cached
        assert!(matches!(cache.begin(&k, 1), Flight::Fetch(_)));
    }

    #[test]
    fn ready_entries_drop_on_invalidation() {
        let cache = ClientCache::new(64);
        let k = key("user:3");
        match cache.begin(&k, 1) {
            Flight::Fetch(ticket) => {
                cache.complete_fetch(ticket, &RespValue::bulk("v"), secs(60), None)
            }
            _ => panic!("expected fetch"),
        }
        assert!(matches!(cache.begin(&k, 1), Flight::Hit(_)));
        cache.invalidate_keys(&[k.clone()]);
        assert!(matches!(cache.begin(&k, 1), Flight::Fetch(_)));
    }

    #[test]
    fn flush_clears_ready_and_poisons_pending() {
        let cache = ClientCache::new(64);
        let ready = key("ready");
        let pending = key("pending");
        match cache.begin(&ready, 1) {
            Flight::Fetch(ticket) => {
                cache.complete_fetch(ticket, &RespValue::bulk("v"), secs(60), None)
            }
            _ => panic!("expected fetch"),
        }
        let pending_ticket = match cache.begin(&pending, 1) {
            Flight::Fetch(ticket) => ticket,
            _ => panic!("expected fetch"),
        };
        cache.flush();
        assert!(matches!(cache.begin(&ready, 1), Flight::Fetch(_)));
        cache.complete_fetch(pending_ticket, &RespValue::bulk("late"), secs(60), None);
        // the poisoned pending entry must not have been cached
        assert!(matches!(cache.begin(&pending, 1), Flight::Fetch(_)));
    }

    #[test]
    fn server_ttl_hint_caps_expiry() {
        let cache = ClientCache::new(64);
        let k = key("short");
        match cache.begin(&k, 1) {
            Flight::Fetch(ticket) => {
                // zero hint expires immediately
                cache.complete_fetch(ticket, &RespValue::bulk("v"), secs(60), Some(0))
            }
            _ => panic!("expected fetch"),
        }
        assert!(matches!(cache.begin(&k, 1), Flight::Fetch(_)));
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = ClientCache::new(SHARD_COUNT); // one entry per shard
        for i in 0..(SHARD_COUNT * 3) {
            let k = key(&format!("bulk:{i}"));
            if let Flight::Fetch(ticket) = cache.begin(&k, 1) {
                cache.complete_fetch(ticket, &RespValue::bulk("v"), secs(60), None);
            }
        }
        // every shard stayed within its bound
        for shard in &cache.shards {
            let inner = shard.inner.lock();
            assert!(inner.entries.len() <= inner.capacity);
        }
    }

    #[test]
    fn distinct_fingerprints_cache_independently() {
        let cache = ClientCache::new(64);
        let k = key("user:4");
        if let Flight::Fetch(ticket) = cache.begin(&k, 1) {
            cache.complete_fetch(ticket, &RespValue::bulk("get"), secs(60), None);
        }
        assert!(matches!(cache.begin(&k, 2), Flight::Fetch(_)));
        assert!(matches!(cache.begin(&k, 1), Flight::Hit(_)));
        // both fall to one invalidation of the key
        cache.invalidate_keys(&[k.clone()]);
        assert!(matches!(cache.begin(&k, 1), Flight::Fetch(_)));
    }
}
