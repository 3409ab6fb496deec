use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Map with per-entry idle expiry, used to bound the UDP NAT table.
///
/// Every `get`/`set` re-timestamps the entry. Expired entries are only
/// collected by `sweep`, which the owning relay runs on the event loop's
/// periodic cadence; steady-state operations never pay for eviction.
///
/// Visit times queue up in insertion order next to the map. A record is
/// stale once the entry was visited again later (or removed), so `sweep`
/// pops records until it reaches one younger than the TTL and touches
/// only expired entries plus already-dead records along the way.
pub struct SessionCache<K, V> {
    ttl: Duration,
    map: HashMap<K, Entry<V>>,
    visits: VecDeque<(Instant, K)>,
}

struct Entry<V> {
    value: V,
    last_visit: Instant,
}

impl<K, V> SessionCache<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new(ttl: Duration) -> SessionCache<K, V> {
        SessionCache {
            ttl,
            map: HashMap::new(),
            visits: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let now = Instant::now();
        match self.map.get_mut(key) {
            Some(entry) => {
                entry.last_visit = now;
                self.visits.push_back((now, key.clone()));
                Some(&entry.value)
            }
            None => None,
        }
    }

    pub fn set(&mut self, key: K, value: V) {
        let now = Instant::now();
        self.visits.push_back((now, key.clone()));
        self.map.insert(
            key,
            Entry {
                value,
                last_visit: now,
            },
        );
    }

    /// Plain removal for callers doing their own teardown; the sweep
    /// callback is not involved.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|entry| entry.value)
    }

    /// Evict everything idle longer than the TTL. `close_callback` runs
    /// for each evicted value while the entry is still in the map; if it
    /// panics the entry survives and is retried on a later sweep.
    pub fn sweep<F>(&mut self, mut close_callback: F)
    where
        F: FnMut(&K, &mut V),
    {
        let now = Instant::now();
        loop {
            let key = match self.visits.front() {
                Some(&(visited, ref key)) if now.duration_since(visited) >= self.ttl => {
                    key.clone()
                }
                _ => break,
            };

            if let Some(entry) = self.map.get_mut(&key) {
                if now.duration_since(entry.last_visit) >= self.ttl {
                    close_callback(&key, &mut entry.value);
                    self.map.remove(&key);
                }
            }
            self.visits.pop_front();
        }
    }
}
