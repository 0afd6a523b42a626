use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use kai_core::ids::SessionId;

/// Cleanup hook invoked on every removal path: explicit remove, LRU
/// eviction, clear, and the cleanup barrier.
pub trait Teardown {
    fn teardown(&self);
}

/// Cleanup barrier state. Once `Cleaning` is entered no insertion succeeds
/// again for the lifetime of the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    Idle,
    Cleaning,
    Cleaned,
}

struct CacheInner<V> {
    entries: HashMap<SessionId, Arc<V>>,
    /// LRU order: front = most recently used.
    order: Vec<SessionId>,
    state: CacheState,
}

/// Bounded LRU mapping from session id to a live runtime instance. The lock
/// covers only map bookkeeping; teardown hooks always run after it is
/// released, so a torn-down instance is never observable through `get`.
pub struct SessionCache<V: Teardown> {
    capacity: usize,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Teardown> SessionCache<V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
                state: CacheState::Idle,
            }),
        }
    }

    pub fn state(&self) -> CacheState {
        self.inner.lock().state
    }

    /// Get an entry, refreshing its LRU position.
    pub fn get(&self, id: &SessionId) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();
        let value = inner.entries.get(id).cloned()?;
        if let Some(pos) = inner.order.iter().position(|x| x == id) {
            let id = inner.order.remove(pos);
            inner.order.insert(0, id);
        }
        Some(value)
    }

    pub fn has(&self, id: &SessionId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Insert an entry. Returns `false` (without inserting) once cleanup has
    /// started. Evicts the least-recently-used entry when over capacity,
    /// invoking its teardown hook.
    pub fn set(&self, id: SessionId, value: Arc<V>) -> bool {
        let evicted = {
            let mut inner = self.inner.lock();
            if inner.state != CacheState::Idle {
                return false;
            }

            if let Some(pos) = inner.order.iter().position(|x| *x == id) {
                inner.order.remove(pos);
            }
            inner.order.insert(0, id.clone());
            inner.entries.insert(id, value);

            let mut evicted = Vec::new();
            while inner.order.len() > self.capacity {
                let Some(oldest) = inner.order.pop() else {
                    break;
                };
                if let Some(old) = inner.entries.remove(&oldest) {
                    tracing::debug!(session_id = %oldest, "evicting session from cache");
                    evicted.push(old);
                }
            }
            evicted
        };

        for old in evicted {
            old.teardown();
        }
        true
    }

    /// Remove an entry, invoking its teardown hook. Returns whether an entry
    /// was present.
    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            if let Some(pos) = inner.order.iter().position(|x| x == id) {
                inner.order.remove(pos);
            }
            inner.entries.remove(id)
        };
        match removed {
            Some(value) => {
                value.teardown();
                true
            }
            None => false,
        }
    }

    /// Remove every entry, invoking teardown hooks. Leaves the barrier
    /// untouched.
    pub fn clear(&self) {
        let drained: Vec<Arc<V>> = {
            let mut inner = self.inner.lock();
            inner.order.clear();
            inner.entries.drain().map(|(_, v)| v).collect()
        };
        for value in drained {
            value.teardown();
        }
    }

    /// Enter the cleanup barrier and tear everything down. Concurrent and
    /// repeated calls coalesce: only the first performs work.
    pub fn cleanup(&self) {
        let drained: Vec<Arc<V>> = {
            let mut inner = self.inner.lock();
            if inner.state != CacheState::Idle {
                return;
            }
            inner.state = CacheState::Cleaning;
            inner.order.clear();
            inner.entries.drain().map(|(_, v)| v).collect()
        };

        for value in drained {
            value.teardown();
        }

        self.inner.lock().state = CacheState::Cleaned;
    }
}
