use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::store::{GraphStore, StoreError};

struct Inner {
    entries: BTreeMap<String, Value>,
    queues: Vec<VecDeque<(String, Value)>>,
    blocked: HashSet<String>,
    /// Deliver every write this many times (at-least-once gossip).
    deliveries_per_write: usize,
    /// Deliver drained updates in reverse order.
    reorder: bool,
}

/// An in-memory gossip graph for simulated swarms.
///
/// Every [`GraphHandle`] sees every write (including its own, as gossip
/// echoes do) through a per-subscriber queue drained by the test driver.
/// Impairments: targeted key blocking (the write never propagates),
/// duplicate delivery, and reversed delivery order.
pub struct VirtualGraph {
    inner: Arc<Mutex<Inner>>,
}

impl Default for VirtualGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualGraph {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: BTreeMap::new(),
                queues: Vec::new(),
                blocked: HashSet::new(),
                deliveries_per_write: 1,
                reorder: false,
            })),
        }
    }

    /// Registers a new subscriber and returns its store handle.
    pub fn handle(&self) -> GraphHandle {
        let mut inner = self.inner.lock();
        inner.queues.push(VecDeque::new());
        GraphHandle {
            subscriber: inner.queues.len() - 1,
            inner: self.inner.clone(),
        }
    }

    /// Writes to `key` are swallowed entirely: not stored, not delivered.
    pub fn block_key(&self, key: &str) {
        self.inner.lock().blocked.insert(key.to_string());
    }

    pub fn unblock_key(&self, key: &str) {
        self.inner.lock().blocked.remove(key);
    }

    /// Removes an already-stored entry, as a tombstone would.
    pub fn remove_entry(&self, key: &str) {
        self.inner.lock().entries.remove(key);
    }

    /// Every write is delivered `n` times to every subscriber.
    pub fn set_deliveries_per_write(&self, n: usize) {
        self.inner.lock().deliveries_per_write = n.max(1);
    }

    /// Drained updates come out newest-first.
    pub fn set_reorder(&self, reorder: bool) {
        self.inner.lock().reorder = reorder;
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

/// One subscriber's view of a [`VirtualGraph`].
#[derive(Clone)]
pub struct GraphHandle {
    subscriber: usize,
    inner: Arc<Mutex<Inner>>,
}

impl GraphHandle {
    /// Takes the pending subscription updates for this subscriber.
    pub fn drain(&self) -> Vec<(String, Value)> {
        let mut inner = self.inner.lock();
        let reorder = inner.reorder;
        let queue = &mut inner.queues[self.subscriber];
        let mut updates: Vec<(String, Value)> = queue.drain(..).collect();
        if reorder {
            updates.reverse();
        }
        updates
    }
}

impl GraphStore for GraphHandle {
    fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.blocked.contains(key) {
            return Ok(());
        }
        inner.entries.insert(key.to_string(), value.clone());
        let copies = inner.deliveries_per_write;
        for queue in &mut inner.queues {
            for _ in 0..copies {
                queue.push_back((key.to_string(), value.clone()));
            }
        }
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Vec<(String, Value)> {
        let inner = self.inner.lock();
        inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// A store whose writes always fail. Used to exercise the offer-publish
/// failure path.
pub struct FailingStore;

impl GraphStore for FailingStore {
    fn put(&self, _key: &str, _value: Value) -> Result<(), StoreError> {
        Err(StoreError("gossip write timed out".to_string()))
    }

    fn scan(&self, _prefix: &str) -> Vec<(String, Value)> {
        Vec::new()
    }
}
