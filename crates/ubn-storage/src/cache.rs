//! Bounded dedup caches shared by every fork of one writer.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

use ubn_types::{BlobType, ContentHash, NodeLocator};

use crate::handle::BlobHandle;

/// Map with a key capacity, evicting the oldest inserted key first.
///
/// Lookups do not refresh an entry's position.
pub(crate) struct FifoMap<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> FifoMap<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Insert or replace. Replacing keeps the key's original age.
    pub(crate) fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = value;
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Dedup cache keyed by `(hash, type)`, holding the handle of the first
/// write of each node.
pub struct NodeCache {
    inner: Mutex<FifoMap<(ContentHash, BlobType), BlobHandle>>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(FifoMap::new(capacity)),
        }
    }

    pub fn get(&self, hash: &ContentHash, blob_type: &BlobType) -> Option<BlobHandle> {
        self.inner
            .lock()
            .expect("node cache lock poisoned")
            .get(&(*hash, *blob_type))
            .cloned()
    }

    pub fn insert(&self, hash: ContentHash, blob_type: BlobType, handle: BlobHandle) {
        self.inner
            .lock()
            .expect("node cache lock poisoned")
            .insert((hash, blob_type), handle);
    }

    /// Return the cached handle for the key, or insert the one built by
    /// `make`. The boolean is `true` when `make` ran.
    ///
    /// Check and insert happen under one lock, so two forks staging the
    /// same node concurrently agree on a single handle. Cached handles whose
    /// pending bundle was disposed are replaced.
    pub fn get_or_insert_with(
        &self,
        hash: ContentHash,
        blob_type: BlobType,
        make: impl FnOnce() -> BlobHandle,
    ) -> (BlobHandle, bool) {
        let mut inner = self.inner.lock().expect("node cache lock poisoned");
        let key = (hash, blob_type);
        if let Some(existing) = inner.get(&key) {
            if existing.is_live() {
                return (existing.clone(), false);
            }
        }
        let handle = make();
        inner.insert(key, handle.clone());
        (handle, true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("node cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hash-keyed index of nodes that already live in a persisted bundle.
///
/// The zero hash is never indexed.
pub struct ContentIndex {
    inner: Mutex<FifoMap<ContentHash, (BlobType, NodeLocator)>>,
}

impl ContentIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(FifoMap::new(capacity)),
        }
    }

    pub fn get(&self, hash: &ContentHash) -> Option<(BlobType, NodeLocator)> {
        if hash.is_zero() {
            return None;
        }
        self.inner
            .lock()
            .expect("content index lock poisoned")
            .get(hash)
            .cloned()
    }

    pub fn insert(&self, blob_type: BlobType, locator: NodeLocator) {
        if locator.hash.is_zero() {
            return;
        }
        self.inner
            .lock()
            .expect("content index lock poisoned")
            .insert(locator.hash, (blob_type, locator));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("content index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
