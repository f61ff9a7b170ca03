use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use ubn_types::BlobLocator;

use crate::error::{StoreError, StoreResult};
use crate::traits::{clamp_range, new_locator, StorageBackend};

/// In-memory, HashMap-based blob backend.
///
/// Intended for tests and embedding. Besides storage it keeps simple
/// accounting (number of ranged reads, order of writes) so callers can
/// observe how the engine talks to its backend.
pub struct InMemoryStorageBackend {
    blobs: RwLock<HashMap<String, Bytes>>,
    reads: AtomicUsize,
    writes: Mutex<Vec<BlobLocator>>,
}

impl InMemoryStorageBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.read().expect("lock poisoned").len()
    }

    /// Returns `true` if no blobs are stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored blobs.
    pub fn total_bytes(&self) -> u64 {
        self.blobs
            .read()
            .expect("lock poisoned")
            .values()
            .map(|blob| blob.len() as u64)
            .sum()
    }

    /// Whole contents of a blob, if present.
    pub fn get(&self, locator: &BlobLocator) -> Option<Bytes> {
        self.blobs
            .read()
            .expect("lock poisoned")
            .get(locator.path())
            .cloned()
    }

    /// Store (or replace) a blob at a caller-chosen path.
    pub fn insert(&self, locator: &BlobLocator, data: impl Into<Bytes>) {
        self.blobs
            .write()
            .expect("lock poisoned")
            .insert(locator.path().to_string(), data.into());
    }

    /// Number of `read_range` calls served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Locators returned by `write_stream`, in write order.
    pub fn write_log(&self) -> Vec<BlobLocator> {
        self.writes.lock().expect("lock poisoned").clone()
    }
}

impl Default for InMemoryStorageBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorageBackend {
    async fn read_range(
        &self,
        locator: &BlobLocator,
        offset: u64,
        length: usize,
    ) -> StoreResult<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let blob = self
            .get(locator)
            .ok_or_else(|| StoreError::NotFound(locator.clone()))?;
        let (start, end) = clamp_range(locator, offset, length, blob.len() as u64)?;
        Ok(blob.slice(start..end))
    }

    async fn write_stream(&self, data: Bytes, prefix: &str) -> StoreResult<BlobLocator> {
        let locator = new_locator(prefix, "ubn")?;
        self.insert(&locator, data);
        self.writes
            .lock()
            .expect("lock poisoned")
            .push(locator.clone());
        Ok(locator)
    }
}

impl std::fmt::Debug for InMemoryStorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorageBackend")
            .field("blob_count", &self.len())
            .field("reads", &self.read_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_full() {
        let backend = InMemoryStorageBackend::new();
        let loc = backend
            .write_stream(Bytes::from_static(b"hello world"), "bundles")
            .await
            .unwrap();
        let data = backend.read_range(&loc, 0, 1024).await.unwrap();
        assert_eq!(&data[..], b"hello world");
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.total_bytes(), 11);
    }

    #[tokio::test]
    async fn ranged_read() {
        let backend = InMemoryStorageBackend::new();
        let loc = backend
            .write_stream(Bytes::from_static(b"0123456789"), "b")
            .await
            .unwrap();
        let data = backend.read_range(&loc, 3, 4).await.unwrap();
        assert_eq!(&data[..], b"3456");
        assert_eq!(backend.read_count(), 1);
    }

    #[tokio::test]
    async fn read_ignores_fragment() {
        let backend = InMemoryStorageBackend::new();
        let loc = backend
            .write_stream(Bytes::from_static(b"abc"), "b")
            .await
            .unwrap();
        let with_fragment = loc.with_fragment("inner").unwrap();
        let data = backend.read_range(&with_fragment, 0, 3).await.unwrap();
        assert_eq!(&data[..], b"abc");
    }

    #[tokio::test]
    async fn missing_blob() {
        let backend = InMemoryStorageBackend::new();
        let loc = BlobLocator::new("nope").unwrap();
        let err = backend.read_range(&loc, 0, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn offset_past_end() {
        let backend = InMemoryStorageBackend::new();
        let loc = backend
            .write_stream(Bytes::from_static(b"abc"), "b")
            .await
            .unwrap();
        let err = backend.read_range(&loc, 10, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::OffsetOutOfRange { .. }));
    }

    #[tokio::test]
    async fn write_log_preserves_order() {
        let backend = InMemoryStorageBackend::new();
        let a = backend.write_stream(Bytes::from_static(b"a"), "b").await.unwrap();
        let b = backend.write_stream(Bytes::from_static(b"b"), "b").await.unwrap();
        assert_eq!(backend.write_log(), vec![a, b]);
    }
}
