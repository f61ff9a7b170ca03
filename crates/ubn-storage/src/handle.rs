//! Handles to nodes, whether or not they have been persisted yet.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use ubn_types::{BlobType, ContentHash, NodeLocator};

use crate::error::{StorageError, StorageResult};
use crate::node::Node;
use crate::pending::PendingNode;
use crate::reader::BundleReader;

/// A node's bytes together with its outgoing references.
#[derive(Clone, Debug)]
pub struct NodeData {
    pub hash: ContentHash,
    pub blob_type: BlobType,
    pub data: Bytes,
    pub refs: Vec<BlobHandle>,
    /// Where the node was read from; `None` when served from a writer buffer.
    pub locator: Option<NodeLocator>,
}

/// Callback registered with [`BlobHandle::on_flushed`].
pub type FlushCallback = Box<dyn FnOnce(StorageResult<NodeLocator>) + Send + 'static>;

/// Reference to a node.
///
/// A handle returned by the writer starts out backed by its pending bundle
/// and serves reads from the writer's memory. Once the bundle is persisted
/// the same handle reports a [`NodeLocator`] and reads through the reader.
/// Handles never own bundle buffers.
#[derive(Clone)]
pub struct BlobHandle {
    inner: HandleInner,
}

#[derive(Clone)]
enum HandleInner {
    Pending(Arc<PendingNode>),
    Flushed(Arc<FlushedNode>),
}

struct FlushedNode {
    locator: NodeLocator,
    reader: BundleReader,
}

impl BlobHandle {
    /// Handle to a node that already lives in a persisted bundle.
    pub fn from_locator(locator: NodeLocator, reader: BundleReader) -> Self {
        Self {
            inner: HandleInner::Flushed(Arc::new(FlushedNode { locator, reader })),
        }
    }

    pub(crate) fn pending(node: Arc<PendingNode>) -> Self {
        Self {
            inner: HandleInner::Pending(node),
        }
    }

    pub(crate) fn as_pending(&self) -> Option<&Arc<PendingNode>> {
        match &self.inner {
            HandleInner::Pending(node) => Some(node),
            HandleInner::Flushed(_) => None,
        }
    }

    pub fn hash(&self) -> ContentHash {
        match &self.inner {
            HandleInner::Pending(node) => node.hash(),
            HandleInner::Flushed(flushed) => flushed.locator.hash,
        }
    }

    /// The persisted location, once the node has been written.
    pub fn locator(&self) -> Option<NodeLocator> {
        match &self.inner {
            HandleInner::Pending(node) => node.locator(),
            HandleInner::Flushed(flushed) => Some(flushed.locator.clone()),
        }
    }

    pub fn is_flushed(&self) -> bool {
        self.locator().is_some()
    }

    /// Whether the node can still be read or flushed.
    pub(crate) fn is_live(&self) -> bool {
        match &self.inner {
            HandleInner::Pending(node) => node.is_live(),
            HandleInner::Flushed(_) => true,
        }
    }

    /// Read the node's bytes and references.
    pub async fn read(&self) -> StorageResult<NodeData> {
        match &self.inner {
            HandleInner::Pending(node) => node.read().await,
            HandleInner::Flushed(flushed) => flushed.reader.read_node(&flushed.locator).await,
        }
    }

    /// Read and deserialize as `T`. Any serializer version of `T`'s type
    /// GUID is accepted; `T::deserialize` sees the stored version.
    pub async fn read_node<T: Node>(&self) -> StorageResult<T> {
        let data = self.read().await?;
        if data.blob_type.guid != T::BLOB_TYPE.guid {
            return Err(StorageError::TypeMismatch {
                expected: T::BLOB_TYPE,
                actual: data.blob_type,
            });
        }
        T::deserialize(&data)
    }

    /// Wait until the node is persisted and return its locator.
    ///
    /// Seals the owning bundle if it is still accepting nodes.
    pub async fn flush(&self) -> StorageResult<NodeLocator> {
        match &self.inner {
            HandleInner::Pending(node) => node.flush().await,
            HandleInner::Flushed(flushed) => Ok(flushed.locator.clone()),
        }
    }

    /// Run `callback` once the node is persisted, or with the error that
    /// prevented it. Runs immediately when the outcome is already known.
    /// Fires exactly once.
    pub fn on_flushed(&self, callback: impl FnOnce(StorageResult<NodeLocator>) + Send + 'static) {
        match &self.inner {
            HandleInner::Pending(node) => PendingNode::on_flushed(node, Box::new(callback)),
            HandleInner::Flushed(flushed) => callback(Ok(flushed.locator.clone())),
        }
    }
}

impl fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.locator() {
            Some(locator) => write!(f, "BlobHandle({locator})"),
            None => write!(f, "BlobHandle({}, pending)", self.hash().short_hex()),
        }
    }
}

impl PartialEq for BlobHandle {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (HandleInner::Pending(a), HandleInner::Pending(b)) => Arc::ptr_eq(a, b),
            _ => self.hash() == other.hash() && self.locator() == other.locator(),
        }
    }
}
