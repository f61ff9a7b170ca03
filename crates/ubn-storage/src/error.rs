use std::sync::Arc;

use thiserror::Error;
use ubn_bundle::BundleError;
use ubn_store::StoreError;
use ubn_types::{BlobLocator, BlobType, ContentHash};

/// Errors raised by the bundle writer, reader and handles.
///
/// Cloneable so that one persist failure can be delivered to every waiter:
/// the bundle's completion, each callback, each dependent bundle and each
/// flushing handle.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("bundle format error: {0}")]
    Format(Arc<BundleError>),

    #[error("storage backend error: {0}")]
    Backend(Arc<StoreError>),

    #[error("pending bundle was disposed before it completed")]
    DisposedBeforeComplete,

    #[error("bundle {bundle} could not be written: {source}")]
    DependencyFailed {
        bundle: u64,
        #[source]
        source: Box<StorageError>,
    },

    #[error("unresolved reference to node {0}")]
    UnresolvedReference(ContentHash),

    #[error("export {index} out of range in {locator} ({count} exports)")]
    ExportOutOfRange {
        locator: BlobLocator,
        index: usize,
        count: usize,
    },

    #[error("import {index} out of range in {locator} ({count} imports)")]
    ImportOutOfRange {
        locator: BlobLocator,
        index: usize,
        count: usize,
    },

    #[error("packet {index} out of range in {locator} ({count} packets)")]
    PacketOutOfRange {
        locator: BlobLocator,
        index: usize,
        count: usize,
    },

    #[error("export {index} in {locator} lies outside its packet")]
    ExportOutsidePacket { locator: BlobLocator, index: usize },

    #[error("bundle limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("no deserializer registered for blob type {0}")]
    UnknownBlobType(BlobType),

    #[error("blob type mismatch: expected {expected}, found {actual}")]
    TypeMismatch { expected: BlobType, actual: BlobType },

    #[error("node decode failed: {0}")]
    Decode(String),

    #[error("bundle reader has shut down")]
    ReaderClosed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<BundleError> for StorageError {
    fn from(e: BundleError) -> Self {
        Self::Format(Arc::new(e))
    }
}

impl From<StoreError> for StorageError {
    fn from(e: StoreError) -> Self {
        Self::Backend(Arc::new(e))
    }
}
