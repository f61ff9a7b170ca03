use async_trait::async_trait;
use bytes::Bytes;
use ubn_types::BlobLocator;

use crate::error::{StoreError, StoreResult};

/// Byte-level blob storage used by the bundle engine.
///
/// This is the whole contract between the engine and a backend. All
/// implementations must satisfy these invariants:
/// - Blobs are immutable once written.
/// - Every successful [`write_stream`] returns a locator that has never been
///   returned before.
/// - Locator fragments (`#...`) are ignored; the blob is addressed by
///   [`BlobLocator::path`].
/// - All I/O errors are propagated, never retried or silently ignored.
///
/// [`write_stream`]: StorageBackend::write_stream
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read up to `length` bytes starting at `offset`.
    ///
    /// Returns fewer bytes when the blob ends before `offset + length`.
    /// Returns [`StoreError::OffsetOutOfRange`] when `offset` is past the end.
    async fn read_range(&self, locator: &BlobLocator, offset: u64, length: usize)
        -> StoreResult<Bytes>;

    /// Persist a new blob under `prefix` and return its locator.
    async fn write_stream(&self, data: Bytes, prefix: &str) -> StoreResult<BlobLocator>;
}

/// Reject prefixes that are absolute or climb out of the backend root.
pub(crate) fn validate_prefix(prefix: &str) -> StoreResult<()> {
    if prefix.starts_with('/')
        || prefix.contains('\\')
        || prefix.contains('#')
        || prefix.split('/').any(|part| part == "..")
    {
        return Err(StoreError::InvalidPrefix(prefix.to_string()));
    }
    Ok(())
}

/// Build a fresh locator below `prefix`.
pub(crate) fn new_locator(prefix: &str, extension: &str) -> StoreResult<BlobLocator> {
    validate_prefix(prefix)?;
    let name = uuid::Uuid::now_v7().simple().to_string();
    let path = match prefix.trim_end_matches('/') {
        "" => format!("{name}.{extension}"),
        prefix => format!("{prefix}/{name}.{extension}"),
    };
    Ok(BlobLocator::new(path)?)
}

/// Clamp a requested range to a blob of `total` bytes.
pub(crate) fn clamp_range(
    locator: &BlobLocator,
    offset: u64,
    length: usize,
    total: u64,
) -> StoreResult<(usize, usize)> {
    if offset > total {
        return Err(StoreError::OffsetOutOfRange {
            locator: locator.clone(),
            offset,
            length: total,
        });
    }
    let start = offset as usize;
    let end = (offset.saturating_add(length as u64)).min(total) as usize;
    Ok((start, end))
}
