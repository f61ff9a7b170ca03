//! Writer and reader configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use ubn_bundle::BundleCompressionFormat;

use crate::error::{StorageError, StorageResult};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Header prefetch window when no reader cache is configured.
const HEADER_PREFETCH_UNCACHED: usize = 16 * KIB;
/// Header prefetch window when a reader cache can keep the surplus packets.
const HEADER_PREFETCH_CACHED: usize = MIB;

/// Configuration for [`BundleWriter`](crate::BundleWriter).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Seal a bundle once its uncompressed size reaches this many bytes.
    pub max_blob_size: usize,
    /// Codec applied to every packet.
    pub compression: BundleCompressionFormat,
    /// Close the current packet once it holds at least this many bytes.
    pub min_compression_packet_size: usize,
    /// Buffered, not yet persisted bytes across all forks before writes block.
    pub max_in_memory_bytes: usize,
    /// Capacity of the `(hash, type)` dedup cache.
    pub node_cache_size: usize,
    /// Capacity of the hash-keyed index of persisted nodes.
    pub content_index_size: usize,
    /// Prefix handed to the backend for every bundle blob.
    pub blob_prefix: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_blob_size: 10 * MIB,
            compression: BundleCompressionFormat::Lz4,
            min_compression_packet_size: 16 * KIB,
            max_in_memory_bytes: 128 * MIB,
            node_cache_size: 1024,
            content_index_size: 512 * KIB,
            blob_prefix: "bundles".to_string(),
        }
    }
}

/// Sizes of the reader's caches, in entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderCacheConfig {
    pub header_count: usize,
    pub encoded_packet_count: usize,
    pub decoded_packet_count: usize,
}

impl Default for ReaderCacheConfig {
    fn default() -> Self {
        Self {
            header_count: 1024,
            encoded_packet_count: 256,
            decoded_packet_count: 256,
        }
    }
}

/// Configuration for [`BundleReader`](crate::BundleReader).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Backend reads the dispatcher keeps in flight at once.
    pub max_concurrent_reads: usize,
    /// Upper bound for one coalesced packet read.
    pub max_packet_fetch_size: usize,
    /// Header and packet caches; `None` disables caching.
    pub cache: Option<ReaderCacheConfig>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reads: 4,
            max_packet_fetch_size: 4 * MIB,
            cache: Some(ReaderCacheConfig::default()),
        }
    }
}

impl ReaderConfig {
    /// A reader that never caches headers or packets.
    pub fn uncached() -> Self {
        Self {
            cache: None,
            ..Default::default()
        }
    }

    /// Bytes requested by the first read of a bundle header.
    pub fn header_prefetch_size(&self) -> usize {
        if self.cache.is_some() {
            HEADER_PREFETCH_CACHED
        } else {
            HEADER_PREFETCH_UNCACHED
        }
    }
}

/// Top-level storage configuration, loadable from TOML.
///
/// ```toml
/// [writer]
/// max_blob_size = 4194304
/// compression = "brotli"
///
/// [reader]
/// max_concurrent_reads = 8
///
/// [reader.cache]
/// header_count = 64
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub writer: WriterConfig,
    pub reader: ReaderConfig,
}

impl StorageConfig {
    pub fn from_toml_str(s: &str) -> StorageResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> StorageResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> StorageResult<()> {
        let w = &self.writer;
        let checks = [
            (w.max_blob_size == 0, "writer.max_blob_size must be non-zero"),
            (
                w.min_compression_packet_size == 0,
                "writer.min_compression_packet_size must be non-zero",
            ),
            (
                w.min_compression_packet_size > w.max_blob_size,
                "writer.min_compression_packet_size exceeds writer.max_blob_size",
            ),
            (
                w.max_in_memory_bytes == 0,
                "writer.max_in_memory_bytes must be non-zero",
            ),
            (
                !w.compression.is_available(),
                "writer.compression is not enabled in this build",
            ),
            (
                self.reader.max_concurrent_reads == 0,
                "reader.max_concurrent_reads must be non-zero",
            ),
            (
                self.reader.max_packet_fetch_size == 0,
                "reader.max_packet_fetch_size must be non-zero",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(StorageError::Config((*message).to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = StorageConfig::default();
        assert_eq!(c.writer.max_blob_size, 10 * 1024 * 1024);
        assert_eq!(c.writer.compression, BundleCompressionFormat::Lz4);
        assert_eq!(c.writer.min_compression_packet_size, 16 * 1024);
        assert_eq!(c.writer.max_in_memory_bytes, 128 * 1024 * 1024);
        assert_eq!(c.writer.node_cache_size, 1024);
        assert_eq!(c.writer.content_index_size, 512 * 1024);
        assert_eq!(c.reader.max_concurrent_reads, 4);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn prefetch_window_depends_on_cache() {
        assert_eq!(ReaderConfig::default().header_prefetch_size(), 1024 * 1024);
        assert_eq!(ReaderConfig::uncached().header_prefetch_size(), 16 * 1024);
    }

    #[test]
    fn partial_toml() {
        let c = StorageConfig::from_toml_str(
            r#"
            [writer]
            max_blob_size = 4096
            min_compression_packet_size = 1024
            compression = "brotli"

            [reader.cache]
            header_count = 8
            "#,
        )
        .unwrap();
        assert_eq!(c.writer.max_blob_size, 4096);
        assert_eq!(c.writer.compression, BundleCompressionFormat::Brotli);
        assert_eq!(c.writer.node_cache_size, 1024);
        let cache = c.reader.cache.unwrap();
        assert_eq!(cache.header_count, 8);
        assert_eq!(cache.decoded_packet_count, 256);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = StorageConfig::from_toml_str("[writer]\nmax_blob_size = \"big\"").unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn validation_rejects_packet_larger_than_blob() {
        let mut c = StorageConfig::default();
        c.writer.min_compression_packet_size = c.writer.max_blob_size + 1;
        assert!(matches!(c.validate(), Err(StorageError::Config(_))));
    }

    #[test]
    fn validation_rejects_zero_concurrency() {
        let mut c = StorageConfig::default();
        c.reader.max_concurrent_reads = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        std::fs::write(&path, "[reader]\nmax_concurrent_reads = 2\n").unwrap();
        let c = StorageConfig::load(&path).unwrap();
        assert_eq!(c.reader.max_concurrent_reads, 2);
        assert!(StorageConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
