use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use ubn_types::BlobLocator;

use crate::error::{StoreError, StoreResult};
use crate::traits::{clamp_range, new_locator, validate_prefix, StorageBackend};

/// Local-disk backend: one file per blob below a root directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// blob is either fully present or absent.
#[derive(Clone, Debug)]
pub struct FileStorageBackend {
    root: PathBuf,
}

impl FileStorageBackend {
    /// Create a backend rooted at `root`. The directory is created lazily.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, locator: &BlobLocator) -> StoreResult<PathBuf> {
        validate_prefix(locator.path())?;
        Ok(self.root.join(locator.path()))
    }
}

#[async_trait]
impl StorageBackend for FileStorageBackend {
    async fn read_range(
        &self,
        locator: &BlobLocator,
        offset: u64,
        length: usize,
    ) -> StoreResult<Bytes> {
        let path = self.blob_path(locator)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(locator.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let total = file.metadata().await?.len();
        let (start, end) = clamp_range(locator, offset, length, total)?;

        file.seek(SeekFrom::Start(start as u64)).await?;
        let mut buf = vec![0u8; end - start];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write_stream(&self, data: Bytes, prefix: &str) -> StoreResult<BlobLocator> {
        let locator = new_locator(prefix, "ubn")?;
        let path = self.blob_path(&locator)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(locator = %locator, bytes = data.len(), "blob written to disk");
        Ok(locator)
    }
}
