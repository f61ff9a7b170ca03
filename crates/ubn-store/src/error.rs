use ubn_types::{BlobLocator, TypeError};

/// Errors from blob storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested blob was not found.
    #[error("blob not found: {0}")]
    NotFound(BlobLocator),

    /// A read started past the end of the blob.
    #[error("offset {offset} is past the end of {locator} ({length} bytes)")]
    OffsetOutOfRange {
        locator: BlobLocator,
        offset: u64,
        length: u64,
    },

    /// The backend produced or was given an unusable locator.
    #[error("invalid locator: {0}")]
    InvalidLocator(#[from] TypeError),

    /// The write prefix would escape the backend's namespace.
    #[error("invalid blob prefix: {0:?}")]
    InvalidPrefix(String),

    /// I/O error from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for backend operations.
pub type StoreResult<T> = Result<T, StoreError>;
