use thiserror::Error;

use crate::compression::BundleCompressionFormat;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("invalid bundle signature: {actual:?}")]
    InvalidSignature { actual: Vec<u8> },

    #[error("unsupported bundle version: {0}")]
    UnsupportedVersion(u32),

    #[error("bundle data truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("corrupt {section} section: {reason}")]
    CorruptSection {
        section: &'static str,
        reason: String,
    },

    #[error("{section} section is {length} bytes, larger than the 24-bit limit")]
    SectionTooLarge { section: &'static str, length: usize },

    #[error("unknown compression format: {0}")]
    UnknownCompression(u32),

    #[error("compression format {0:?} is not enabled in this build")]
    CompressionUnavailable(BundleCompressionFormat),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("bundle exceeds format limits: {0}")]
    LimitExceeded(String),
}

pub type BundleResult<T> = Result<T, BundleError>;

impl BundleError {
    pub(crate) fn corrupt(section: &'static str, reason: impl Into<String>) -> Self {
        Self::CorruptSection {
            section,
            reason: reason.into(),
        }
    }
}
