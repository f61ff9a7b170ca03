//! Per-packet compression.
//!
//! Every packet in a bundle is compressed independently, so a reader only
//! has to fetch and decode the packets that hold the nodes it wants. The
//! codec is recorded per packet; the writer picks packet boundaries.

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{BundleError, BundleResult};

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;

#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 9;

/// Codec used for one packet. The discriminant is the on-disk tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum BundleCompressionFormat {
    /// Stored as-is.
    None = 0,
    /// LZ4 block format; fast, moderate ratio.
    #[default]
    Lz4 = 1,
    /// Brotli stream; general purpose.
    Brotli = 2,
    /// Zstandard; high ratio. Requires the `zstd` feature.
    Zstd = 3,
}

impl BundleCompressionFormat {
    /// Parse an on-disk tag.
    pub fn from_u32(value: u32) -> BundleResult<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Brotli),
            3 => Ok(Self::Zstd),
            other => Err(BundleError::UnknownCompression(other)),
        }
    }

    /// The on-disk tag.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Whether this build can encode and decode the format.
    pub fn is_available(self) -> bool {
        match self {
            Self::Zstd => cfg!(feature = "zstd"),
            _ => true,
        }
    }
}

impl fmt::Display for BundleCompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Lz4 => write!(f, "lz4"),
            Self::Brotli => write!(f, "brotli"),
            Self::Zstd => write!(f, "zstd"),
        }
    }
}

/// Compress `input` with `format`.
pub fn compress(format: BundleCompressionFormat, input: &[u8]) -> BundleResult<Vec<u8>> {
    if input.is_empty() {
        return Ok(Vec::new());
    }
    match format {
        BundleCompressionFormat::None => Ok(input.to_vec()),
        BundleCompressionFormat::Lz4 => Ok(lz4_flex::block::compress(input)),
        BundleCompressionFormat::Brotli => {
            let mut output = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(
                    &mut output,
                    BROTLI_BUFFER_SIZE,
                    BROTLI_QUALITY,
                    BROTLI_WINDOW,
                );
                writer
                    .write_all(input)
                    .map_err(|e| BundleError::CompressionFailed(e.to_string()))?;
            }
            Ok(output)
        }
        BundleCompressionFormat::Zstd => compress_zstd(input),
    }
}

/// Decompress `input`, which must expand to exactly `decoded_length` bytes.
pub fn decompress(
    format: BundleCompressionFormat,
    input: &[u8],
    decoded_length: usize,
) -> BundleResult<Vec<u8>> {
    if decoded_length == 0 {
        return Ok(Vec::new());
    }
    let output = match format {
        BundleCompressionFormat::None => input.to_vec(),
        BundleCompressionFormat::Lz4 => lz4_flex::block::decompress(input, decoded_length)
            .map_err(|e| BundleError::DecompressionFailed(e.to_string()))?,
        BundleCompressionFormat::Brotli => read_bounded(
            brotli::Decompressor::new(input, BROTLI_BUFFER_SIZE),
            decoded_length,
        )?,
        BundleCompressionFormat::Zstd => decompress_zstd(input, decoded_length)?,
    };

    if output.len() != decoded_length {
        return Err(BundleError::DecompressionFailed(format!(
            "size mismatch: expected {decoded_length}, got {}",
            output.len()
        )));
    }
    Ok(output)
}

/// Drain a stream decoder, reading at most one byte past `decoded_length`
/// so an oversized packet is detected without being expanded.
fn read_bounded(decoder: impl Read, decoded_length: usize) -> BundleResult<Vec<u8>> {
    let mut output = Vec::with_capacity(decoded_length);
    decoder
        .take(decoded_length as u64 + 1)
        .read_to_end(&mut output)
        .map_err(|e| BundleError::DecompressionFailed(e.to_string()))?;
    Ok(output)
}

#[cfg(feature = "zstd")]
fn compress_zstd(input: &[u8]) -> BundleResult<Vec<u8>> {
    zstd::encode_all(input, ZSTD_LEVEL).map_err(|e| BundleError::CompressionFailed(e.to_string()))
}

#[cfg(not(feature = "zstd"))]
fn compress_zstd(_input: &[u8]) -> BundleResult<Vec<u8>> {
    Err(BundleError::CompressionUnavailable(
        BundleCompressionFormat::Zstd,
    ))
}

#[cfg(feature = "zstd")]
fn decompress_zstd(input: &[u8], decoded_length: usize) -> BundleResult<Vec<u8>> {
    let decoder = zstd::stream::read::Decoder::new(input)
        .map_err(|e| BundleError::DecompressionFailed(e.to_string()))?;
    read_bounded(decoder, decoded_length)
}

#[cfg(not(feature = "zstd"))]
fn decompress_zstd(_input: &[u8], _decoded_length: usize) -> BundleResult<Vec<u8>> {
    Err(BundleError::CompressionUnavailable(
        BundleCompressionFormat::Zstd,
    ))
}
