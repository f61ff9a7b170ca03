//! Byte-level helpers shared by the current and legacy header codecs.

use ubn_types::{BlobType, ContentHash};
use uuid::Uuid;

use crate::error::{BundleError, BundleResult};

/// Bounds-checked cursor over a header region.
pub(crate) struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
    section: &'static str,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(data: &'a [u8], section: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            section,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn take(&mut self, len: usize) -> BundleResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(BundleError::corrupt(
                self.section,
                format!(
                    "need {len} bytes at offset {}, {} remain",
                    self.pos,
                    self.remaining()
                ),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> BundleResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u16_le(&mut self) -> BundleResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn i16_le(&mut self) -> BundleResult<i16> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32_le(&mut self) -> BundleResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn hash(&mut self) -> BundleResult<ContentHash> {
        Ok(ContentHash::from_raw(self.array()?))
    }

    pub(crate) fn guid(&mut self) -> BundleResult<Uuid> {
        Ok(Uuid::from_bytes(self.array()?))
    }

    pub(crate) fn varint(&mut self) -> BundleResult<u64> {
        let (value, consumed) =
            decode_varint(&self.data[self.pos..]).map_err(|reason| {
                BundleError::corrupt(self.section, format!("{reason} at offset {}", self.pos))
            })?;
        self.pos += consumed;
        Ok(value)
    }

    /// A varint that must fit in `usize` and stay below `limit`.
    pub(crate) fn varint_usize(&mut self, limit: usize, what: &str) -> BundleResult<usize> {
        let value = self.varint()?;
        if value > limit as u64 {
            return Err(BundleError::corrupt(
                self.section,
                format!("{what} {value} exceeds limit {limit}"),
            ));
        }
        Ok(value as usize)
    }

    /// A varint length-prefixed UTF-8 string.
    pub(crate) fn string(&mut self) -> BundleResult<&'a str> {
        let len = self.varint_usize(self.remaining(), "string length")?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| BundleError::InvalidUtf8(self.section))
    }
}

pub(crate) fn put_blob_type(buf: &mut Vec<u8>, blob_type: &BlobType) {
    buf.extend_from_slice(blob_type.guid.as_bytes());
    buf.extend_from_slice(&blob_type.version.to_le_bytes());
}

/// Encode a u64 as a variable-length integer.
pub(crate) fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a variable-length integer. Returns (value, bytes_consumed).
pub(crate) fn decode_varint(data: &[u8]) -> Result<(u64, usize), &'static str> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        if shift >= 64 {
            return Err("varint overflow");
        }
    }
    Err("truncated varint")
}
