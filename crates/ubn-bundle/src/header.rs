//! Bundle header: the table of contents for one bundle blob.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! prelude   "UBN" | version: u8 | header_length: u32 (prelude included)
//! section*  tag: u8 | length: u24 | body
//! ```
//!
//! Sections appear in tag order and are omitted when empty:
//!
//! - **Types** (1): 20 bytes per entry, `guid[16] | version: u32`
//! - **Imports** (2): `count + 1` u32 offsets into the section body, then
//!   NUL-terminated UTF-8 locators
//! - **Exports** (3): 32 bytes per entry,
//!   `hash[20] | type: u16 | packet: u16 | offset: u32 | length: u32`
//! - **ExportRefs** (4): `exports + 1` u32 cumulative ref counts, then
//!   24 bytes per ref, `import: i16 | node: u16 | hash[20]`
//! - **Packets** (5): 16 bytes per entry,
//!   `format: u32 | encoded_offset: u32 | encoded_length: u32 | decoded_length: u32`
//!
//! Packet offsets are relative to the first byte after the header.

use ubn_types::{BlobLocator, BlobType, ContentHash};

use crate::compression::{self, BundleCompressionFormat};
use crate::error::{BundleError, BundleResult};
use crate::legacy;
use crate::wire::{put_blob_type, WireReader};

/// Signature of the current header format.
pub const BUNDLE_SIGNATURE: &[u8; 3] = b"UBN";

/// Size of the fixed prelude in front of every header.
pub const PRELUDE_LENGTH: usize = 8;

const SECTION_HEADER_LENGTH: usize = 4;
/// Largest body a single section can carry (24-bit length field).
pub const MAX_SECTION_LENGTH: usize = (1 << 24) - 1;

/// Header format revisions. Versions below [`BundleVersion::Sections`]
/// only exist in legacy (`UEBN`) headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BundleVersion {
    Initial = 0,
    /// Exports carry an alias string. Dropped again in the next version.
    ExportAliases = 1,
    RemoveAliases = 2,
    /// Imported nodes carry their hash and length.
    ImportHashes = 3,
    /// Sectioned little-endian layout with the `UBN` signature.
    Sections = 4,
}

impl BundleVersion {
    pub const LATEST_LEGACY: Self = Self::ImportHashes;
    pub const LATEST: Self = Self::Sections;

    pub fn from_u32(value: u32) -> BundleResult<Self> {
        match value {
            0 => Ok(Self::Initial),
            1 => Ok(Self::ExportAliases),
            2 => Ok(Self::RemoveAliases),
            3 => Ok(Self::ImportHashes),
            4 => Ok(Self::Sections),
            other => Err(BundleError::UnsupportedVersion(other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum SectionType {
    Types = 1,
    Imports = 2,
    Exports = 3,
    ExportRefs = 4,
    Packets = 5,
}

impl SectionType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Types),
            2 => Some(Self::Imports),
            3 => Some(Self::Exports),
            4 => Some(Self::ExportRefs),
            5 => Some(Self::Packets),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Types => "types",
            Self::Imports => "imports",
            Self::Exports => "exports",
            Self::ExportRefs => "export refs",
            Self::Packets => "packets",
        }
    }
}

/// One outgoing edge of an exported node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BundleExportRef {
    /// Index into the import table, or [`BundleExportRef::LOCAL`] for a
    /// node exported by the same bundle.
    pub import_index: i16,
    /// Export index of the target inside the referenced bundle.
    pub node_index: u16,
    pub hash: ContentHash,
}

impl BundleExportRef {
    pub const LOCAL: i16 = -1;
    pub const ENCODED_LEN: usize = 24;

    pub fn local(node_index: u16, hash: ContentHash) -> Self {
        Self {
            import_index: Self::LOCAL,
            node_index,
            hash,
        }
    }

    pub fn imported(import_index: i16, node_index: u16, hash: ContentHash) -> Self {
        Self {
            import_index,
            node_index,
            hash,
        }
    }

    pub fn is_local(&self) -> bool {
        self.import_index == Self::LOCAL
    }

    /// The import table index, or `None` for a local reference.
    pub fn import(&self) -> Option<usize> {
        usize::try_from(self.import_index).ok()
    }
}

/// Header record for one node stored in the bundle.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BundleExport {
    pub type_index: u16,
    pub hash: ContentHash,
    pub packet_index: u16,
    /// Byte offset of the node inside the decoded packet.
    pub offset: u32,
    pub length: u32,
    pub refs: Vec<BundleExportRef>,
}

impl BundleExport {
    pub const ENCODED_LEN: usize = 32;
}

/// Header record for one compressed region of payload bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BundlePacket {
    pub compression: BundleCompressionFormat,
    pub encoded_offset: u32,
    pub encoded_length: u32,
    pub decoded_length: u32,
}

impl BundlePacket {
    pub const ENCODED_LEN: usize = 16;

    /// Compress `decoded` into a packet placed at `encoded_offset`.
    pub fn encode(
        compression: BundleCompressionFormat,
        encoded_offset: u32,
        decoded: &[u8],
    ) -> BundleResult<(Self, Vec<u8>)> {
        let encoded = compression::compress(compression, decoded)?;
        let packet = Self {
            compression,
            encoded_offset,
            encoded_length: to_u32(encoded.len(), "encoded packet length")?,
            decoded_length: to_u32(decoded.len(), "decoded packet length")?,
        };
        Ok((packet, encoded))
    }

    /// Decompress this packet's encoded bytes.
    pub fn decode(&self, encoded: &[u8]) -> BundleResult<Vec<u8>> {
        if encoded.len() != self.encoded_length as usize {
            return Err(BundleError::DecompressionFailed(format!(
                "encoded length mismatch: expected {}, got {}",
                self.encoded_length,
                encoded.len()
            )));
        }
        compression::decompress(self.compression, encoded, self.decoded_length as usize)
    }

    /// One past the last encoded byte, relative to the data region.
    pub fn encoded_end(&self) -> u64 {
        self.encoded_offset as u64 + self.encoded_length as u64
    }
}

/// Decoded bundle header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BundleHeader {
    pub types: Vec<BlobType>,
    pub imports: Vec<BlobLocator>,
    pub exports: Vec<BundleExport>,
    pub packets: Vec<BundlePacket>,
}

impl BundleHeader {
    /// Assemble a header from its sections.
    pub fn create(
        types: Vec<BlobType>,
        imports: Vec<BlobLocator>,
        exports: Vec<BundleExport>,
        packets: Vec<BundlePacket>,
    ) -> Self {
        Self {
            types,
            imports,
            exports,
            packets,
        }
    }

    /// Size of the data region the packets describe.
    pub fn data_length(&self) -> u64 {
        self.packets
            .iter()
            .map(BundlePacket::encoded_end)
            .max()
            .unwrap_or(0)
    }

    /// Total header length declared by a prelude, for either signature.
    ///
    /// Only the first [`PRELUDE_LENGTH`] bytes are inspected, so this can be
    /// called on a partial prefetch.
    pub fn header_length(data: &[u8]) -> BundleResult<usize> {
        if data.len() < PRELUDE_LENGTH {
            return Err(BundleError::Truncated {
                needed: PRELUDE_LENGTH,
                actual: data.len(),
            });
        }
        if data.starts_with(legacy::LEGACY_SIGNATURE) {
            return legacy::header_length(data);
        }
        if !data.starts_with(BUNDLE_SIGNATURE) {
            return Err(BundleError::InvalidSignature {
                actual: data[..4].to_vec(),
            });
        }
        let length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if length < PRELUDE_LENGTH {
            return Err(BundleError::corrupt(
                "prelude",
                format!("header length {length} is shorter than the prelude"),
            ));
        }
        Ok(length)
    }

    /// Decode a header. Accepts the current format and every legacy version.
    ///
    /// `data` must contain at least the whole header; trailing bytes (the
    /// packet data) are ignored.
    pub fn read(data: &[u8]) -> BundleResult<Self> {
        let length = Self::header_length(data)?;
        if data.len() < length {
            return Err(BundleError::Truncated {
                needed: length,
                actual: data.len(),
            });
        }
        if data.starts_with(legacy::LEGACY_SIGNATURE) {
            return legacy::read(&data[..length]);
        }

        let version = data[3] as u32;
        if version < BundleVersion::Sections as u32 || version > BundleVersion::LATEST as u32 {
            return Err(BundleError::UnsupportedVersion(version));
        }
        Self::read_sections(&data[PRELUDE_LENGTH..length])
    }

    fn read_sections(body: &[u8]) -> BundleResult<Self> {
        let mut sections: [Option<&[u8]>; 5] = [None; 5];
        let mut reader = WireReader::new(body, "section table");
        while !reader.is_empty() {
            let tag = reader.u32_le()?;
            let section = SectionType::from_u8((tag & 0xFF) as u8).ok_or_else(|| {
                BundleError::corrupt("section table", format!("unknown section type {}", tag & 0xFF))
            })?;
            let section_body = reader.take((tag >> 8) as usize)?;
            let slot = &mut sections[section as usize - 1];
            if slot.is_some() {
                return Err(BundleError::corrupt(section.name(), "duplicate section"));
            }
            *slot = Some(section_body);
        }

        let [types, imports, exports, export_refs, packets] = sections;
        let mut header = Self::default();
        if let Some(body) = types {
            header.types = read_types(body)?;
        }
        if let Some(body) = imports {
            header.imports = read_imports(body)?;
        }
        if let Some(body) = exports {
            header.exports = read_exports(body)?;
        }
        if let Some(body) = export_refs {
            read_export_refs(body, &mut header.exports)?;
        }
        if let Some(body) = packets {
            header.packets = read_packets(body)?;
        }
        Ok(header)
    }

    /// Encode in the current format.
    pub fn to_bytes(&self) -> BundleResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_size_hint());
        buf.extend_from_slice(BUNDLE_SIGNATURE);
        buf.push(BundleVersion::LATEST as u8);
        buf.extend_from_slice(&0u32.to_le_bytes());

        if !self.types.is_empty() {
            let mut body = Vec::with_capacity(self.types.len() * BlobType::ENCODED_LEN);
            for blob_type in &self.types {
                put_blob_type(&mut body, blob_type);
            }
            write_section(&mut buf, SectionType::Types, &body)?;
        }
        if !self.imports.is_empty() {
            write_section(&mut buf, SectionType::Imports, &self.encode_imports()?)?;
        }
        if !self.exports.is_empty() {
            let mut body = Vec::with_capacity(self.exports.len() * BundleExport::ENCODED_LEN);
            for export in &self.exports {
                body.extend_from_slice(export.hash.as_bytes());
                body.extend_from_slice(&export.type_index.to_le_bytes());
                body.extend_from_slice(&export.packet_index.to_le_bytes());
                body.extend_from_slice(&export.offset.to_le_bytes());
                body.extend_from_slice(&export.length.to_le_bytes());
            }
            write_section(&mut buf, SectionType::Exports, &body)?;
        }
        if self.exports.iter().any(|export| !export.refs.is_empty()) {
            write_section(&mut buf, SectionType::ExportRefs, &self.encode_export_refs()?)?;
        }
        if !self.packets.is_empty() {
            let mut body = Vec::with_capacity(self.packets.len() * BundlePacket::ENCODED_LEN);
            for packet in &self.packets {
                body.extend_from_slice(&packet.compression.as_u32().to_le_bytes());
                body.extend_from_slice(&packet.encoded_offset.to_le_bytes());
                body.extend_from_slice(&packet.encoded_length.to_le_bytes());
                body.extend_from_slice(&packet.decoded_length.to_le_bytes());
            }
            write_section(&mut buf, SectionType::Packets, &body)?;
        }

        let length = to_u32(buf.len(), "header length")?;
        buf[4..PRELUDE_LENGTH].copy_from_slice(&length.to_le_bytes());
        Ok(buf)
    }

    fn encoded_size_hint(&self) -> usize {
        PRELUDE_LENGTH
            + 5 * SECTION_HEADER_LENGTH
            + self.types.len() * BlobType::ENCODED_LEN
            + self
                .imports
                .iter()
                .map(|import| import.as_str().len() + 5)
                .sum::<usize>()
            + self.exports.len() * (BundleExport::ENCODED_LEN + 4)
            + self
                .exports
                .iter()
                .map(|export| export.refs.len() * BundleExportRef::ENCODED_LEN)
                .sum::<usize>()
            + self.packets.len() * BundlePacket::ENCODED_LEN
    }

    fn encode_imports(&self) -> BundleResult<Vec<u8>> {
        let index_length = (self.imports.len() + 1) * 4;
        let mut strings = Vec::new();
        let mut body = Vec::with_capacity(index_length);
        for import in &self.imports {
            body.extend_from_slice(&to_u32(index_length + strings.len(), "import offset")?.to_le_bytes());
            strings.extend_from_slice(import.as_str().as_bytes());
            strings.push(0);
        }
        body.extend_from_slice(&to_u32(index_length + strings.len(), "import offset")?.to_le_bytes());
        body.extend_from_slice(&strings);
        Ok(body)
    }

    fn encode_export_refs(&self) -> BundleResult<Vec<u8>> {
        let mut index = Vec::with_capacity((self.exports.len() + 1) * 4);
        let mut records = Vec::new();
        let mut count = 0usize;
        for export in &self.exports {
            index.extend_from_slice(&to_u32(count, "export ref index")?.to_le_bytes());
            for export_ref in &export.refs {
                records.extend_from_slice(&export_ref.import_index.to_le_bytes());
                records.extend_from_slice(&export_ref.node_index.to_le_bytes());
                records.extend_from_slice(export_ref.hash.as_bytes());
            }
            count += export.refs.len();
        }
        index.extend_from_slice(&to_u32(count, "export ref index")?.to_le_bytes());
        index.extend_from_slice(&records);
        Ok(index)
    }
}

fn write_section(buf: &mut Vec<u8>, section: SectionType, body: &[u8]) -> BundleResult<()> {
    if body.len() > MAX_SECTION_LENGTH {
        return Err(BundleError::SectionTooLarge {
            section: section.name(),
            length: body.len(),
        });
    }
    let tag = section as u32 | ((body.len() as u32) << 8);
    buf.extend_from_slice(&tag.to_le_bytes());
    buf.extend_from_slice(body);
    Ok(())
}

fn check_stride(section: SectionType, body: &[u8], stride: usize) -> BundleResult<usize> {
    if body.len() % stride != 0 {
        return Err(BundleError::corrupt(
            section.name(),
            format!("length {} is not a multiple of {stride}", body.len()),
        ));
    }
    Ok(body.len() / stride)
}

fn read_types(body: &[u8]) -> BundleResult<Vec<BlobType>> {
    let count = check_stride(SectionType::Types, body, BlobType::ENCODED_LEN)?;
    let mut reader = WireReader::new(body, SectionType::Types.name());
    let mut types = Vec::with_capacity(count);
    for _ in 0..count {
        let guid = reader.guid()?;
        let version = reader.u32_le()?;
        types.push(BlobType::new(guid, version));
    }
    Ok(types)
}

fn read_imports(body: &[u8]) -> BundleResult<Vec<BlobLocator>> {
    let section = SectionType::Imports.name();
    let mut reader = WireReader::new(body, section);
    let first = reader.u32_le()? as usize;
    if first < 4 || first % 4 != 0 || first > body.len() {
        return Err(BundleError::corrupt(section, format!("bad index length {first}")));
    }

    let mut offsets = Vec::with_capacity(first / 4);
    offsets.push(first);
    for _ in 1..first / 4 {
        offsets.push(reader.u32_le()? as usize);
    }

    let mut imports = Vec::with_capacity(offsets.len() - 1);
    for window in offsets.windows(2) {
        let (start, end) = (window[0], window[1]);
        if start >= end || end > body.len() || body[end - 1] != 0 {
            return Err(BundleError::corrupt(
                section,
                format!("bad locator range {start}..{end}"),
            ));
        }
        let text = std::str::from_utf8(&body[start..end - 1])
            .map_err(|_| BundleError::InvalidUtf8(section))?;
        let locator =
            BlobLocator::new(text).map_err(|e| BundleError::corrupt(section, e.to_string()))?;
        imports.push(locator);
    }
    Ok(imports)
}

fn read_exports(body: &[u8]) -> BundleResult<Vec<BundleExport>> {
    let count = check_stride(SectionType::Exports, body, BundleExport::ENCODED_LEN)?;
    let mut reader = WireReader::new(body, SectionType::Exports.name());
    let mut exports = Vec::with_capacity(count);
    for _ in 0..count {
        let hash = reader.hash()?;
        let type_index = reader.u16_le()?;
        let packet_index = reader.u16_le()?;
        let offset = reader.u32_le()?;
        let length = reader.u32_le()?;
        exports.push(BundleExport {
            type_index,
            hash,
            packet_index,
            offset,
            length,
            refs: Vec::new(),
        });
    }
    Ok(exports)
}

fn read_export_refs(body: &[u8], exports: &mut [BundleExport]) -> BundleResult<()> {
    let section = SectionType::ExportRefs.name();
    let mut reader = WireReader::new(body, section);
    let mut index = Vec::with_capacity(exports.len() + 1);
    for _ in 0..=exports.len() {
        index.push(reader.u32_le()? as usize);
    }

    let total = index[exports.len()];
    if index[0] != 0 || index.windows(2).any(|w| w[0] > w[1]) {
        return Err(BundleError::corrupt(section, "ref index is not monotonic"));
    }
    if reader.remaining() != total * BundleExportRef::ENCODED_LEN {
        return Err(BundleError::corrupt(
            section,
            format!("{total} refs declared, {} bytes of records", reader.remaining()),
        ));
    }

    for (i, export) in exports.iter_mut().enumerate() {
        let count = index[i + 1] - index[i];
        export.refs.reserve_exact(count);
        for _ in 0..count {
            let import_index = reader.i16_le()?;
            let node_index = reader.u16_le()?;
            let hash = reader.hash()?;
            export.refs.push(BundleExportRef {
                import_index,
                node_index,
                hash,
            });
        }
    }
    Ok(())
}

fn read_packets(body: &[u8]) -> BundleResult<Vec<BundlePacket>> {
    let count = check_stride(SectionType::Packets, body, BundlePacket::ENCODED_LEN)?;
    let mut reader = WireReader::new(body, SectionType::Packets.name());
    let mut packets = Vec::with_capacity(count);
    for _ in 0..count {
        let compression = BundleCompressionFormat::from_u32(reader.u32_le()?)?;
        packets.push(BundlePacket {
            compression,
            encoded_offset: reader.u32_le()?,
            encoded_length: reader.u32_le()?,
            decoded_length: reader.u32_le()?,
        });
    }
    Ok(packets)
}

pub(crate) fn to_u32(value: usize, what: &str) -> BundleResult<u32> {
    u32::try_from(value).map_err(|_| BundleError::LimitExceeded(format!("{what} {value} exceeds u32")))
}
