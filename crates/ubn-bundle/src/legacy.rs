//! Reader for legacy `UEBN` headers.
//!
//! Legacy headers are a single varint-encoded payload behind an 8-byte
//! prelude (`"UEBN" | payload_length: u32 BE`):
//!
//! ```text
//! version compression
//! types    count { guid[16] version }
//! imports  count { locator count { [hash[20] length] export_index } }
//! exports  count { type hash[20] length [alias] count { node } }
//! packets  count { encoded_length decoded_length }
//! ```
//!
//! Import entry hashes and lengths exist from [`BundleVersion::ImportHashes`]
//! on, and export aliases only in [`BundleVersion::ExportAliases`]. A ref
//! names a node id in a flattened space: every imported entry in import
//! order, then the bundle's own exports.
//!
//! Legacy packets carry no offsets. They are laid out back to back and all
//! use the header's single compression format; exports fill them in order.
//! Both are reconstructed here so that callers only ever see the current
//! [`BundleHeader`] shape.

use tracing::debug;
use ubn_types::{BlobLocator, BlobType, ContentHash};

use crate::compression::BundleCompressionFormat;
use crate::error::{BundleError, BundleResult};
use crate::header::{
    to_u32, BundleExport, BundleExportRef, BundleHeader, BundlePacket, BundleVersion,
    PRELUDE_LENGTH,
};
use crate::wire::WireReader;

/// Signature of legacy headers.
pub const LEGACY_SIGNATURE: &[u8; 4] = b"UEBN";

const SECTION: &str = "legacy header";

/// Total header length declared by a legacy prelude.
pub(crate) fn header_length(data: &[u8]) -> BundleResult<usize> {
    let payload = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    Ok(PRELUDE_LENGTH + payload)
}

struct ImportEntry {
    import_index: i16,
    node_index: u16,
    hash: ContentHash,
}

/// Decode a complete legacy header into the current representation.
pub(crate) fn read(data: &[u8]) -> BundleResult<BundleHeader> {
    let mut reader = WireReader::new(&data[PRELUDE_LENGTH..], SECTION);

    let raw_version = reader.varint()?;
    let version = u32::try_from(raw_version)
        .map_err(|_| BundleError::UnsupportedVersion(u32::MAX))
        .and_then(BundleVersion::from_u32)?;
    if version > BundleVersion::LATEST_LEGACY {
        return Err(BundleError::UnsupportedVersion(version as u32));
    }

    let compression = BundleCompressionFormat::from_u32(
        u32::try_from(reader.varint()?).map_err(|_| BundleError::UnknownCompression(u32::MAX))?,
    )?;

    let type_count = reader.varint_usize(reader.remaining(), "type count")?;
    let mut types = Vec::with_capacity(type_count);
    for _ in 0..type_count {
        let guid = reader.guid()?;
        let type_version = reader.varint_usize(u32::MAX as usize, "type version")?;
        types.push(BlobType::new(guid, type_version as u32));
    }

    let import_count = reader.varint_usize(i16::MAX as usize, "import count")?;
    let mut imports = Vec::with_capacity(import_count);
    let mut imported_nodes = Vec::new();
    for import_index in 0..import_count {
        let locator = BlobLocator::new(reader.string()?)
            .map_err(|e| BundleError::corrupt(SECTION, e.to_string()))?;
        imports.push(locator);

        let entry_count = reader.varint_usize(reader.remaining(), "import entry count")?;
        for _ in 0..entry_count {
            let hash = if version >= BundleVersion::ImportHashes {
                let hash = reader.hash()?;
                // Node length is not part of the current header.
                reader.varint()?;
                hash
            } else {
                ContentHash::ZERO
            };
            let node_index = reader.varint_usize(u16::MAX as usize, "import export index")?;
            imported_nodes.push(ImportEntry {
                import_index: import_index as i16,
                node_index: node_index as u16,
                hash,
            });
        }
    }

    let export_count = reader.varint_usize(u16::MAX as usize + 1, "export count")?;
    let mut exports = Vec::with_capacity(export_count);
    let mut raw_refs = Vec::with_capacity(export_count);
    for _ in 0..export_count {
        let type_index = reader.varint_usize(u16::MAX as usize, "type index")?;
        let hash = reader.hash()?;
        let length = reader.varint_usize(u32::MAX as usize, "export length")?;
        if version == BundleVersion::ExportAliases {
            reader.string()?;
        }
        let ref_count = reader.varint_usize(reader.remaining(), "ref count")?;
        let mut node_ids = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            node_ids.push(reader.varint_usize(usize::MAX, "ref node id")?);
        }
        raw_refs.push(node_ids);
        exports.push(BundleExport {
            type_index: type_index as u16,
            hash,
            packet_index: 0,
            offset: 0,
            length: length as u32,
            refs: Vec::new(),
        });
    }

    for (export_index, node_ids) in raw_refs.into_iter().enumerate() {
        let mut refs = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            refs.push(resolve_ref(node_id, &imported_nodes, &exports)?);
        }
        exports[export_index].refs = refs;
    }

    let packet_count = reader.varint_usize(u16::MAX as usize + 1, "packet count")?;
    let mut packets = Vec::with_capacity(packet_count);
    let mut encoded_offset = 0usize;
    for _ in 0..packet_count {
        let encoded_length = reader.varint_usize(u32::MAX as usize, "encoded length")?;
        let decoded_length = reader.varint_usize(u32::MAX as usize, "decoded length")?;
        packets.push(BundlePacket {
            compression,
            encoded_offset: to_u32(encoded_offset, "packet offset")?,
            encoded_length: encoded_length as u32,
            decoded_length: decoded_length as u32,
        });
        encoded_offset += encoded_length;
    }

    if !reader.is_empty() {
        return Err(BundleError::corrupt(
            SECTION,
            format!("{} trailing bytes", reader.remaining()),
        ));
    }

    assign_packets(&mut exports, &packets)?;
    debug!(
        version = ?version,
        exports = exports.len(),
        packets = packets.len(),
        "transcoded legacy bundle header"
    );
    Ok(BundleHeader::create(types, imports, exports, packets))
}

fn resolve_ref(
    node_id: usize,
    imported: &[ImportEntry],
    exports: &[BundleExport],
) -> BundleResult<BundleExportRef> {
    if let Some(entry) = imported.get(node_id) {
        return Ok(BundleExportRef::imported(
            entry.import_index,
            entry.node_index,
            entry.hash,
        ));
    }
    let local = node_id - imported.len();
    let export = exports.get(local).ok_or_else(|| {
        BundleError::corrupt(
            SECTION,
            format!(
                "ref to node {node_id}, only {} nodes exist",
                imported.len() + exports.len()
            ),
        )
    })?;
    Ok(BundleExportRef::local(local as u16, export.hash))
}

/// Place exports into packets in order, moving to the next packet whenever
/// the current one cannot hold the whole export.
fn assign_packets(exports: &mut [BundleExport], packets: &[BundlePacket]) -> BundleResult<()> {
    let mut packet_index = 0usize;
    let mut offset = 0u64;
    for export in exports.iter_mut() {
        let length = export.length as u64;
        while packet_index < packets.len()
            && offset + length > packets[packet_index].decoded_length as u64
        {
            packet_index += 1;
            offset = 0;
        }
        if packet_index >= packets.len() {
            return Err(BundleError::corrupt(
                SECTION,
                format!("export {} does not fit in any packet", export.hash.short_hex()),
            ));
        }
        export.packet_index = packet_index as u16;
        export.offset = offset as u32;
        offset += length;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_varint;

    fn put_string(buf: &mut Vec<u8>, s: &str) {
        encode_varint(buf, s.len() as u64);
        buf.extend_from_slice(s.as_bytes());
    }

    /// Encode `header` in the legacy layout. Exports must already be packed
    /// back to back and every packet must use the same compression.
    fn encode_legacy(header: &BundleHeader, version: BundleVersion) -> Vec<u8> {
        let mut payload = Vec::new();
        encode_varint(&mut payload, version as u64);
        let compression = header
            .packets
            .first()
            .map(|p| p.compression)
            .unwrap_or(BundleCompressionFormat::None);
        encode_varint(&mut payload, compression.as_u32() as u64);

        encode_varint(&mut payload, header.types.len() as u64);
        for blob_type in &header.types {
            payload.extend_from_slice(blob_type.guid.as_bytes());
            encode_varint(&mut payload, blob_type.version as u64);
        }

        // Flattened imported node ids, in first-use order per import.
        let mut entries: Vec<Vec<(u16, ContentHash)>> = vec![Vec::new(); header.imports.len()];
        for export in &header.exports {
            for r in export.refs.iter().filter(|r| !r.is_local()) {
                let list = &mut entries[r.import().unwrap()];
                if !list.iter().any(|(n, _)| *n == r.node_index) {
                    list.push((r.node_index, r.hash));
                }
            }
        }
        encode_varint(&mut payload, header.imports.len() as u64);
        for (import, list) in header.imports.iter().zip(&entries) {
            put_string(&mut payload, import.as_str());
            encode_varint(&mut payload, list.len() as u64);
            for (node_index, hash) in list {
                if version >= BundleVersion::ImportHashes {
                    payload.extend_from_slice(hash.as_bytes());
                    encode_varint(&mut payload, 0);
                }
                encode_varint(&mut payload, *node_index as u64);
            }
        }
        let imported_total: usize = entries.iter().map(Vec::len).sum();
        let node_id = |r: &BundleExportRef| -> u64 {
            match r.import() {
                None => (imported_total + r.node_index as usize) as u64,
                Some(import) => {
                    let before: usize = entries[..import].iter().map(Vec::len).sum();
                    let within = entries[import]
                        .iter()
                        .position(|(n, _)| *n == r.node_index)
                        .unwrap();
                    (before + within) as u64
                }
            }
        };

        encode_varint(&mut payload, header.exports.len() as u64);
        for export in &header.exports {
            encode_varint(&mut payload, export.type_index as u64);
            payload.extend_from_slice(export.hash.as_bytes());
            encode_varint(&mut payload, export.length as u64);
            if version == BundleVersion::ExportAliases {
                put_string(&mut payload, "alias");
            }
            encode_varint(&mut payload, export.refs.len() as u64);
            for r in &export.refs {
                encode_varint(&mut payload, node_id(r));
            }
        }

        encode_varint(&mut payload, header.packets.len() as u64);
        for packet in &header.packets {
            encode_varint(&mut payload, packet.encoded_length as u64);
            encode_varint(&mut payload, packet.decoded_length as u64);
        }

        let mut out = LEGACY_SIGNATURE.to_vec();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn packed_header() -> BundleHeader {
        let leaf = ContentHash::compute(b"leaf");
        let remote = ContentHash::compute(b"remote");
        let exports = vec![
            BundleExport {
                type_index: 0,
                hash: leaf,
                packet_index: 0,
                offset: 0,
                length: 60,
                refs: vec![],
            },
            BundleExport {
                type_index: 0,
                hash: ContentHash::compute(b"middle"),
                packet_index: 0,
                offset: 60,
                length: 40,
                refs: vec![BundleExportRef::imported(0, 3, remote)],
            },
            // Does not fit the 30 bytes left in packet 0.
            BundleExport {
                type_index: 1,
                hash: ContentHash::compute(b"root"),
                packet_index: 1,
                offset: 0,
                length: 50,
                refs: vec![
                    BundleExportRef::local(0, leaf),
                    BundleExportRef::imported(0, 3, remote),
                    BundleExportRef::imported(1, 0, ContentHash::compute(b"other")),
                ],
            },
        ];
        let packets = vec![
            BundlePacket {
                compression: BundleCompressionFormat::Lz4,
                encoded_offset: 0,
                encoded_length: 70,
                decoded_length: 130,
            },
            BundlePacket {
                compression: BundleCompressionFormat::Lz4,
                encoded_offset: 70,
                encoded_length: 45,
                decoded_length: 50,
            },
        ];
        BundleHeader::create(
            vec![BlobType::from_u128(7, 1), BlobType::from_u128(8, 2)],
            vec![
                BlobLocator::new("bundles/a").unwrap(),
                BlobLocator::new("bundles/b").unwrap(),
            ],
            exports,
            packets,
        )
    }

    #[test]
    fn latest_legacy_matches_current() {
        let header = packed_header();
        let legacy = encode_legacy(&header, BundleVersion::LATEST_LEGACY);
        assert_eq!(BundleHeader::header_length(&legacy).unwrap(), legacy.len());
        assert_eq!(BundleHeader::read(&legacy).unwrap(), header);
    }

    #[test]
    fn transcoded_header_survives_current_roundtrip() {
        let header = packed_header();
        let legacy = encode_legacy(&header, BundleVersion::LATEST_LEGACY);
        let decoded = BundleHeader::read(&legacy).unwrap();
        let current = decoded.to_bytes().unwrap();
        assert_eq!(BundleHeader::read(&current).unwrap(), header);
    }

    #[test]
    fn export_aliases_are_skipped() {
        let header = packed_header();
        let legacy = encode_legacy(&header, BundleVersion::ExportAliases);
        let decoded = BundleHeader::read(&legacy).unwrap();
        assert_eq!(decoded.exports.len(), 3);
        assert_eq!(decoded.exports[2].refs[0], header.exports[2].refs[0]);
    }

    #[test]
    fn versions_without_import_hashes_use_zero_hash() {
        for version in [
            BundleVersion::Initial,
            BundleVersion::ExportAliases,
            BundleVersion::RemoveAliases,
        ] {
            let header = packed_header();
            let decoded = BundleHeader::read(&encode_legacy(&header, version)).unwrap();
            let refs = &decoded.exports[2].refs;
            assert_eq!(refs[0].hash, header.exports[2].refs[0].hash, "{version:?}");
            assert_eq!(refs[1].hash, ContentHash::ZERO, "{version:?}");
            assert_eq!(refs[1].node_index, 3);
            assert_eq!(refs[2].import(), Some(1));
            assert_eq!(decoded.exports[2].packet_index, 1);
        }
    }

    #[test]
    fn trailing_packet_data_is_ignored() {
        let header = packed_header();
        let mut legacy = encode_legacy(&header, BundleVersion::LATEST_LEGACY);
        legacy.extend_from_slice(&[0u8; 115]);
        assert_eq!(BundleHeader::read(&legacy).unwrap(), header);
    }

    #[test]
    fn newer_version_rejected() {
        let mut payload = Vec::new();
        encode_varint(&mut payload, BundleVersion::Sections as u64);
        let mut legacy = LEGACY_SIGNATURE.to_vec();
        legacy.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        legacy.extend_from_slice(&payload);
        assert!(matches!(
            BundleHeader::read(&legacy).unwrap_err(),
            BundleError::UnsupportedVersion(4)
        ));
    }

    #[test]
    fn export_without_packet_rejected() {
        let mut header = packed_header();
        header.packets.truncate(1);
        let legacy = encode_legacy(&header, BundleVersion::LATEST_LEGACY);
        assert!(matches!(
            BundleHeader::read(&legacy).unwrap_err(),
            BundleError::CorruptSection { .. }
        ));
    }

    #[test]
    fn dangling_ref_rejected() {
        let mut header = packed_header();
        header.exports[0].refs.push(BundleExportRef::local(9, ContentHash::ZERO));
        let legacy = encode_legacy(&header, BundleVersion::LATEST_LEGACY);
        assert!(matches!(
            BundleHeader::read(&legacy).unwrap_err(),
            BundleError::CorruptSection { .. }
        ));
    }
}
