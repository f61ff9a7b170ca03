//! Bundle format for UBN storage.
//!
//! A bundle is one immutable blob holding many content-addressed nodes. It
//! starts with a header describing the nodes and is followed by a data
//! region of independently compressed packets.
//!
//! # Architecture
//!
//! - **Header** ([`BundleHeader`]): types, imports, exports with their
//!   outgoing refs, and packets, written as little-endian sections
//! - **Packets** ([`BundlePacket`]): compressed runs of node bytes, each
//!   decodable on its own
//! - **Legacy headers**: `UEBN` varint headers are read and transcoded to
//!   the current shape; they are never written
//! - **Bundle** ([`Bundle`]): header and packet bytes together, for callers
//!   that hold a whole blob in memory

pub mod bundle;
pub mod compression;
pub mod error;
pub mod header;
pub mod legacy;
mod wire;

pub use bundle::Bundle;
pub use compression::{compress, decompress, BundleCompressionFormat};
pub use error::{BundleError, BundleResult};
pub use header::{
    BundleExport, BundleExportRef, BundleHeader, BundlePacket, BundleVersion, BUNDLE_SIGNATURE,
    MAX_SECTION_LENGTH, PRELUDE_LENGTH,
};
pub use legacy::LEGACY_SIGNATURE;

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ubn_types::{BlobLocator, BlobType, ContentHash};

    #[test]
    fn header_length_from_prefix() {
        let header = BundleHeader::create(
            vec![BlobType::from_u128(42, 1)],
            vec![BlobLocator::new("bundles/dep").unwrap()],
            vec![],
            vec![],
        );
        let bytes = header.to_bytes().unwrap();
        assert_eq!(
            BundleHeader::header_length(&bytes[..PRELUDE_LENGTH]).unwrap(),
            bytes.len()
        );
    }

    #[test]
    fn whole_bundle_with_refs() {
        let leaf = b"leaf node".to_vec();
        let root = b"root node".to_vec();
        let mut decoded = leaf.clone();
        decoded.extend_from_slice(&root);
        let (packet, encoded) =
            BundlePacket::encode(BundleCompressionFormat::Brotli, 0, &decoded).unwrap();

        let leaf_hash = ContentHash::compute(&leaf);
        let exports = vec![
            BundleExport {
                type_index: 0,
                hash: leaf_hash,
                packet_index: 0,
                offset: 0,
                length: leaf.len() as u32,
                refs: vec![],
            },
            BundleExport {
                type_index: 0,
                hash: ContentHash::compute(&root),
                packet_index: 0,
                offset: leaf.len() as u32,
                length: root.len() as u32,
                refs: vec![BundleExportRef::local(0, leaf_hash)],
            },
        ];
        let header =
            BundleHeader::create(vec![BlobType::from_u128(1, 1)], vec![], exports, vec![packet]);
        let bundle = Bundle::new(header, vec![Bytes::from(encoded)]).unwrap();

        let parsed = Bundle::from_bytes(bundle.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.export_data(1).unwrap(), root);
        let r = &parsed.header.exports[1].refs[0];
        assert!(r.is_local());
        assert_eq!(r.hash, leaf_hash);
    }

    #[test]
    fn legacy_signature_is_distinct() {
        assert_ne!(&LEGACY_SIGNATURE[..3], BUNDLE_SIGNATURE);
    }
}
