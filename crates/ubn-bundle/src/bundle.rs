//! In-memory form of a whole bundle blob: header plus encoded packets.

use bytes::{Bytes, BytesMut};

use crate::error::{BundleError, BundleResult};
use crate::header::BundleHeader;

/// A decoded header together with the encoded packet payloads it describes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bundle {
    pub header: BundleHeader,
    /// Encoded packet bytes, parallel to `header.packets`.
    pub packets: Vec<Bytes>,
}

impl Bundle {
    pub fn new(header: BundleHeader, packets: Vec<Bytes>) -> BundleResult<Self> {
        if header.packets.len() != packets.len() {
            return Err(BundleError::corrupt(
                "packets",
                format!(
                    "header lists {} packets, {} supplied",
                    header.packets.len(),
                    packets.len()
                ),
            ));
        }
        for (index, (packet, data)) in header.packets.iter().zip(&packets).enumerate() {
            if packet.encoded_length as usize != data.len() {
                return Err(BundleError::corrupt(
                    "packets",
                    format!(
                        "packet {index} is {} bytes, header says {}",
                        data.len(),
                        packet.encoded_length
                    ),
                ));
            }
        }
        Ok(Self { header, packets })
    }

    /// Serialize the header followed by the packet data region.
    pub fn to_bytes(&self) -> BundleResult<Bytes> {
        let header = self.header.to_bytes()?;
        let data_length = self.header.data_length() as usize;
        let mut out = BytesMut::with_capacity(header.len() + data_length);
        out.extend_from_slice(&header);
        out.resize(header.len() + data_length, 0);
        for (packet, data) in self.header.packets.iter().zip(&self.packets) {
            let start = header.len() + packet.encoded_offset as usize;
            out[start..start + data.len()].copy_from_slice(data);
        }
        Ok(out.freeze())
    }

    /// Parse a complete bundle blob in either header format.
    pub fn from_bytes(data: Bytes) -> BundleResult<Self> {
        let header = BundleHeader::read(&data)?;
        let data_offset = BundleHeader::header_length(&data)?;
        let needed = data_offset + header.data_length() as usize;
        if data.len() < needed {
            return Err(BundleError::Truncated {
                needed,
                actual: data.len(),
            });
        }
        let packets = header
            .packets
            .iter()
            .map(|packet| {
                let start = data_offset + packet.encoded_offset as usize;
                data.slice(start..start + packet.encoded_length as usize)
            })
            .collect();
        Ok(Self { header, packets })
    }

    /// Decompress one packet.
    pub fn decode_packet(&self, index: usize) -> BundleResult<Vec<u8>> {
        let packet = self.header.packets.get(index).ok_or_else(|| {
            BundleError::corrupt("packets", format!("no packet {index}"))
        })?;
        packet.decode(&self.packets[index])
    }

    /// Bytes of one export, decoding its packet.
    pub fn export_data(&self, index: usize) -> BundleResult<Vec<u8>> {
        let export = self.header.exports.get(index).ok_or_else(|| {
            BundleError::corrupt("exports", format!("no export {index}"))
        })?;
        let packet = self.decode_packet(export.packet_index as usize)?;
        let start = export.offset as usize;
        let end = start + export.length as usize;
        if end > packet.len() {
            return Err(BundleError::corrupt(
                "exports",
                format!("export {index} ends at {end}, packet holds {}", packet.len()),
            ));
        }
        Ok(packet[start..end].to_vec())
    }
}
