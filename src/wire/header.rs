// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The 12-byte FMTP packet header (spec.md §3).

use super::flags::PacketFlags;
use crate::error::{Error, Result};

/// Fixed size of the header on the wire, in bytes.
pub const HEADER_LEN: usize = 12;

/// FMTP packet header: product index, byte offset, payload length, flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Product this packet belongs to.
    pub prod_index: u32,
    /// Byte offset into the product (0 for BOP/EOP).
    pub seq_num: u32,
    /// Payload byte count following the header.
    pub payload_len: u16,
    /// Packet-type bit.
    pub flags: PacketFlags,
}

impl PacketHeader {
    pub fn new(prod_index: u32, seq_num: u32, payload_len: u16, flags: PacketFlags) -> Self {
        Self {
            prod_index,
            seq_num,
            payload_len,
            flags,
        }
    }

    /// Encode the header into its 12-byte big-endian wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.prod_index.to_be_bytes());
        buf[4..8].copy_from_slice(&self.seq_num.to_be_bytes());
        buf[8..10].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.bits().to_be_bytes());
        buf
    }

    /// Decode a header from a 12-byte big-endian buffer.
    ///
    /// Rejects buffers shorter than [`HEADER_LEN`] and flag fields that do
    /// not carry exactly one recognized packet-type bit (spec.md §3).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Inval(format!(
                "packet header truncated: {} bytes, need {HEADER_LEN}",
                buf.len()
            )));
        }
        let prod_index = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let seq_num = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let payload_len = u16::from_be_bytes(buf[8..10].try_into().unwrap());
        let raw_flags = u16::from_be_bytes(buf[10..12].try_into().unwrap());
        let flags = PacketFlags::from_wire(raw_flags)
            .ok_or_else(|| Error::Inval(format!("unrecognized packet flags: {raw_flags:#06x}")))?;
        Ok(Self {
            prod_index,
            seq_num,
            payload_len,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_all_fields() {
        let h = PacketHeader::new(0x1234_5678, 2920, 80, PacketFlags::EOP);
        let encoded = h.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        let decoded = PacketHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn bop_header_matches_s1_scenario_bytes() {
        // spec.md §8 S1: BOP(prodIndex=0, payload=00000BB8 0002 0102)
        let h = PacketHeader::new(0, 0, 8, PacketFlags::BOP);
        let encoded = h.encode();
        assert_eq!(
            encoded,
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 8, 0, 0x01]
        );
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let err = PacketHeader::decode(&[0u8; 8]).unwrap_err();
        assert!(matches!(err, Error::Inval(_)));
    }

    #[test]
    fn decode_rejects_unknown_flags() {
        let mut buf = [0u8; HEADER_LEN];
        buf[10..12].copy_from_slice(&0x0800u16.to_be_bytes());
        let err = PacketHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::Inval(_)));
    }
}
