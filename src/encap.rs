// encap.rs - EtherNet/IP encapsulation layer
//
// The 24-byte encapsulation header framing every TCP exchange, the
// command and status numbers, and the Common Packet Format item envelope
// carried by SendRRData/SendUnitData. All integers little-endian.

use bytes::Buf;

use crate::error::{PlcError, Result};

/// Encapsulation header size on the wire.
pub const HEADER_LEN: usize = 24;

/// Largest CIP payload a single unconnected message may carry.
pub const UNCONNECTED_MESSAGE_LIMIT: usize = 504;

/// Encapsulation commands.
pub mod command {
    pub const NOP: u16 = 0x0000;
    pub const LIST_SERVICES: u16 = 0x0004;
    pub const LIST_IDENTITY: u16 = 0x0063;
    pub const LIST_INTERFACES: u16 = 0x0064;
    pub const REGISTER_SESSION: u16 = 0x0065;
    pub const UNREGISTER_SESSION: u16 = 0x0066;
    pub const SEND_RR_DATA: u16 = 0x006F;
    pub const SEND_UNIT_DATA: u16 = 0x0070;
}

/// Encapsulation status words.
pub mod status {
    pub const SUCCESS: u32 = 0x0000;
    pub const INVALID_COMMAND: u32 = 0x0001;
    pub const INCORRECT_DATA: u32 = 0x0003;
}

/// CPF item type codes.
pub mod item {
    pub const NULL_ADDRESS: u16 = 0x0000;
    pub const LIST_IDENTITY_RESPONSE: u16 = 0x000C;
    pub const CONNECTED_ADDRESS: u16 = 0x00A1;
    pub const CONNECTED_DATA: u16 = 0x00B1;
    pub const UNCONNECTED_DATA: u16 = 0x00B2;
    pub const LIST_SERVICES_RESPONSE: u16 = 0x0100;
}

/// The fixed encapsulation header.
///
/// ```text
/// command u16  length u16  sessionHandle u32  status u32
/// senderContext [8]u8      options u32
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncapsulationHeader {
    pub command: u16,
    pub length: u16,
    pub session_handle: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
}

impl EncapsulationHeader {
    pub fn decode(raw: &[u8]) -> Result<EncapsulationHeader> {
        if raw.len() < HEADER_LEN {
            return Err(PlcError::Protocol(
                "encapsulation header shorter than 24 bytes".to_string(),
            ));
        }
        let mut buf = raw;
        let command = buf.get_u16_le();
        let length = buf.get_u16_le();
        let session_handle = buf.get_u32_le();
        let status = buf.get_u32_le();
        let mut sender_context = [0u8; 8];
        buf.copy_to_slice(&mut sender_context);
        let options = buf.get_u32_le();
        Ok(EncapsulationHeader {
            command,
            length,
            session_handle,
            status,
            sender_context,
            options,
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.command.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.session_handle.to_le_bytes());
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&self.sender_context);
        out.extend_from_slice(&self.options.to_le_bytes());
    }
}

/// The 6-byte prefix of a SendRRData/SendUnitData payload.
///
/// ```text
/// interfaceHandle u32 (=0)  timeout u16  itemCount u16
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpfEnvelope {
    pub interface_handle: u32,
    pub timeout: u16,
    pub item_count: u16,
}

impl CpfEnvelope {
    pub fn decode(buf: &mut &[u8]) -> Result<CpfEnvelope> {
        if buf.remaining() < 8 {
            return Err(PlcError::Protocol("truncated CPF envelope".to_string()));
        }
        Ok(CpfEnvelope {
            interface_handle: buf.get_u32_le(),
            timeout: buf.get_u16_le(),
            item_count: buf.get_u16_le(),
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.interface_handle.to_le_bytes());
        out.extend_from_slice(&self.timeout.to_le_bytes());
        out.extend_from_slice(&self.item_count.to_le_bytes());
    }
}

/// One CPF item header followed by its payload, borrowed from the
/// request buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpfItem<'a> {
    pub typ: u16,
    pub data: &'a [u8],
}

impl<'a> CpfItem<'a> {
    /// Reads `{type u16, length u16, data [length]}` off the front of
    /// `buf`, advancing it.
    pub fn decode(buf: &mut &'a [u8]) -> Result<CpfItem<'a>> {
        if buf.remaining() < 4 {
            return Err(PlcError::Protocol("truncated CPF item header".to_string()));
        }
        let typ = buf.get_u16_le();
        let len = buf.get_u16_le() as usize;
        if buf.remaining() < len {
            return Err(PlcError::Protocol("truncated CPF item payload".to_string()));
        }
        let slice: &'a [u8] = buf;
        let (data, rest) = slice.split_at(len);
        *buf = rest;
        Ok(CpfItem { typ, data })
    }
}

/// Appends an item header + payload.
pub fn encode_item(out: &mut Vec<u8>, typ: u16, data: &[u8]) {
    out.extend_from_slice(&typ.to_le_bytes());
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let hdr = EncapsulationHeader {
            command: command::REGISTER_SESSION,
            length: 4,
            session_handle: 0xDEAD_BEEF,
            status: 0,
            sender_context: [1, 2, 3, 4, 5, 6, 7, 8],
            options: 0,
        };
        let mut raw = Vec::new();
        hdr.encode_into(&mut raw);
        assert_eq!(raw.len(), HEADER_LEN);
        assert_eq!(&raw[..2], &[0x65, 0x00]);
        assert_eq!(EncapsulationHeader::decode(&raw).unwrap(), hdr);
    }

    #[test]
    fn test_header_too_short() {
        assert!(EncapsulationHeader::decode(&[0u8; 23]).is_err());
    }

    #[test]
    fn test_cpf_item_decode_advances_buffer() {
        let raw = [
            0xB2, 0x00, 0x03, 0x00, 0xAA, 0xBB, 0xCC, // unconnected data, 3 bytes
            0x00, 0x00, 0x00, 0x00, // null address, 0 bytes
        ];
        let mut buf = &raw[..];
        let first = CpfItem::decode(&mut buf).unwrap();
        assert_eq!(first.typ, item::UNCONNECTED_DATA);
        assert_eq!(first.data, &[0xAA, 0xBB, 0xCC]);
        let second = CpfItem::decode(&mut buf).unwrap();
        assert_eq!(second.typ, item::NULL_ADDRESS);
        assert!(second.data.is_empty());
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_cpf_item_truncated_payload() {
        let raw = [0xB2, 0x00, 0x05, 0x00, 0x01];
        let mut buf = &raw[..];
        assert!(CpfItem::decode(&mut buf).is_err());
    }
}
