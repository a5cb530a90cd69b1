// epath.rs - CIP EPATH segment parser
//
// Decodes the request path of a CIP message into logical class/instance/
// attribute/element IDs and ANSI extended symbol names. The encode
// direction is spread across the client ecosystem (0x91 symbol segments,
// 0x20/0x24 logical segments, pad bytes on 16/32-bit forms); this is the
// matching decoder with the same layout rules.

use bytes::Buf;

use crate::error::{PlcError, Result};

/// One decoded path segment, in request order.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Class(u16),
    Instance(u32),
    Attribute(u16),
    Element(u32),
    Symbol(String),
}

/// Decoded request path.
///
/// `class`/`instance`/`attribute` carry the last logical segment of each
/// kind; `segments` preserves the full ordered list so the tag services
/// can pair an ANSI symbol with its following element index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPath {
    pub class: Option<u16>,
    pub instance: Option<u32>,
    pub attribute: Option<u16>,
    pub segments: Vec<PathSegment>,
}

impl ParsedPath {
    /// ANSI symbol of the first symbol segment, with the element index of
    /// the segment that immediately follows it (if any).
    pub fn symbol(&self) -> Option<(&str, u32)> {
        let mut it = self.segments.iter();
        while let Some(seg) = it.next() {
            if let PathSegment::Symbol(name) = seg {
                let index = match it.next() {
                    Some(PathSegment::Element(i)) => *i,
                    _ => 0,
                };
                return Some((name, index));
            }
        }
        None
    }
}

fn truncated() -> PlcError {
    PlcError::Protocol("truncated EPATH segment".to_string())
}

/// Parses a raw EPATH (already stripped of its word-count prefix).
pub fn parse_epath(mut buf: &[u8]) -> Result<ParsedPath> {
    let mut path = ParsedPath::default();

    while buf.has_remaining() {
        let seg = buf.get_u8();
        match seg {
            // Logical class, 8/16-bit
            0x20 => {
                if buf.remaining() < 1 {
                    return Err(truncated());
                }
                let id = buf.get_u8() as u16;
                path.class = Some(id);
                path.segments.push(PathSegment::Class(id));
            }
            0x21 => {
                if buf.remaining() < 3 {
                    return Err(truncated());
                }
                buf.advance(1); // pad
                let id = buf.get_u16_le();
                path.class = Some(id);
                path.segments.push(PathSegment::Class(id));
            }
            // Logical instance, 8/16-bit
            0x24 => {
                if buf.remaining() < 1 {
                    return Err(truncated());
                }
                let id = buf.get_u8() as u32;
                path.instance = Some(id);
                path.segments.push(PathSegment::Instance(id));
            }
            0x25 => {
                if buf.remaining() < 3 {
                    return Err(truncated());
                }
                buf.advance(1); // pad
                let id = buf.get_u16_le() as u32;
                path.instance = Some(id);
                path.segments.push(PathSegment::Instance(id));
            }
            // Logical attribute, 8/16-bit
            0x30 => {
                if buf.remaining() < 1 {
                    return Err(truncated());
                }
                let id = buf.get_u8() as u16;
                path.attribute = Some(id);
                path.segments.push(PathSegment::Attribute(id));
            }
            0x31 => {
                if buf.remaining() < 3 {
                    return Err(truncated());
                }
                buf.advance(1); // pad
                let id = buf.get_u16_le();
                path.attribute = Some(id);
                path.segments.push(PathSegment::Attribute(id));
            }
            // Logical element (member index), 8/16/32-bit
            0x28 => {
                if buf.remaining() < 1 {
                    return Err(truncated());
                }
                path.segments.push(PathSegment::Element(buf.get_u8() as u32));
            }
            0x29 => {
                if buf.remaining() < 3 {
                    return Err(truncated());
                }
                buf.advance(1); // pad
                path.segments
                    .push(PathSegment::Element(buf.get_u16_le() as u32));
            }
            0x2A => {
                if buf.remaining() < 5 {
                    return Err(truncated());
                }
                buf.advance(1); // pad
                path.segments.push(PathSegment::Element(buf.get_u32_le()));
            }
            // ANSI extended symbol: 1-byte length, characters, pad to a
            // 16-bit boundary
            0x91 => {
                if buf.remaining() < 1 {
                    return Err(truncated());
                }
                let len = buf.get_u8() as usize;
                if buf.remaining() < len {
                    return Err(truncated());
                }
                // Some originators count a terminating NUL in the segment
                // length instead of padding outside it; strip it so the
                // name matches the stored tag either way.
                let name = String::from_utf8_lossy(&buf[..len])
                    .trim_end_matches('\0')
                    .to_string();
                buf.advance(len);
                if len % 2 != 0 {
                    if !buf.has_remaining() {
                        return Err(truncated());
                    }
                    buf.advance(1); // pad
                }
                path.segments.push(PathSegment::Symbol(name));
            }
            other => {
                return Err(PlcError::Protocol(format!(
                    "unknown EPATH segment type 0x{:02X}",
                    other
                )));
            }
        }
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_class_instance_attribute() {
        // Class 0x6B, instance 2, attribute 1
        let path = parse_epath(&[0x20, 0x6B, 0x24, 0x02, 0x30, 0x01]).unwrap();
        assert_eq!(path.class, Some(0x6B));
        assert_eq!(path.instance, Some(2));
        assert_eq!(path.attribute, Some(1));
        assert_eq!(path.segments.len(), 3);
    }

    #[test]
    fn test_wide_logical_segments() {
        // 16-bit class 0x00AC with pad byte, 16-bit instance 0x0101
        let path = parse_epath(&[0x21, 0x00, 0xAC, 0x00, 0x25, 0x00, 0x01, 0x01]).unwrap();
        assert_eq!(path.class, Some(0x00AC));
        assert_eq!(path.instance, Some(0x0101));
    }

    #[test]
    fn test_ansi_symbol_with_element() {
        // "testINT" padded to 8 bytes, then element 3
        let mut raw = vec![0x91, 0x07];
        raw.extend_from_slice(b"testINT");
        raw.push(0x00); // pad
        raw.extend_from_slice(&[0x28, 0x03]);

        let path = parse_epath(&raw).unwrap();
        assert_eq!(path.symbol(), Some(("testINT", 3)));
    }

    #[test]
    fn test_symbol_with_counted_nul_terminator() {
        // Length 8 covering "testINT" plus a NUL, as some tools encode it
        let mut raw = vec![0x91, 0x08];
        raw.extend_from_slice(b"testINT\0");
        let path = parse_epath(&raw).unwrap();
        assert_eq!(path.symbol(), Some(("testINT", 0)));
    }

    #[test]
    fn test_symbol_without_element_defaults_to_zero() {
        let raw = [0x91, 0x04, b'F', b'l', b'a', b'g'];
        let path = parse_epath(&raw).unwrap();
        assert_eq!(path.symbol(), Some(("Flag", 0)));
    }

    #[test]
    fn test_wide_element_segments() {
        let path = parse_epath(&[0x29, 0x00, 0x34, 0x12]).unwrap();
        assert_eq!(path.segments, vec![PathSegment::Element(0x1234)]);

        let path = parse_epath(&[0x2A, 0x00, 0x78, 0x56, 0x34, 0x12]).unwrap();
        assert_eq!(path.segments, vec![PathSegment::Element(0x12345678)]);
    }

    #[test]
    fn test_truncated_and_unknown_segments_fail() {
        assert!(parse_epath(&[0x20]).is_err());
        assert!(parse_epath(&[0x21, 0x00, 0xAC]).is_err());
        assert!(parse_epath(&[0x91, 0x05, b'a', b'b']).is_err());
        assert!(parse_epath(&[0xE0, 0x00]).is_err());
    }
}
