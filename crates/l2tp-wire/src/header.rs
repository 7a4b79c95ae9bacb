//! L2TPv2 packet headers (RFC 2661 section 3.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |T|L|x|x|S|x|O|P|x|x|x|x|  Ver  |          Length (opt)         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Tunnel ID           |           Session ID          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             Ns (opt)          |             Nr (opt)          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Control messages always carry T, L and S; data messages here are
//! sent with the minimal six-byte header.

use crate::error::{Result, WireError};
use crate::reader::ByteReader;

/// Type bit: 1 = control message, 0 = data message.
pub const FLAG_TYPE: u16 = 0x8000;
/// Length bit: length field present.
pub const FLAG_LENGTH: u16 = 0x4000;
/// Sequence bit: Ns and Nr fields present.
pub const FLAG_SEQUENCE: u16 = 0x0800;
/// Offset bit: offset size field present.
pub const FLAG_OFFSET: u16 = 0x0200;
/// Priority bit.
pub const FLAG_PRIORITY: u16 = 0x0100;
/// Version mask (low four bits).
pub const VERSION_MASK: u16 = 0x000F;
/// Bits that must be zero on the wire.
pub const RESERVED_MASK: u16 =
    !(FLAG_TYPE | FLAG_LENGTH | FLAG_SEQUENCE | FLAG_OFFSET | FLAG_PRIORITY | VERSION_MASK);

/// Protocol version carried in the low bits of the flags word.
pub const PROTOCOL_VERSION: u16 = 2;

/// Flags word of every control message we emit: T, L, S, version 2.
pub const CONTROL_FLAGS: u16 = FLAG_TYPE | FLAG_LENGTH | FLAG_SEQUENCE | PROTOCOL_VERSION;
/// Flags word of every data message we emit: version 2 only.
pub const DATA_FLAGS: u16 = PROTOCOL_VERSION;

/// Size of the full control header (flags, length, ids, Ns, Nr).
pub const CONTROL_HEADER_LEN: usize = 12;
/// Size of the minimal data header (flags, ids).
pub const DATA_HEADER_LEN: usize = 6;

/// Byte offset of the Ns field within an encoded control message.
const NS_OFFSET: usize = 8;
/// Byte offset of the Nr field within an encoded control message.
const NR_OFFSET: usize = 10;

/// Parsed header of an L2TPv2 control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub tunnel_id: u16,
    pub session_id: u16,
    pub ns: u16,
    pub nr: u16,
}

/// Parsed header of an L2TPv2 data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub tunnel_id: u16,
    pub session_id: u16,
}

/// One datagram split into its header and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPacket<'a> {
    /// Control message: body holds the AVP list, `trailing` any bytes
    /// past the declared length (a following message in the datagram).
    Control {
        header: ControlHeader,
        body: &'a [u8],
        trailing: &'a [u8],
    },
    /// Data message: body is a PPP frame.
    Data { header: DataHeader, body: &'a [u8] },
}

/// Splits one L2TPv2 packet off the front of a datagram.
///
/// Validates the flags/version word: version must be 2, reserved bits
/// must be clear, and control messages must carry L and S and must not
/// carry O.
pub fn parse_packet(buf: &[u8]) -> Result<RawPacket<'_>> {
    let mut r = ByteReader::new(buf);
    let flags = r.read_u16()?;

    let version = (flags & VERSION_MASK) as u8;
    if version != PROTOCOL_VERSION as u8 {
        return Err(WireError::BadVersion(version));
    }
    if flags & RESERVED_MASK != 0 {
        return Err(WireError::BadFlags(flags));
    }

    if flags & FLAG_TYPE != 0 {
        // Control: L and S are required, O is forbidden.
        if flags & FLAG_LENGTH == 0 || flags & FLAG_SEQUENCE == 0 || flags & FLAG_OFFSET != 0 {
            return Err(WireError::BadFlags(flags));
        }
        let length = r.read_u16()? as usize;
        let tunnel_id = r.read_u16()?;
        let session_id = r.read_u16()?;
        let ns = r.read_u16()?;
        let nr = r.read_u16()?;

        if length < CONTROL_HEADER_LEN || length > buf.len() {
            return Err(WireError::Truncated {
                needed: length.max(CONTROL_HEADER_LEN),
                have: buf.len(),
            });
        }

        Ok(RawPacket::Control {
            header: ControlHeader {
                tunnel_id,
                session_id,
                ns,
                nr,
            },
            body: &buf[CONTROL_HEADER_LEN..length],
            trailing: &buf[length..],
        })
    } else {
        // Data: optional fields are parsed and skipped.
        let length = if flags & FLAG_LENGTH != 0 {
            Some(r.read_u16()? as usize)
        } else {
            None
        };
        let tunnel_id = r.read_u16()?;
        let session_id = r.read_u16()?;
        if flags & FLAG_SEQUENCE != 0 {
            r.read_u16()?;
            r.read_u16()?;
        }
        if flags & FLAG_OFFSET != 0 {
            let pad = r.read_u16()? as usize;
            r.take(pad)?;
        }

        let body = match length {
            Some(len) => {
                if len < r.position() || len > buf.len() {
                    return Err(WireError::Truncated {
                        needed: len,
                        have: buf.len(),
                    });
                }
                &buf[r.position()..len]
            }
            None => r.rest(),
        };

        Ok(RawPacket::Data {
            header: DataHeader {
                tunnel_id,
                session_id,
            },
            body,
        })
    }
}

/// Encodes a control header followed by `body`, with the length field
/// filled in. Ns/Nr are written as given; the transport patches them
/// at transmit time via [`patch_sequence`].
pub fn encode_control(header: &ControlHeader, body: &[u8]) -> Vec<u8> {
    let total = CONTROL_HEADER_LEN + body.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&CONTROL_FLAGS.to_be_bytes());
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&header.tunnel_id.to_be_bytes());
    out.extend_from_slice(&header.session_id.to_be_bytes());
    out.extend_from_slice(&header.ns.to_be_bytes());
    out.extend_from_slice(&header.nr.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Encodes a minimal data header followed by `body`.
pub fn encode_data(header: &DataHeader, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DATA_HEADER_LEN + body.len());
    out.extend_from_slice(&DATA_FLAGS.to_be_bytes());
    out.extend_from_slice(&header.tunnel_id.to_be_bytes());
    out.extend_from_slice(&header.session_id.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Rewrites the Ns/Nr fields of an already encoded control message.
///
/// The buffer must start with a full control header as produced by
/// [`encode_control`].
pub fn patch_sequence(buf: &mut [u8], ns: u16, nr: u16) {
    buf[NS_OFFSET..NS_OFFSET + 2].copy_from_slice(&ns.to_be_bytes());
    buf[NR_OFFSET..NR_OFFSET + 2].copy_from_slice(&nr.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_roundtrip() {
        let header = ControlHeader {
            tunnel_id: 0x4567,
            session_id: 0,
            ns: 3,
            nr: 7,
        };
        let body = [0xAA, 0xBB, 0xCC];
        let encoded = encode_control(&header, &body);
        assert_eq!(encoded.len(), CONTROL_HEADER_LEN + 3);

        match parse_packet(&encoded).unwrap() {
            RawPacket::Control {
                header: parsed,
                body: parsed_body,
                trailing,
            } => {
                assert_eq!(parsed, header);
                assert_eq!(parsed_body, &body);
                assert!(trailing.is_empty());
            }
            other => panic!("expected control packet, got {:?}", other),
        }
    }

    #[test]
    fn test_data_roundtrip() {
        let header = DataHeader {
            tunnel_id: 0x0123,
            session_id: 0x0A0A,
        };
        let encoded = encode_data(&header, &[0xFF, 0x03, 0x00, 0x21]);

        match parse_packet(&encoded).unwrap() {
            RawPacket::Data {
                header: parsed,
                body,
            } => {
                assert_eq!(parsed, header);
                assert_eq!(body, &[0xFF, 0x03, 0x00, 0x21]);
            }
            other => panic!("expected data packet, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_version_rejected() {
        // Version 3 in the flags word.
        let buf = [0xC8, 0x03, 0x00, 0x0C, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(parse_packet(&buf).unwrap_err(), WireError::BadVersion(3));
    }

    #[test]
    fn test_reserved_bits_rejected() {
        let flags = CONTROL_FLAGS | 0x1000;
        let mut buf = vec![0u8; CONTROL_HEADER_LEN];
        buf[..2].copy_from_slice(&flags.to_be_bytes());
        buf[2..4].copy_from_slice(&(CONTROL_HEADER_LEN as u16).to_be_bytes());
        assert!(matches!(
            parse_packet(&buf).unwrap_err(),
            WireError::BadFlags(_)
        ));
    }

    #[test]
    fn test_control_without_sequence_rejected() {
        // T and L set but S missing.
        let flags = FLAG_TYPE | FLAG_LENGTH | PROTOCOL_VERSION;
        let mut buf = vec![0u8; CONTROL_HEADER_LEN];
        buf[..2].copy_from_slice(&flags.to_be_bytes());
        assert!(matches!(
            parse_packet(&buf).unwrap_err(),
            WireError::BadFlags(_)
        ));
    }

    #[test]
    fn test_declared_length_beyond_buffer() {
        let header = ControlHeader {
            tunnel_id: 1,
            session_id: 0,
            ns: 0,
            nr: 0,
        };
        let mut encoded = encode_control(&header, &[1, 2, 3, 4]);
        encoded.truncate(CONTROL_HEADER_LEN + 2);
        assert!(matches!(
            parse_packet(&encoded).unwrap_err(),
            WireError::Truncated { .. }
        ));
    }

    #[test]
    fn test_patch_sequence() {
        let header = ControlHeader {
            tunnel_id: 1,
            session_id: 0,
            ns: 0,
            nr: 0,
        };
        let mut encoded = encode_control(&header, &[]);
        patch_sequence(&mut encoded, 0x1234, 0x5678);

        match parse_packet(&encoded).unwrap() {
            RawPacket::Control { header, .. } => {
                assert_eq!(header.ns, 0x1234);
                assert_eq!(header.nr, 0x5678);
            }
            other => panic!("expected control packet, got {:?}", other),
        }
    }

    #[test]
    fn test_data_with_offset_pad() {
        let flags = DATA_FLAGS | FLAG_OFFSET;
        let mut buf = Vec::new();
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // tunnel id
        buf.extend_from_slice(&2u16.to_be_bytes()); // session id
        buf.extend_from_slice(&2u16.to_be_bytes()); // offset size
        buf.extend_from_slice(&[0x00, 0x00]); // pad
        buf.extend_from_slice(&[0xFF, 0x03]);

        match parse_packet(&buf).unwrap() {
            RawPacket::Data { body, .. } => assert_eq!(body, &[0xFF, 0x03]),
            other => panic!("expected data packet, got {:?}", other),
        }
    }
}
