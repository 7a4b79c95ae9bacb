//! PPP framing and sub-protocol payloads (RFC 1661, 1332, 1334).
//!
//! A PPP frame inside an L2TP data message is `FF 03` followed by a
//! 16-bit protocol number. LCP, IPCP and PAP payloads share the
//! `{code, identifier, length}` packet header; LCP and IPCP carry TLV
//! option lists, PAP carries length-prefixed credentials.

use crate::error::{Result, WireError};
use crate::reader::ByteReader;

/// PPP address field (all-stations).
pub const PPP_ADDRESS: u8 = 0xFF;
/// PPP control field (unnumbered information).
pub const PPP_CONTROL: u8 = 0x03;

/// PPP protocol numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PppProtocol {
    /// 0x0021: IPv4 datagrams.
    Ipv4,
    /// 0xC021: Link Control Protocol.
    Lcp,
    /// 0xC023: Password Authentication Protocol.
    Pap,
    /// 0x8021: IP Control Protocol.
    Ipcp,
    /// Anything else.
    Other(u16),
}

impl From<u16> for PppProtocol {
    fn from(value: u16) -> Self {
        match value {
            0x0021 => PppProtocol::Ipv4,
            0xC021 => PppProtocol::Lcp,
            0xC023 => PppProtocol::Pap,
            0x8021 => PppProtocol::Ipcp,
            v => PppProtocol::Other(v),
        }
    }
}

impl PppProtocol {
    pub fn as_u16(&self) -> u16 {
        match self {
            PppProtocol::Ipv4 => 0x0021,
            PppProtocol::Lcp => 0xC021,
            PppProtocol::Pap => 0xC023,
            PppProtocol::Ipcp => 0x8021,
            PppProtocol::Other(v) => *v,
        }
    }
}

/// One PPP frame: protocol number plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PppFrame {
    pub protocol: PppProtocol,
    pub payload: Vec<u8>,
}

impl PppFrame {
    pub fn new(protocol: PppProtocol, payload: Vec<u8>) -> Self {
        Self { protocol, payload }
    }

    /// Parses a frame from the body of an L2TP data message.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(buf);
        let address = r.read_u8()?;
        let control = r.read_u8()?;
        if address != PPP_ADDRESS || control != PPP_CONTROL {
            return Err(WireError::BadPpp(format!(
                "bad address/control: {address:02x} {control:02x}"
            )));
        }
        let protocol = PppProtocol::from(r.read_u16()?);
        Ok(Self {
            protocol,
            payload: r.rest().to_vec(),
        })
    }

    /// Encodes the frame for an L2TP data message body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.payload.len());
        out.push(PPP_ADDRESS);
        out.push(PPP_CONTROL);
        out.extend_from_slice(&self.protocol.as_u16().to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// LCP/IPCP control codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpCode {
    ConfigureRequest,
    ConfigureAck,
    ConfigureNak,
    ConfigureReject,
    TerminateRequest,
    TerminateAck,
    CodeReject,
    ProtocolReject,
    EchoRequest,
    EchoReply,
    DiscardRequest,
}

impl CpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => CpCode::ConfigureRequest,
            2 => CpCode::ConfigureAck,
            3 => CpCode::ConfigureNak,
            4 => CpCode::ConfigureReject,
            5 => CpCode::TerminateRequest,
            6 => CpCode::TerminateAck,
            7 => CpCode::CodeReject,
            8 => CpCode::ProtocolReject,
            9 => CpCode::EchoRequest,
            10 => CpCode::EchoReply,
            11 => CpCode::DiscardRequest,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            CpCode::ConfigureRequest => 1,
            CpCode::ConfigureAck => 2,
            CpCode::ConfigureNak => 3,
            CpCode::ConfigureReject => 4,
            CpCode::TerminateRequest => 5,
            CpCode::TerminateAck => 6,
            CpCode::CodeReject => 7,
            CpCode::ProtocolReject => 8,
            CpCode::EchoRequest => 9,
            CpCode::EchoReply => 10,
            CpCode::DiscardRequest => 11,
        }
    }
}

/// PAP codes (RFC 1334).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PapCode {
    AuthenticateRequest,
    AuthenticateAck,
    AuthenticateNak,
}

impl PapCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => PapCode::AuthenticateRequest,
            2 => PapCode::AuthenticateAck,
            3 => PapCode::AuthenticateNak,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            PapCode::AuthenticateRequest => 1,
            PapCode::AuthenticateAck => 2,
            PapCode::AuthenticateNak => 3,
        }
    }
}

/// LCP option types.
pub mod lcp_opt {
    pub const MRU: u8 = 1;
    pub const AUTH_PROTOCOL: u8 = 3;
    pub const QUALITY_PROTOCOL: u8 = 4;
    pub const MAGIC_NUMBER: u8 = 5;
}

/// IPCP option types.
pub mod ipcp_opt {
    pub const IP_ADDRESSES: u8 = 1;
    pub const IP_COMPRESSION: u8 = 2;
    pub const IP_ADDRESS: u8 = 3;
}

/// Authentication-Protocol option value selecting PAP.
pub const AUTH_PROTOCOL_PAP: u16 = 0xC023;

/// Shared `{code, identifier, length}` packet of LCP, IPCP and PAP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PppPacket {
    pub code: u8,
    pub identifier: u8,
    pub body: Vec<u8>,
}

impl PppPacket {
    pub fn new(code: u8, identifier: u8, body: Vec<u8>) -> Self {
        Self {
            code,
            identifier,
            body,
        }
    }

    /// Parses a packet from a PPP frame payload. Bytes past the
    /// declared length (padding) are ignored.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(buf);
        let code = r.read_u8()?;
        let identifier = r.read_u8()?;
        let length = r.read_u16()? as usize;
        if length < 4 || length > buf.len() {
            return Err(WireError::BadPpp(format!(
                "packet length {length} out of range for {} byte payload",
                buf.len()
            )));
        }
        Ok(Self {
            code,
            identifier,
            body: buf[4..length].to_vec(),
        })
    }

    /// Encodes the packet with its length field.
    pub fn encode(&self) -> Vec<u8> {
        let length = (4 + self.body.len()) as u16;
        let mut out = Vec::with_capacity(length as usize);
        out.push(self.code);
        out.push(self.identifier);
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// One TLV option of an LCP or IPCP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PppOption {
    pub kind: u8,
    pub value: Vec<u8>,
}

impl PppOption {
    pub fn new(kind: u8, value: Vec<u8>) -> Self {
        Self { kind, value }
    }

    pub fn from_u16(kind: u8, value: u16) -> Self {
        Self::new(kind, value.to_be_bytes().to_vec())
    }

    pub fn from_u32(kind: u8, value: u32) -> Self {
        Self::new(kind, value.to_be_bytes().to_vec())
    }

    /// Interprets the option value as a 16-bit integer.
    pub fn as_u16(&self) -> Option<u16> {
        self.value
            .as_slice()
            .try_into()
            .ok()
            .map(u16::from_be_bytes)
    }

    /// Interprets the option value as a 32-bit integer.
    pub fn as_u32(&self) -> Option<u32> {
        self.value
            .as_slice()
            .try_into()
            .ok()
            .map(u32::from_be_bytes)
    }
}

/// Parses a TLV option list. An option whose length field is below
/// two or runs past the buffer terminates parsing; options already
/// parsed are returned.
pub fn parse_options(buf: &[u8]) -> Vec<PppOption> {
    let mut options = Vec::new();
    let mut rest = buf;

    while rest.len() >= 2 {
        let kind = rest[0];
        let length = rest[1] as usize;
        if length < 2 || length > rest.len() {
            break;
        }
        options.push(PppOption {
            kind,
            value: rest[2..length].to_vec(),
        });
        rest = &rest[length..];
    }

    options
}

/// Encodes a TLV option list.
pub fn encode_options(options: &[PppOption]) -> Vec<u8> {
    let mut out = Vec::new();
    for opt in options {
        out.push(opt.kind);
        out.push((2 + opt.value.len()) as u8);
        out.extend_from_slice(&opt.value);
    }
    out
}

/// Encodes a PAP Authenticate-Request body: length-prefixed peer id
/// and password.
pub fn encode_pap_request(peer_id: &str, password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + peer_id.len() + password.len());
    out.push(peer_id.len() as u8);
    out.extend_from_slice(peer_id.as_bytes());
    out.push(password.len() as u8);
    out.extend_from_slice(password.as_bytes());
    out
}

/// Decodes a PAP Authenticate-Request body into peer id and password.
pub fn parse_pap_request(body: &[u8]) -> Result<(String, String)> {
    let mut r = ByteReader::new(body);
    let id_len = r.read_u8()? as usize;
    let peer_id = String::from_utf8_lossy(r.take(id_len)?).into_owned();
    let pw_len = r.read_u8()? as usize;
    let password = String::from_utf8_lossy(r.take(pw_len)?).into_owned();
    Ok((peer_id, password))
}

/// Decodes the message of a PAP Authenticate-Ack/Nak body, if any.
pub fn parse_pap_message(body: &[u8]) -> String {
    match body.split_first() {
        Some((&len, rest)) if rest.len() >= len as usize => {
            String::from_utf8_lossy(&rest[..len as usize]).into_owned()
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = PppFrame::new(PppProtocol::Lcp, vec![0x01, 0x01, 0x00, 0x04]);
        let parsed = PppFrame::parse(&frame.encode()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_frame_bad_address() {
        let buf = [0x00, 0x03, 0xC0, 0x21];
        assert!(matches!(
            PppFrame::parse(&buf).unwrap_err(),
            WireError::BadPpp(_)
        ));
    }

    #[test]
    fn test_packet_roundtrip() {
        let options = vec![
            PppOption::from_u16(lcp_opt::MRU, 1400),
            PppOption::from_u32(lcp_opt::MAGIC_NUMBER, 0xDEADBEEF),
            PppOption::from_u16(lcp_opt::AUTH_PROTOCOL, AUTH_PROTOCOL_PAP),
        ];
        let packet = PppPacket::new(
            CpCode::ConfigureRequest.as_u8(),
            0x11,
            encode_options(&options),
        );

        let parsed = PppPacket::parse(&packet.encode()).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parse_options(&parsed.body), options);
    }

    #[test]
    fn test_packet_trailing_padding_ignored() {
        let packet = PppPacket::new(CpCode::EchoRequest.as_u8(), 1, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let mut buf = packet.encode();
        buf.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(PppPacket::parse(&buf).unwrap(), packet);
    }

    #[test]
    fn test_packet_length_below_header() {
        let buf = [0x01, 0x01, 0x00, 0x02];
        assert!(matches!(
            PppPacket::parse(&buf).unwrap_err(),
            WireError::BadPpp(_)
        ));
    }

    #[test]
    fn test_option_roundtrip() {
        let options = vec![
            PppOption::new(ipcp_opt::IP_ADDRESS, vec![10, 1, 2, 3]),
            PppOption::new(0x42, vec![]),
        ];
        assert_eq!(parse_options(&encode_options(&options)), options);
    }

    #[test]
    fn test_short_option_terminates_parsing() {
        let mut buf = encode_options(&[PppOption::from_u16(lcp_opt::MRU, 1500)]);
        // Option with length 1: terminates the list, no error.
        buf.extend_from_slice(&[0x05, 0x01]);
        let options = parse_options(&buf);
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].kind, lcp_opt::MRU);
    }

    #[test]
    fn test_option_overrunning_buffer_terminates_parsing() {
        let buf = [0x05, 0x06, 0x12, 0x34];
        assert!(parse_options(&buf).is_empty());
    }

    #[test]
    fn test_pap_request_roundtrip() {
        let body = encode_pap_request("alice", "s3cret");
        assert_eq!(body[0], 5);
        assert_eq!(body[6], 6);
        let (peer_id, password) = parse_pap_request(&body).unwrap();
        assert_eq!(peer_id, "alice");
        assert_eq!(password, "s3cret");
    }

    #[test]
    fn test_pap_message() {
        let mut body = vec![3];
        body.extend_from_slice(b"bad");
        assert_eq!(parse_pap_message(&body), "bad");
        assert_eq!(parse_pap_message(&[]), "");
    }
}
