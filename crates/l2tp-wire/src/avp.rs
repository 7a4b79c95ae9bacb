//! Attribute-Value Pairs (RFC 2661 section 4.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |M|H| rsvd  |      Length       |           Vendor ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Attribute Type        |        Attribute Value...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt;

use crate::error::{Result, WireError};
use crate::reader::ByteReader;

/// Mandatory bit in the AVP flags/length word.
pub const AVP_FLAG_MANDATORY: u16 = 0x8000;
/// Hidden bit in the AVP flags/length word.
pub const AVP_FLAG_HIDDEN: u16 = 0x4000;
/// Length mask (low ten bits, includes the six header bytes).
pub const AVP_LENGTH_MASK: u16 = 0x03FF;
/// Reserved bits of the flags/length word.
pub const AVP_RESERVED_MASK: u16 = !(AVP_FLAG_MANDATORY | AVP_FLAG_HIDDEN | AVP_LENGTH_MASK);

/// AVP header size in bytes.
pub const AVP_HEADER_LEN: usize = 6;

/// IETF vendor id.
pub const VENDOR_ID_IETF: u16 = 0;

/// IETF attribute types used by L2TPv2 control connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvpType {
    MessageType,
    ResultCode,
    ProtocolVersion,
    FramingCapabilities,
    BearerCapabilities,
    TieBreaker,
    FirmwareRevision,
    HostName,
    VendorName,
    AssignedTunnelId,
    ReceiveWindowSize,
    Challenge,
    ChallengeResponse,
    AssignedSessionId,
    CallSerialNumber,
    BearerType,
    FramingType,
    CalledNumber,
    CallingNumber,
    TxConnectSpeed,
    RxConnectSpeed,
    /// Any attribute this implementation does not interpret.
    Unknown(u16),
}

impl From<u16> for AvpType {
    fn from(value: u16) -> Self {
        match value {
            0 => AvpType::MessageType,
            1 => AvpType::ResultCode,
            2 => AvpType::ProtocolVersion,
            3 => AvpType::FramingCapabilities,
            4 => AvpType::BearerCapabilities,
            5 => AvpType::TieBreaker,
            6 => AvpType::FirmwareRevision,
            7 => AvpType::HostName,
            8 => AvpType::VendorName,
            9 => AvpType::AssignedTunnelId,
            10 => AvpType::ReceiveWindowSize,
            11 => AvpType::Challenge,
            13 => AvpType::ChallengeResponse,
            14 => AvpType::AssignedSessionId,
            15 => AvpType::CallSerialNumber,
            18 => AvpType::BearerType,
            19 => AvpType::FramingType,
            21 => AvpType::CalledNumber,
            22 => AvpType::CallingNumber,
            24 => AvpType::TxConnectSpeed,
            38 => AvpType::RxConnectSpeed,
            v => AvpType::Unknown(v),
        }
    }
}

impl AvpType {
    /// Wire value of the attribute type.
    pub fn as_u16(&self) -> u16 {
        match self {
            AvpType::MessageType => 0,
            AvpType::ResultCode => 1,
            AvpType::ProtocolVersion => 2,
            AvpType::FramingCapabilities => 3,
            AvpType::BearerCapabilities => 4,
            AvpType::TieBreaker => 5,
            AvpType::FirmwareRevision => 6,
            AvpType::HostName => 7,
            AvpType::VendorName => 8,
            AvpType::AssignedTunnelId => 9,
            AvpType::ReceiveWindowSize => 10,
            AvpType::Challenge => 11,
            AvpType::ChallengeResponse => 13,
            AvpType::AssignedSessionId => 14,
            AvpType::CallSerialNumber => 15,
            AvpType::BearerType => 18,
            AvpType::FramingType => 19,
            AvpType::CalledNumber => 21,
            AvpType::CallingNumber => 22,
            AvpType::TxConnectSpeed => 24,
            AvpType::RxConnectSpeed => 38,
            AvpType::Unknown(v) => *v,
        }
    }
}

/// A single decoded AVP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avp {
    pub mandatory: bool,
    pub vendor_id: u16,
    pub attribute: AvpType,
    pub value: Vec<u8>,
}

impl Avp {
    /// Creates a mandatory IETF AVP from raw value bytes.
    pub fn new(attribute: AvpType, value: Vec<u8>) -> Self {
        Self {
            mandatory: true,
            vendor_id: VENDOR_ID_IETF,
            attribute,
            value,
        }
    }

    /// Creates a non-mandatory IETF AVP from raw value bytes.
    pub fn optional(attribute: AvpType, value: Vec<u8>) -> Self {
        Self {
            mandatory: false,
            ..Self::new(attribute, value)
        }
    }

    /// Creates a mandatory AVP holding a 16-bit value.
    pub fn from_u16(attribute: AvpType, value: u16) -> Self {
        Self::new(attribute, value.to_be_bytes().to_vec())
    }

    /// Creates a mandatory AVP holding a 32-bit value.
    pub fn from_u32(attribute: AvpType, value: u32) -> Self {
        Self::new(attribute, value.to_be_bytes().to_vec())
    }

    /// Creates a mandatory AVP holding a UTF-8 string.
    pub fn from_string(attribute: AvpType, value: &str) -> Self {
        Self::new(attribute, value.as_bytes().to_vec())
    }

    /// Interprets the value as a 16-bit integer.
    pub fn as_u16(&self) -> Result<u16> {
        let bytes: [u8; 2] = self
            .value
            .as_slice()
            .try_into()
            .map_err(|_| self.bad_len("u16"))?;
        Ok(u16::from_be_bytes(bytes))
    }

    /// Interprets the value as a 32-bit integer.
    pub fn as_u32(&self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .value
            .as_slice()
            .try_into()
            .map_err(|_| self.bad_len("u32"))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Interprets the value as a 64-bit integer.
    pub fn as_u64(&self) -> Result<u64> {
        let bytes: [u8; 8] = self
            .value
            .as_slice()
            .try_into()
            .map_err(|_| self.bad_len("u64"))?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Interprets the value as a UTF-8 string (lossy).
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }

    fn bad_len(&self, wanted: &str) -> WireError {
        WireError::BadAvp(format!(
            "attribute {} value length {} (wanted {})",
            self.attribute.as_u16(),
            self.value.len(),
            wanted
        ))
    }
}

/// Parses an AVP list from a control-message body.
///
/// Unknown attributes without the mandatory bit are kept (callers skip
/// them); an unknown attribute with the mandatory bit fails with
/// [`WireError::MandatoryUnknownAvp`] so the connection can be shut
/// down per RFC 2661 section 4.1.
pub fn parse_avps(buf: &[u8]) -> Result<Vec<Avp>> {
    let mut r = ByteReader::new(buf);
    let mut avps = Vec::new();

    while r.remaining() > 0 {
        let flags_len = r.read_u16()?;
        if flags_len & AVP_RESERVED_MASK != 0 {
            return Err(WireError::BadAvp(format!(
                "reserved flag bits set: 0x{flags_len:04x}"
            )));
        }

        let length = (flags_len & AVP_LENGTH_MASK) as usize;
        if length < AVP_HEADER_LEN {
            return Err(WireError::BadAvp(format!("length {length} below minimum")));
        }

        let vendor_id = r.read_u16()?;
        let attribute_raw = r.read_u16()?;
        let value = r.take(length - AVP_HEADER_LEN).map_err(|_| {
            WireError::BadAvp(format!(
                "length {length} exceeds remaining body ({})",
                buf.len()
            ))
        })?;

        let mandatory = flags_len & AVP_FLAG_MANDATORY != 0;
        let hidden = flags_len & AVP_FLAG_HIDDEN != 0;
        if hidden {
            // Hiding requires a shared tunnel secret, which this
            // implementation does not carry.
            return Err(WireError::BadAvp(format!(
                "hidden AVP (attribute {attribute_raw}) not supported"
            )));
        }

        let attribute = if vendor_id == VENDOR_ID_IETF {
            AvpType::from(attribute_raw)
        } else {
            AvpType::Unknown(attribute_raw)
        };

        if mandatory && matches!(attribute, AvpType::Unknown(_)) {
            return Err(WireError::MandatoryUnknownAvp {
                vendor_id,
                attribute: attribute_raw,
            });
        }

        avps.push(Avp {
            mandatory,
            vendor_id,
            attribute,
            value: value.to_vec(),
        });
    }

    Ok(avps)
}

/// Encodes an AVP list.
pub fn encode_avps(avps: &[Avp]) -> Vec<u8> {
    let mut out = Vec::new();
    for avp in avps {
        let length = (AVP_HEADER_LEN + avp.value.len()) as u16 & AVP_LENGTH_MASK;
        let mut flags_len = length;
        if avp.mandatory {
            flags_len |= AVP_FLAG_MANDATORY;
        }
        out.extend_from_slice(&flags_len.to_be_bytes());
        out.extend_from_slice(&avp.vendor_id.to_be_bytes());
        out.extend_from_slice(&avp.attribute.as_u16().to_be_bytes());
        out.extend_from_slice(&avp.value);
    }
    out
}

/// Looks up the first AVP with the given IETF attribute type.
pub fn find_avp<'a>(avps: &'a [Avp], attribute: AvpType) -> Option<&'a Avp> {
    avps.iter()
        .find(|a| a.vendor_id == VENDOR_ID_IETF && a.attribute == attribute)
}

// ============================================================================
// Result codes
// ============================================================================

/// CDN result codes.
pub mod cdn_result {
    pub const RESERVED: u16 = 1;
    pub const LOST_CARRIER: u16 = 2;
    pub const GENERAL_ERROR: u16 = 3;
    pub const ADMIN_DISCONNECT: u16 = 4;
    pub const NO_RESOURCES: u16 = 5;
    pub const NOT_AVAILABLE: u16 = 6;
    pub const INVALID_DESTINATION: u16 = 7;
    pub const NO_ANSWER: u16 = 8;
    pub const BUSY: u16 = 9;
    pub const NO_DIAL_TONE: u16 = 10;
    pub const TIMEOUT: u16 = 11;
    pub const BAD_TRANSPORT: u16 = 12;
}

/// StopCCN result codes (RFC 2661 section 4.4.2).
pub mod stopccn_result {
    pub const CLEAR_CONNECTION: u16 = 1;
    pub const GENERAL_ERROR: u16 = 2;
    pub const CHANNEL_EXISTS: u16 = 3;
    pub const NOT_AUTHORIZED: u16 = 4;
    pub const BAD_PROTOCOL_VERSION: u16 = 5;
    pub const BEING_SHUT_DOWN: u16 = 6;
    pub const FSM_ERROR: u16 = 7;
}

/// Error codes carried in the Result Code AVP.
pub mod error_code {
    pub const NO_ERROR: u16 = 0;
    pub const NO_CONTROL_CONNECTION: u16 = 1;
    pub const BAD_LENGTH: u16 = 2;
    pub const VENDOR_SPECIFIC: u16 = 3;
    pub const NO_RESOURCE: u16 = 4;
    pub const INVALID_SESSION_ID: u16 = 5;
    pub const BAD_VALUE: u16 = 6;
    pub const TRY_ANOTHER: u16 = 7;
    pub const MBIT_SHUTDOWN: u16 = 8;
}

/// Result Code AVP payload: a result, an optional error code and an
/// optional human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultCode {
    pub result: u16,
    pub error: u16,
    pub message: String,
}

impl ResultCode {
    /// Result with no error code or message.
    pub fn new(result: u16) -> Self {
        Self {
            result,
            error: error_code::NO_ERROR,
            message: String::new(),
        }
    }

    /// Result with an error code and message.
    pub fn with_error(result: u16, error: u16, message: impl Into<String>) -> Self {
        Self {
            result,
            error,
            message: message.into(),
        }
    }

    /// Decodes a Result Code AVP value. Error code and message are
    /// optional on the wire.
    pub fn decode(value: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(value);
        let result = r.read_u16()?;
        let error = if r.remaining() >= 2 { r.read_u16()? } else { 0 };
        let message = String::from_utf8_lossy(r.rest()).into_owned();
        Ok(Self {
            result,
            error,
            message,
        })
    }

    /// Encodes the Result Code AVP value.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.message.len());
        out.extend_from_slice(&self.result.to_be_bytes());
        out.extend_from_slice(&self.error.to_be_bytes());
        out.extend_from_slice(self.message.as_bytes());
        out
    }

    fn cdn_result_str(&self) -> &'static str {
        match self.result {
            cdn_result::RESERVED => "reserved",
            cdn_result::LOST_CARRIER => "lost carrier",
            cdn_result::GENERAL_ERROR => "general error",
            cdn_result::ADMIN_DISCONNECT => "admin disconnect",
            cdn_result::NO_RESOURCES => "temporary lack of resources",
            cdn_result::NOT_AVAILABLE => "permanent lack of resources",
            cdn_result::INVALID_DESTINATION => "invalid destination",
            cdn_result::NO_ANSWER => "not carrier detected",
            cdn_result::BUSY => "busy signal detected",
            cdn_result::NO_DIAL_TONE => "no dial tone",
            cdn_result::TIMEOUT => "establish timeout",
            cdn_result::BAD_TRANSPORT => "no appropriate framing detected",
            _ => "unknown",
        }
    }

    fn stopccn_result_str(&self) -> &'static str {
        match self.result {
            stopccn_result::CLEAR_CONNECTION => "general request to clear control connection",
            stopccn_result::GENERAL_ERROR => "general error",
            stopccn_result::CHANNEL_EXISTS => "control channel already exists",
            stopccn_result::NOT_AUTHORIZED => "requester is not authorized",
            stopccn_result::BAD_PROTOCOL_VERSION => "protocol version not supported",
            stopccn_result::BEING_SHUT_DOWN => "requester is being shut down",
            stopccn_result::FSM_ERROR => "finite state machine error",
            _ => "unknown",
        }
    }

    fn error_str(&self) -> &'static str {
        match self.error {
            error_code::NO_ERROR => "no general error",
            error_code::NO_CONTROL_CONNECTION => "no control connection exists yet",
            error_code::BAD_LENGTH => "length is wrong",
            error_code::VENDOR_SPECIFIC => "generic vendor-specific error",
            error_code::NO_RESOURCE => "insufficient resources to handle this operation now",
            error_code::INVALID_SESSION_ID => "session ID invalid in this context",
            error_code::BAD_VALUE => "field out of range or reserved field was non-zero",
            error_code::TRY_ANOTHER => "try another LNS",
            error_code::MBIT_SHUTDOWN => "shut down due to unknown AVP with the M bit set",
            _ => "unknown",
        }
    }

    fn render(&self, result_str: &str) -> String {
        let message = if self.message.is_empty() {
            "unset"
        } else {
            self.message.as_str()
        };
        format!(
            "result {} ({}), error {} ({}), message '{}'",
            self.result,
            result_str,
            self.error,
            self.error_str(),
            message
        )
    }

    /// Renders the result using the CDN result-code table.
    pub fn cdn_string(&self) -> String {
        self.render(self.cdn_result_str())
    }

    /// Renders the result using the StopCCN result-code table.
    pub fn stopccn_string(&self) -> String {
        self.render(self.stopccn_result_str())
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cdn_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avp_roundtrip() {
        let avps = vec![
            Avp::from_u16(AvpType::MessageType, 1),
            Avp::from_string(AvpType::HostName, "client.local"),
            Avp::from_u32(AvpType::FramingCapabilities, 0x3),
            Avp::optional(AvpType::ReceiveWindowSize, 4u16.to_be_bytes().to_vec()),
        ];

        let encoded = encode_avps(&avps);
        let decoded = parse_avps(&encoded).unwrap();
        assert_eq!(decoded, avps);

        let host = find_avp(&decoded, AvpType::HostName).unwrap();
        assert_eq!(host.as_string(), "client.local");
        assert!(!decoded[3].mandatory);
    }

    #[test]
    fn test_avp_length_below_minimum() {
        // flags/length word declaring 5 bytes.
        let buf = [0x00, 0x05, 0x00, 0x00, 0x00];
        assert!(matches!(
            parse_avps(&buf).unwrap_err(),
            WireError::BadAvp(_)
        ));
    }

    #[test]
    fn test_avp_length_beyond_body() {
        let mut buf = encode_avps(&[Avp::from_u16(AvpType::MessageType, 1)]);
        // Bump the declared length past the end of the body.
        buf[1] += 4;
        assert!(matches!(
            parse_avps(&buf).unwrap_err(),
            WireError::BadAvp(_)
        ));
    }

    #[test]
    fn test_mandatory_unknown_avp() {
        let avp = Avp {
            mandatory: true,
            vendor_id: VENDOR_ID_IETF,
            attribute: AvpType::Unknown(999),
            value: vec![0xAB],
        };
        let encoded = encode_avps(&[avp]);
        assert_eq!(
            parse_avps(&encoded).unwrap_err(),
            WireError::MandatoryUnknownAvp {
                vendor_id: 0,
                attribute: 999,
            }
        );
    }

    #[test]
    fn test_optional_unknown_avp_kept() {
        let avp = Avp {
            mandatory: false,
            vendor_id: VENDOR_ID_IETF,
            attribute: AvpType::Unknown(999),
            value: vec![0xAB],
        };
        let encoded = encode_avps(&[avp.clone()]);
        let decoded = parse_avps(&encoded).unwrap();
        assert_eq!(decoded, vec![avp]);
    }

    #[test]
    fn test_result_code_rendering() {
        let rc = ResultCode::with_error(
            cdn_result::GENERAL_ERROR,
            error_code::BAD_VALUE,
            "xyz",
        );
        assert_eq!(
            rc.cdn_string(),
            "result 3 (general error), error 6 (field out of range or reserved field was \
             non-zero), message 'xyz'"
        );
    }

    #[test]
    fn test_result_code_unset_message() {
        let rc = ResultCode::new(cdn_result::ADMIN_DISCONNECT);
        assert_eq!(
            rc.cdn_string(),
            "result 4 (admin disconnect), error 0 (no general error), message 'unset'"
        );
    }

    #[test]
    fn test_result_code_decode_variants() {
        // Result only.
        let rc = ResultCode::decode(&[0x00, 0x02]).unwrap();
        assert_eq!(rc.result, 2);
        assert_eq!(rc.error, 0);
        assert!(rc.message.is_empty());

        // Result, error and message.
        let full = ResultCode::with_error(3, 6, "xyz");
        let rc = ResultCode::decode(&full.encode()).unwrap();
        assert_eq!(rc, full);
    }
}
