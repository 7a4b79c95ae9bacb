//! Error types for the L2TPv2 and PPP codecs.

use thiserror::Error;

/// Errors produced while decoding or encoding wire messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the header or the declared message length.
    #[error("truncated message: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    /// Header version field is not 2.
    #[error("bad protocol version: {0}")]
    BadVersion(u8),

    /// Reserved bits set, or bits required for the message kind missing.
    #[error("bad header flags: 0x{0:04x}")]
    BadFlags(u16),

    /// AVP length out of range or otherwise malformed.
    #[error("bad AVP: {0}")]
    BadAvp(String),

    /// Unrecognised AVP carrying the mandatory bit.
    #[error("unrecognised mandatory AVP: vendor {vendor_id}, attribute {attribute}")]
    MandatoryUnknownAvp { vendor_id: u16, attribute: u16 },

    /// A message type is missing one of its required AVPs.
    #[error("{message_type} missing required {avp} AVP")]
    MissingRequired {
        message_type: &'static str,
        avp: &'static str,
    },

    /// Malformed PPP frame or sub-protocol packet.
    #[error("bad PPP frame: {0}")]
    BadPpp(String),
}

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, WireError>;
