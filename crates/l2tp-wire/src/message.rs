//! Typed L2TPv2 control messages.
//!
//! Control messages decode into the [`ControlBody`] sum type so state
//! machines can match exhaustively instead of probing AVP lists. Each
//! variant validates its required AVPs on decode and rebuilds the AVP
//! list on encode.

use std::fmt;

use crate::avp::{self, Avp, AvpType, ResultCode};
use crate::error::{Result, WireError};
use crate::header::{self, ControlHeader, DataHeader, RawPacket};

/// Wire values of the control message types (Message Type AVP).
mod msg_type {
    pub const SCCRQ: u16 = 1;
    pub const SCCRP: u16 = 2;
    pub const SCCCN: u16 = 3;
    pub const STOPCCN: u16 = 4;
    pub const HELLO: u16 = 6;
    pub const ICRQ: u16 = 10;
    pub const ICRP: u16 = 11;
    pub const ICCN: u16 = 12;
    pub const CDN: u16 = 14;
}

/// Value of the Protocol Version AVP: version 1, revision 0.
pub const PROTOCOL_VERSION_AVP: u16 = 0x0100;

/// Synchronous framing capability/type bit.
pub const FRAMING_SYNC: u32 = 0x1;
/// Asynchronous framing capability/type bit.
pub const FRAMING_ASYNC: u32 = 0x2;

/// Body of a control message, keyed by message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlBody {
    Sccrq {
        protocol_version: u16,
        host_name: String,
        framing_caps: u32,
        assigned_tunnel_id: u16,
        bearer_caps: Option<u32>,
        receive_window_size: Option<u16>,
        tie_breaker: Option<u64>,
    },
    Sccrp {
        protocol_version: u16,
        host_name: String,
        framing_caps: u32,
        assigned_tunnel_id: u16,
        receive_window_size: Option<u16>,
        challenge: Option<Vec<u8>>,
    },
    Scccn,
    StopCcn {
        assigned_tunnel_id: u16,
        result: ResultCode,
    },
    Hello,
    Icrq {
        assigned_session_id: u16,
        call_serial: u32,
    },
    Icrp {
        assigned_session_id: u16,
    },
    Iccn {
        tx_connect_speed: u32,
        framing_type: u32,
    },
    Cdn {
        assigned_session_id: u16,
        result: ResultCode,
    },
    /// Zero-length body: acknowledgement only.
    Zlb,
}

impl ControlBody {
    /// Short protocol name of the message type.
    pub fn name(&self) -> &'static str {
        match self {
            ControlBody::Sccrq { .. } => "SCCRQ",
            ControlBody::Sccrp { .. } => "SCCRP",
            ControlBody::Scccn => "SCCCN",
            ControlBody::StopCcn { .. } => "StopCCN",
            ControlBody::Hello => "Hello",
            ControlBody::Icrq { .. } => "ICRQ",
            ControlBody::Icrp { .. } => "ICRP",
            ControlBody::Iccn { .. } => "ICCN",
            ControlBody::Cdn { .. } => "CDN",
            ControlBody::Zlb => "ZLB",
        }
    }

    /// Whether this message is addressed to a session rather than the
    /// tunnel itself.
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            ControlBody::Icrq { .. }
                | ControlBody::Icrp { .. }
                | ControlBody::Iccn { .. }
                | ControlBody::Cdn { .. }
        )
    }
}

impl fmt::Display for ControlBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One L2TPv2 control message: header plus typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub header: ControlHeader,
    pub body: ControlBody,
}

impl ControlMessage {
    /// Creates a message with zeroed sequence numbers; the reliable
    /// transport assigns Ns and patches Nr at transmit time.
    pub fn new(tunnel_id: u16, session_id: u16, body: ControlBody) -> Self {
        Self {
            header: ControlHeader {
                tunnel_id,
                session_id,
                ns: 0,
                nr: 0,
            },
            body,
        }
    }

    /// Encodes the message, including its AVP body and length field.
    pub fn encode(&self) -> Vec<u8> {
        let avps = build_avps(&self.body);
        header::encode_control(&self.header, &avp::encode_avps(&avps))
    }

    /// Decodes a control message from a parsed header and AVP body.
    pub fn decode(header: ControlHeader, body: &[u8]) -> Result<Self> {
        let body = parse_body(body)?;
        Ok(Self { header, body })
    }
}

/// One L2TPv2 data message carrying a PPP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub header: DataHeader,
    pub payload: Vec<u8>,
}

impl DataMessage {
    pub fn new(tunnel_id: u16, session_id: u16, payload: Vec<u8>) -> Self {
        Self {
            header: DataHeader {
                tunnel_id,
                session_id,
            },
            payload,
        }
    }

    /// Encodes the data message with the minimal six-byte header.
    pub fn encode(&self) -> Vec<u8> {
        header::encode_data(&self.header, &self.payload)
    }
}

/// Everything decoded from one UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Control messages, in datagram order (usually one).
    Control(Vec<ControlMessage>),
    /// A data message.
    Data(DataMessage),
}

/// Decodes a whole datagram into control messages or a data message.
pub fn decode_datagram(buf: &[u8]) -> Result<Decoded> {
    match header::parse_packet(buf)? {
        RawPacket::Data { header, body } => Ok(Decoded::Data(DataMessage {
            header,
            payload: body.to_vec(),
        })),
        RawPacket::Control {
            header,
            body,
            mut trailing,
        } => {
            let mut messages = vec![ControlMessage::decode(header, body)?];
            while !trailing.is_empty() {
                match header::parse_packet(trailing)? {
                    RawPacket::Control {
                        header,
                        body,
                        trailing: rest,
                    } => {
                        messages.push(ControlMessage::decode(header, body)?);
                        trailing = rest;
                    }
                    RawPacket::Data { .. } => {
                        return Err(WireError::BadFlags(header::DATA_FLAGS));
                    }
                }
            }
            Ok(Decoded::Control(messages))
        }
    }
}

fn require<'a>(
    avps: &'a [Avp],
    attribute: AvpType,
    message_type: &'static str,
    name: &'static str,
) -> Result<&'a Avp> {
    avp::find_avp(avps, attribute).ok_or(WireError::MissingRequired {
        message_type,
        avp: name,
    })
}

fn parse_body(body: &[u8]) -> Result<ControlBody> {
    let avps = avp::parse_avps(body)?;
    if avps.is_empty() {
        return Ok(ControlBody::Zlb);
    }

    let first = &avps[0];
    if first.attribute != AvpType::MessageType {
        return Err(WireError::BadAvp(
            "first AVP is not Message Type".to_string(),
        ));
    }
    let mtype = first.as_u16()?;

    match mtype {
        msg_type::SCCRQ => Ok(ControlBody::Sccrq {
            protocol_version: require(&avps, AvpType::ProtocolVersion, "SCCRQ", "Protocol Version")?
                .as_u16()?,
            host_name: require(&avps, AvpType::HostName, "SCCRQ", "Host Name")?.as_string(),
            framing_caps: require(
                &avps,
                AvpType::FramingCapabilities,
                "SCCRQ",
                "Framing Capabilities",
            )?
            .as_u32()?,
            assigned_tunnel_id: require(
                &avps,
                AvpType::AssignedTunnelId,
                "SCCRQ",
                "Assigned Tunnel ID",
            )?
            .as_u16()?,
            bearer_caps: avp::find_avp(&avps, AvpType::BearerCapabilities)
                .map(|a| a.as_u32())
                .transpose()?,
            receive_window_size: avp::find_avp(&avps, AvpType::ReceiveWindowSize)
                .map(|a| a.as_u16())
                .transpose()?,
            tie_breaker: avp::find_avp(&avps, AvpType::TieBreaker)
                .map(|a| a.as_u64())
                .transpose()?,
        }),
        msg_type::SCCRP => Ok(ControlBody::Sccrp {
            protocol_version: require(&avps, AvpType::ProtocolVersion, "SCCRP", "Protocol Version")?
                .as_u16()?,
            host_name: require(&avps, AvpType::HostName, "SCCRP", "Host Name")?.as_string(),
            framing_caps: require(
                &avps,
                AvpType::FramingCapabilities,
                "SCCRP",
                "Framing Capabilities",
            )?
            .as_u32()?,
            assigned_tunnel_id: require(
                &avps,
                AvpType::AssignedTunnelId,
                "SCCRP",
                "Assigned Tunnel ID",
            )?
            .as_u16()?,
            receive_window_size: avp::find_avp(&avps, AvpType::ReceiveWindowSize)
                .map(|a| a.as_u16())
                .transpose()?,
            challenge: avp::find_avp(&avps, AvpType::Challenge).map(|a| a.value.clone()),
        }),
        msg_type::SCCCN => Ok(ControlBody::Scccn),
        msg_type::STOPCCN => Ok(ControlBody::StopCcn {
            assigned_tunnel_id: require(
                &avps,
                AvpType::AssignedTunnelId,
                "StopCCN",
                "Assigned Tunnel ID",
            )?
            .as_u16()?,
            result: ResultCode::decode(
                &require(&avps, AvpType::ResultCode, "StopCCN", "Result Code")?.value,
            )?,
        }),
        msg_type::HELLO => Ok(ControlBody::Hello),
        msg_type::ICRQ => Ok(ControlBody::Icrq {
            assigned_session_id: require(
                &avps,
                AvpType::AssignedSessionId,
                "ICRQ",
                "Assigned Session ID",
            )?
            .as_u16()?,
            call_serial: require(&avps, AvpType::CallSerialNumber, "ICRQ", "Call Serial Number")?
                .as_u32()?,
        }),
        msg_type::ICRP => Ok(ControlBody::Icrp {
            assigned_session_id: require(
                &avps,
                AvpType::AssignedSessionId,
                "ICRP",
                "Assigned Session ID",
            )?
            .as_u16()?,
        }),
        msg_type::ICCN => Ok(ControlBody::Iccn {
            tx_connect_speed: require(&avps, AvpType::TxConnectSpeed, "ICCN", "Tx Connect Speed")?
                .as_u32()?,
            framing_type: require(&avps, AvpType::FramingType, "ICCN", "Framing Type")?.as_u32()?,
        }),
        msg_type::CDN => Ok(ControlBody::Cdn {
            assigned_session_id: require(
                &avps,
                AvpType::AssignedSessionId,
                "CDN",
                "Assigned Session ID",
            )?
            .as_u16()?,
            result: ResultCode::decode(
                &require(&avps, AvpType::ResultCode, "CDN", "Result Code")?.value,
            )?,
        }),
        other => Err(WireError::BadAvp(format!("unknown message type {other}"))),
    }
}

fn build_avps(body: &ControlBody) -> Vec<Avp> {
    match body {
        ControlBody::Sccrq {
            protocol_version,
            host_name,
            framing_caps,
            assigned_tunnel_id,
            bearer_caps,
            receive_window_size,
            tie_breaker,
        } => {
            let mut avps = vec![
                Avp::from_u16(AvpType::MessageType, msg_type::SCCRQ),
                Avp::from_u16(AvpType::ProtocolVersion, *protocol_version),
                Avp::from_string(AvpType::HostName, host_name),
                Avp::from_u32(AvpType::FramingCapabilities, *framing_caps),
                Avp::from_u16(AvpType::AssignedTunnelId, *assigned_tunnel_id),
            ];
            if let Some(caps) = bearer_caps {
                avps.push(Avp::from_u32(AvpType::BearerCapabilities, *caps));
            }
            if let Some(window) = receive_window_size {
                avps.push(Avp::optional(
                    AvpType::ReceiveWindowSize,
                    window.to_be_bytes().to_vec(),
                ));
            }
            if let Some(tie) = tie_breaker {
                avps.push(Avp::optional(
                    AvpType::TieBreaker,
                    tie.to_be_bytes().to_vec(),
                ));
            }
            avps
        }
        ControlBody::Sccrp {
            protocol_version,
            host_name,
            framing_caps,
            assigned_tunnel_id,
            receive_window_size,
            challenge,
        } => {
            let mut avps = vec![
                Avp::from_u16(AvpType::MessageType, msg_type::SCCRP),
                Avp::from_u16(AvpType::ProtocolVersion, *protocol_version),
                Avp::from_string(AvpType::HostName, host_name),
                Avp::from_u32(AvpType::FramingCapabilities, *framing_caps),
                Avp::from_u16(AvpType::AssignedTunnelId, *assigned_tunnel_id),
            ];
            if let Some(window) = receive_window_size {
                avps.push(Avp::optional(
                    AvpType::ReceiveWindowSize,
                    window.to_be_bytes().to_vec(),
                ));
            }
            if let Some(challenge) = challenge {
                avps.push(Avp::new(AvpType::Challenge, challenge.clone()));
            }
            avps
        }
        ControlBody::Scccn => vec![Avp::from_u16(AvpType::MessageType, msg_type::SCCCN)],
        ControlBody::StopCcn {
            assigned_tunnel_id,
            result,
        } => vec![
            Avp::from_u16(AvpType::MessageType, msg_type::STOPCCN),
            Avp::from_u16(AvpType::AssignedTunnelId, *assigned_tunnel_id),
            Avp::new(AvpType::ResultCode, result.encode()),
        ],
        ControlBody::Hello => vec![Avp::from_u16(AvpType::MessageType, msg_type::HELLO)],
        ControlBody::Icrq {
            assigned_session_id,
            call_serial,
        } => vec![
            Avp::from_u16(AvpType::MessageType, msg_type::ICRQ),
            Avp::from_u16(AvpType::AssignedSessionId, *assigned_session_id),
            Avp::from_u32(AvpType::CallSerialNumber, *call_serial),
        ],
        ControlBody::Icrp {
            assigned_session_id,
        } => vec![
            Avp::from_u16(AvpType::MessageType, msg_type::ICRP),
            Avp::from_u16(AvpType::AssignedSessionId, *assigned_session_id),
        ],
        ControlBody::Iccn {
            tx_connect_speed,
            framing_type,
        } => vec![
            Avp::from_u16(AvpType::MessageType, msg_type::ICCN),
            Avp::from_u32(AvpType::TxConnectSpeed, *tx_connect_speed),
            Avp::from_u32(AvpType::FramingType, *framing_type),
        ],
        ControlBody::Cdn {
            assigned_session_id,
            result,
        } => vec![
            Avp::from_u16(AvpType::MessageType, msg_type::CDN),
            Avp::from_u16(AvpType::AssignedSessionId, *assigned_session_id),
            Avp::new(AvpType::ResultCode, result.encode()),
        ],
        ControlBody::Zlb => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avp::{cdn_result, error_code};

    fn roundtrip(msg: ControlMessage) {
        let encoded = msg.encode();
        match decode_datagram(&encoded).unwrap() {
            Decoded::Control(messages) => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0], msg);
            }
            other => panic!("expected control, got {:?}", other),
        }
    }

    #[test]
    fn test_sccrq_roundtrip() {
        roundtrip(ControlMessage::new(
            0,
            0,
            ControlBody::Sccrq {
                protocol_version: PROTOCOL_VERSION_AVP,
                host_name: "client.local".to_string(),
                framing_caps: FRAMING_SYNC | FRAMING_ASYNC,
                assigned_tunnel_id: 0x0123,
                bearer_caps: None,
                receive_window_size: Some(4),
                tie_breaker: None,
            },
        ));
    }

    #[test]
    fn test_sccrp_roundtrip() {
        roundtrip(ControlMessage::new(
            0x0123,
            0,
            ControlBody::Sccrp {
                protocol_version: PROTOCOL_VERSION_AVP,
                host_name: "lns.example".to_string(),
                framing_caps: FRAMING_SYNC,
                assigned_tunnel_id: 0x4567,
                receive_window_size: Some(8),
                challenge: None,
            },
        ));
    }

    #[test]
    fn test_session_messages_roundtrip() {
        roundtrip(ControlMessage::new(
            0x4567,
            0,
            ControlBody::Icrq {
                assigned_session_id: 0x0A0A,
                call_serial: 1,
            },
        ));
        roundtrip(ControlMessage::new(
            0x0123,
            0x0A0A,
            ControlBody::Icrp {
                assigned_session_id: 0x0B0B,
            },
        ));
        roundtrip(ControlMessage::new(
            0x4567,
            0x0B0B,
            ControlBody::Iccn {
                tx_connect_speed: 100_000_000,
                framing_type: FRAMING_SYNC,
            },
        ));
        roundtrip(ControlMessage::new(
            0x4567,
            0x0B0B,
            ControlBody::Cdn {
                assigned_session_id: 0x0A0A,
                result: ResultCode::with_error(
                    cdn_result::GENERAL_ERROR,
                    error_code::BAD_VALUE,
                    "xyz",
                ),
            },
        ));
    }

    #[test]
    fn test_zlb_roundtrip() {
        roundtrip(ControlMessage::new(0x4567, 0, ControlBody::Zlb));
    }

    #[test]
    fn test_missing_required_avp() {
        // SCCRQ without a Host Name AVP.
        let avps = vec![
            Avp::from_u16(AvpType::MessageType, 1),
            Avp::from_u16(AvpType::ProtocolVersion, PROTOCOL_VERSION_AVP),
            Avp::from_u32(AvpType::FramingCapabilities, 3),
            Avp::from_u16(AvpType::AssignedTunnelId, 9),
        ];
        let header = ControlHeader {
            tunnel_id: 0,
            session_id: 0,
            ns: 0,
            nr: 0,
        };
        let buf = crate::header::encode_control(&header, &avp::encode_avps(&avps));

        assert_eq!(
            decode_datagram(&buf).unwrap_err(),
            WireError::MissingRequired {
                message_type: "SCCRQ",
                avp: "Host Name",
            }
        );
    }

    #[test]
    fn test_icrp_without_session_id() {
        let avps = vec![Avp::from_u16(AvpType::MessageType, 11)];
        let header = ControlHeader {
            tunnel_id: 0,
            session_id: 1,
            ns: 0,
            nr: 0,
        };
        let buf = crate::header::encode_control(&header, &avp::encode_avps(&avps));

        assert_eq!(
            decode_datagram(&buf).unwrap_err(),
            WireError::MissingRequired {
                message_type: "ICRP",
                avp: "Assigned Session ID",
            }
        );
    }

    #[test]
    fn test_two_messages_in_one_datagram() {
        let hello = ControlMessage::new(7, 0, ControlBody::Hello);
        let zlb = ControlMessage::new(7, 0, ControlBody::Zlb);
        let mut buf = hello.encode();
        buf.extend_from_slice(&zlb.encode());

        match decode_datagram(&buf).unwrap() {
            Decoded::Control(messages) => {
                assert_eq!(messages, vec![hello, zlb]);
            }
            other => panic!("expected control, got {:?}", other),
        }
    }

    #[test]
    fn test_data_message_passthrough() {
        let payload = vec![0x45; 40];
        let mut body = vec![0xFF, 0x03, 0x00, 0x21];
        body.extend_from_slice(&payload);
        let msg = DataMessage::new(0x0123, 0x0A0A, body.clone());

        match decode_datagram(&msg.encode()).unwrap() {
            Decoded::Data(parsed) => {
                assert_eq!(parsed.header.tunnel_id, 0x0123);
                assert_eq!(parsed.header.session_id, 0x0A0A);
                assert_eq!(parsed.payload, body);
            }
            other => panic!("expected data, got {:?}", other),
        }
    }
}
