//! # l2tp-wire
//!
//! Wire codec for L2TPv2 (RFC 2661) and the PPP sub-protocols that
//! ride inside it (RFC 1661 LCP, RFC 1334 PAP, RFC 1332 IPCP).
//!
//! The crate is pure parse/encode: no sockets, no timers, no state.
//! It is consumed by the `l2tp-lac` engine, whose reliable transport
//! assigns sequence numbers by patching encoded buffers at transmit
//! time ([`header::patch_sequence`]).
//!
//! ## Layers
//!
//! ```text
//! UDP datagram
//!   └── L2TPv2 header (header)          T=1: control  T=0: data
//!         ├── AVP list (avp, message)   SCCRQ/SCCRP/.../CDN/ZLB
//!         └── PPP frame (ppp)           FF 03 <protocol>
//!               ├── 0x0021  IPv4 payload (opaque)
//!               ├── 0xC021  LCP packet + options
//!               ├── 0xC023  PAP packet
//!               └── 0x8021  IPCP packet + options
//! ```
//!
//! ## Example
//!
//! ```
//! use l2tp_wire::message::{decode_datagram, ControlBody, ControlMessage, Decoded};
//!
//! let msg = ControlMessage::new(0x4567, 0, ControlBody::Hello);
//! match decode_datagram(&msg.encode()).unwrap() {
//!     Decoded::Control(messages) => assert_eq!(messages[0].body, ControlBody::Hello),
//!     Decoded::Data(_) => unreachable!(),
//! }
//! ```

pub mod avp;
pub mod error;
pub mod header;
pub mod message;
pub mod ppp;
pub mod reader;

pub use avp::{Avp, AvpType, ResultCode};
pub use error::{Result, WireError};
pub use header::{ControlHeader, DataHeader};
pub use message::{decode_datagram, ControlBody, ControlMessage, DataMessage, Decoded};
pub use ppp::{PppFrame, PppOption, PppPacket, PppProtocol};
