//! Per-session PPP negotiation engine.
//!
//! Runs once the session control plane is established and drives
//! three sub-protocols in sequence over unsequenced L2TP data
//! messages:
//!
//! ```text
//! Peer                                                Client
//!   |  ── LCP Configure-Request {PAP, magic, MRU} ──────>  |
//!   |  <───────────────────── LCP Configure-Ack ────────  |
//!   |  <──────── LCP Configure-Request {MRU, magic} ────  |
//!   |  ── LCP Configure-Ack ────────────────────────────>  |
//!   |  <──────── PAP Authenticate-Request {id, pw} ─────  |
//!   |  ── PAP Authenticate-Ack ─────────────────────────>  |
//!   |  <──────── IPCP Configure-Request {0.0.0.0} ──────  |
//!   |  ── IPCP Configure-Nak {a.b.c.d} ─────────────────>  |
//!   |  <──────── IPCP Configure-Request {a.b.c.d} ──────  |
//!   |  ── IPCP Configure-Ack ───────────────────────────>  |
//!   |                          (data plane starts here)    |
//! ```
//!
//! The engine is a pure state machine: the session task feeds it
//! frames and deadlines and carries out the returned actions. Our own
//! outstanding request is retransmitted on a bounded restart timer
//! since data messages are not covered by the control channel's
//! reliable delivery.
//!
//! Each sub-protocol keeps its own monotonically increasing 8-bit
//! identifier, seeded at session start. Responses always echo the
//! requester's identifier.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use l2tp_wire::ppp::{
    self, encode_options, lcp_opt, parse_options, CpCode, PapCode, PppFrame, PppOption, PppPacket,
    PppProtocol, AUTH_PROTOCOL_PAP,
};
use l2tp_wire::ppp::ipcp_opt;

/// Restart timer for our outstanding request (RFC 1661 default).
pub const RESTART_INTERVAL: Duration = Duration::from_secs(3);
/// Retransmission bound per request (RFC 1661 Max-Configure).
pub const MAX_CONFIGURE: u32 = 10;
/// MRU we ask the peer to accept.
pub const LOCAL_MRU: u16 = 1500;

/// Work the session task must carry out after feeding the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PppAction {
    /// Transmit a PPP frame as an L2TP data message.
    Send(PppFrame),
    /// IPCP settled on this address; bring the data plane up.
    Up(Ipv4Addr),
    /// The peer rejected our credentials.
    AuthFailed(String),
    /// The peer sent Terminate-Request; the ack is already queued.
    PeerTerminated,
    /// Negotiation cannot make progress.
    Failed(String),
}

/// Overall bring-up phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for LCP to converge.
    Link,
    /// LCP up, PAP exchange outstanding.
    Authenticate,
    /// Authenticated, IPCP exchange outstanding.
    Network,
    /// IPCP settled, data plane running.
    Open,
}

/// Our one outstanding request and its retry budget.
#[derive(Debug)]
struct Pending {
    protocol: PppProtocol,
    packet: PppPacket,
    attempts: u32,
    deadline: Instant,
}

/// PPP negotiation state for one session.
#[derive(Debug)]
pub struct PppEngine {
    peer_id: String,
    password: String,
    /// Our magic number, sent in LCP and echoed in replies.
    magic: u32,
    phase: Phase,
    lcp_ident: u8,
    pap_ident: u8,
    ipcp_ident: u8,
    /// Whether the peer's Configure-Request offered these options,
    /// which decides what our own request asks for.
    peer_offered_mru: bool,
    peer_offered_magic: bool,
    /// Address requested via IPCP; starts unassigned and is adopted
    /// from the peer's Configure-Nak.
    requested_ip: Ipv4Addr,
    pending: Option<Pending>,
}

impl PppEngine {
    pub fn new(peer_id: impl Into<String>, password: impl Into<String>, magic: u32) -> Self {
        Self {
            peer_id: peer_id.into(),
            password: password.into(),
            magic,
            phase: Phase::Link,
            lcp_ident: 0,
            pap_ident: 0,
            ipcp_ident: 0,
            peer_offered_mru: false,
            peer_offered_magic: false,
            requested_ip: Ipv4Addr::UNSPECIFIED,
            pending: None,
        }
    }

    /// Feeds one received PPP frame through the engine.
    pub fn handle_frame(&mut self, frame: &PppFrame, now: Instant) -> Vec<PppAction> {
        let packet = match PppPacket::parse(&frame.payload) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(protocol = ?frame.protocol, %err, "dropping malformed PPP packet");
                return Vec::new();
            }
        };

        match frame.protocol {
            PppProtocol::Lcp => self.on_lcp(packet, now),
            PppProtocol::Pap => self.on_pap(packet, now),
            PppProtocol::Ipcp => self.on_ipcp(packet, now),
            PppProtocol::Ipv4 | PppProtocol::Other(_) => Vec::new(),
        }
    }

    /// Retransmits the outstanding request when its timer expires.
    pub fn on_timer(&mut self, now: Instant) -> Vec<PppAction> {
        let Some(pending) = self.pending.as_mut() else {
            return Vec::new();
        };
        if pending.deadline > now {
            return Vec::new();
        }
        if pending.attempts >= MAX_CONFIGURE {
            let protocol = pending.protocol;
            self.pending = None;
            return vec![PppAction::Failed(format!(
                "{protocol:?} negotiation gave up after {MAX_CONFIGURE} attempts"
            ))];
        }
        pending.attempts += 1;
        pending.deadline = now + RESTART_INTERVAL;
        debug!(
            protocol = ?pending.protocol,
            attempt = pending.attempts,
            "restarting outstanding PPP request"
        );
        vec![PppAction::Send(PppFrame::new(
            pending.protocol,
            pending.packet.encode(),
        ))]
    }

    /// Next instant at which [`PppEngine::on_timer`] has work to do.
    pub fn poll_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Builds the Terminate-Request sent when the session closes from
    /// our side.
    pub fn terminate_request(&mut self) -> PppFrame {
        let ident = self.next_lcp_ident();
        lcp_frame(PppPacket::new(
            CpCode::TerminateRequest.as_u8(),
            ident,
            Vec::new(),
        ))
    }

    // ========================================================================
    // LCP
    // ========================================================================

    fn on_lcp(&mut self, packet: PppPacket, now: Instant) -> Vec<PppAction> {
        let Some(code) = CpCode::from_u8(packet.code) else {
            trace!(code = packet.code, "ignoring unknown LCP code");
            return Vec::new();
        };

        match code {
            CpCode::ConfigureRequest => self.on_lcp_configure_request(packet, now),
            CpCode::ConfigureAck => {
                if !self.pending_matches(PppProtocol::Lcp, packet.identifier) {
                    return Vec::new();
                }
                self.pending = None;
                debug!("LCP up, starting PAP");
                self.phase = Phase::Authenticate;
                vec![self.send_pap_request(now)]
            }
            CpCode::ConfigureNak => {
                if !self.pending_matches(PppProtocol::Lcp, packet.identifier) {
                    return Vec::new();
                }
                // Adopt the peer's suggested MRU and ask again.
                let suggested_mru = parse_options(&packet.body)
                    .iter()
                    .find(|o| o.kind == lcp_opt::MRU)
                    .and_then(|o| o.as_u16());
                vec![self.send_lcp_request(suggested_mru.unwrap_or(LOCAL_MRU), now)]
            }
            CpCode::ConfigureReject => {
                if !self.pending_matches(PppProtocol::Lcp, packet.identifier) {
                    return Vec::new();
                }
                let rejected = parse_options(&packet.body);
                if rejected.iter().any(|o| o.kind == lcp_opt::MRU) {
                    self.peer_offered_mru = false;
                }
                if rejected.iter().any(|o| o.kind == lcp_opt::MAGIC_NUMBER) {
                    self.peer_offered_magic = false;
                }
                vec![self.send_lcp_request(LOCAL_MRU, now)]
            }
            CpCode::EchoRequest => {
                // Body is the sender's magic; the reply carries ours,
                // under the request's identifier.
                let mut body = self.magic.to_be_bytes().to_vec();
                if packet.body.len() > 4 {
                    body.extend_from_slice(&packet.body[4..]);
                }
                vec![PppAction::Send(lcp_frame(PppPacket::new(
                    CpCode::EchoReply.as_u8(),
                    packet.identifier,
                    body,
                )))]
            }
            CpCode::TerminateRequest => {
                vec![
                    PppAction::Send(lcp_frame(PppPacket::new(
                        CpCode::TerminateAck.as_u8(),
                        packet.identifier,
                        Vec::new(),
                    ))),
                    PppAction::PeerTerminated,
                ]
            }
            CpCode::EchoReply | CpCode::TerminateAck | CpCode::DiscardRequest => Vec::new(),
            CpCode::CodeReject | CpCode::ProtocolReject => {
                warn!(code = ?code, "peer rejected our traffic");
                Vec::new()
            }
        }
    }

    fn on_lcp_configure_request(&mut self, packet: PppPacket, now: Instant) -> Vec<PppAction> {
        let options = parse_options(&packet.body);
        let mut acceptable = Vec::new();
        let mut rejected = Vec::new();

        for option in options {
            match option.kind {
                lcp_opt::AUTH_PROTOCOL if option.as_u16() == Some(AUTH_PROTOCOL_PAP) => {
                    acceptable.push(option);
                }
                lcp_opt::MAGIC_NUMBER => {
                    self.peer_offered_magic = true;
                    acceptable.push(option);
                }
                lcp_opt::MRU => {
                    self.peer_offered_mru = true;
                    acceptable.push(option);
                }
                _ => rejected.push(option),
            }
        }

        if !rejected.is_empty() {
            debug!(count = rejected.len(), "rejecting unsupported LCP options");
            return vec![PppAction::Send(lcp_frame(PppPacket::new(
                CpCode::ConfigureReject.as_u8(),
                packet.identifier,
                encode_options(&rejected),
            )))];
        }

        let mut actions = vec![PppAction::Send(lcp_frame(PppPacket::new(
            CpCode::ConfigureAck.as_u8(),
            packet.identifier,
            encode_options(&acceptable),
        )))];
        if self.phase == Phase::Link && !self.pending_is(PppProtocol::Lcp) {
            actions.push(self.send_lcp_request(LOCAL_MRU, now));
        }
        actions
    }

    fn send_lcp_request(&mut self, mru: u16, now: Instant) -> PppAction {
        let mut options = Vec::new();
        if self.peer_offered_mru {
            options.push(PppOption::from_u16(lcp_opt::MRU, mru));
        }
        if self.peer_offered_magic {
            options.push(PppOption::from_u32(lcp_opt::MAGIC_NUMBER, self.magic));
        }
        let ident = self.next_lcp_ident();
        let packet = PppPacket::new(
            CpCode::ConfigureRequest.as_u8(),
            ident,
            encode_options(&options),
        );
        self.set_pending(PppProtocol::Lcp, packet.clone(), now);
        PppAction::Send(lcp_frame(packet))
    }

    // ========================================================================
    // PAP
    // ========================================================================

    fn on_pap(&mut self, packet: PppPacket, now: Instant) -> Vec<PppAction> {
        let Some(code) = PapCode::from_u8(packet.code) else {
            trace!(code = packet.code, "ignoring unknown PAP code");
            return Vec::new();
        };

        match code {
            PapCode::AuthenticateAck => {
                if self.phase != Phase::Authenticate
                    || !self.pending_matches(PppProtocol::Pap, packet.identifier)
                {
                    return Vec::new();
                }
                self.pending = None;
                debug!("PAP accepted, starting IPCP");
                self.phase = Phase::Network;
                vec![self.send_ipcp_request(now)]
            }
            PapCode::AuthenticateNak => {
                if self.phase != Phase::Authenticate
                    || !self.pending_matches(PppProtocol::Pap, packet.identifier)
                {
                    return Vec::new();
                }
                self.pending = None;
                let message = ppp::parse_pap_message(&packet.body);
                vec![PppAction::AuthFailed(if message.is_empty() {
                    "peer rejected credentials".to_string()
                } else {
                    message
                })]
            }
            PapCode::AuthenticateRequest => Vec::new(),
        }
    }

    fn send_pap_request(&mut self, now: Instant) -> PppAction {
        let ident = self.next_pap_ident();
        let packet = PppPacket::new(
            PapCode::AuthenticateRequest.as_u8(),
            ident,
            ppp::encode_pap_request(&self.peer_id, &self.password),
        );
        self.set_pending(PppProtocol::Pap, packet.clone(), now);
        PppAction::Send(PppFrame::new(PppProtocol::Pap, packet.encode()))
    }

    // ========================================================================
    // IPCP
    // ========================================================================

    fn on_ipcp(&mut self, packet: PppPacket, now: Instant) -> Vec<PppAction> {
        let Some(code) = CpCode::from_u8(packet.code) else {
            trace!(code = packet.code, "ignoring unknown IPCP code");
            return Vec::new();
        };

        match code {
            CpCode::ConfigureRequest => {
                // The peer configures its own side; accept whatever
                // it proposes.
                vec![PppAction::Send(PppFrame::new(
                    PppProtocol::Ipcp,
                    PppPacket::new(CpCode::ConfigureAck.as_u8(), packet.identifier, packet.body)
                        .encode(),
                ))]
            }
            CpCode::ConfigureNak => {
                if !self.pending_matches(PppProtocol::Ipcp, packet.identifier) {
                    return Vec::new();
                }
                let offered = parse_options(&packet.body)
                    .iter()
                    .find(|o| o.kind == ipcp_opt::IP_ADDRESS)
                    .and_then(|o| o.as_u32())
                    .map(Ipv4Addr::from);
                match offered {
                    Some(addr) => {
                        debug!(%addr, "adopting IPCP address from Configure-Nak");
                        self.requested_ip = addr;
                        vec![self.send_ipcp_request(now)]
                    }
                    None => vec![self.send_ipcp_request(now)],
                }
            }
            CpCode::ConfigureAck => {
                if !self.pending_matches(PppProtocol::Ipcp, packet.identifier) {
                    return Vec::new();
                }
                self.pending = None;
                if self.requested_ip.is_unspecified() {
                    // Acked the unassigned address; wait for a Nak
                    // that carries a real one.
                    Vec::new()
                } else {
                    self.phase = Phase::Open;
                    vec![PppAction::Up(self.requested_ip)]
                }
            }
            CpCode::ConfigureReject => {
                self.pending = None;
                vec![PppAction::Failed(
                    "peer rejected IPCP address negotiation".to_string(),
                )]
            }
            CpCode::TerminateRequest => {
                vec![PppAction::Send(PppFrame::new(
                    PppProtocol::Ipcp,
                    PppPacket::new(CpCode::TerminateAck.as_u8(), packet.identifier, Vec::new())
                        .encode(),
                ))]
            }
            _ => Vec::new(),
        }
    }

    fn send_ipcp_request(&mut self, now: Instant) -> PppAction {
        let ident = self.next_ipcp_ident();
        let packet = PppPacket::new(
            CpCode::ConfigureRequest.as_u8(),
            ident,
            encode_options(&[PppOption::from_u32(
                ipcp_opt::IP_ADDRESS,
                self.requested_ip.into(),
            )]),
        );
        self.set_pending(PppProtocol::Ipcp, packet.clone(), now);
        PppAction::Send(PppFrame::new(PppProtocol::Ipcp, packet.encode()))
    }

    // ========================================================================
    // Identifiers and retry state
    // ========================================================================

    fn next_lcp_ident(&mut self) -> u8 {
        let ident = self.lcp_ident;
        self.lcp_ident = self.lcp_ident.wrapping_add(1);
        ident
    }

    fn next_pap_ident(&mut self) -> u8 {
        let ident = self.pap_ident;
        self.pap_ident = self.pap_ident.wrapping_add(1);
        ident
    }

    fn next_ipcp_ident(&mut self) -> u8 {
        let ident = self.ipcp_ident;
        self.ipcp_ident = self.ipcp_ident.wrapping_add(1);
        ident
    }

    fn set_pending(&mut self, protocol: PppProtocol, packet: PppPacket, now: Instant) {
        self.pending = Some(Pending {
            protocol,
            packet,
            attempts: 1,
            deadline: now + RESTART_INTERVAL,
        });
    }

    fn pending_is(&self, protocol: PppProtocol) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.protocol == protocol)
    }

    fn pending_matches(&self, protocol: PppProtocol, identifier: u8) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.protocol == protocol && p.packet.identifier == identifier)
    }
}

fn lcp_frame(packet: PppPacket) -> PppFrame {
    PppFrame::new(PppProtocol::Lcp, packet.encode())
}
