//! Reliable control-message delivery (RFC 2661 section 5.8).
//!
//! Each tunnel runs one instance between its UDP socket and its state
//! machine. The transport is a pure state machine: the tunnel task
//! feeds it decoded messages and deadlines, and it hands back
//! datagrams to put on the wire.
//!
//! ```text
//! Sender                                              Receiver
//!    |                                                    |
//!    |  ── ctrl (Ns=0, Nr=0) ──────────────────────────>  |
//!    |  ── ctrl (Ns=1, Nr=0) ──────────────────────────>  |
//!    |                          (delivers in Ns order)    |
//!    |  <────────────────────────── ctrl (Ns=0, Nr=2) ──  |
//!    |        (Nr=2 acknowledges both, piggybacked)       |
//!    |                                                    |
//!    |  ── ctrl (Ns=2, Nr=1) ──────────────────────────>  |
//!    |             ...lost, retransmitted with backoff... |
//!    |  <─────────────────────────── ZLB (Ns=1, Nr=3) ──  |
//! ```
//!
//! Every outgoing message carries the current Nr, so acknowledgement
//! piggybacks on any traffic; a ZLB is emitted only when an ack is
//! due and nothing else is heading out. Retransmission backs off
//! exponentially up to a cap; exhausting the retry budget yields
//! [`Error::PeerUnresponsive`] exactly once.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use l2tp_wire::header::patch_sequence;
use l2tp_wire::message::{ControlBody, ControlMessage};

use crate::error::Error;

/// Delay before an ack-only ZLB is sent for an in-order delivery,
/// giving outbound traffic a chance to piggyback the Nr.
pub const ACK_DELAY: Duration = Duration::from_millis(100);

/// Returns true when sequence number `a` precedes `b`, modulo 2^16.
fn seq_before(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

/// Transport tuning, taken from the tunnel configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub retry_timeout: Duration,
    pub max_retry_timeout: Duration,
    pub max_retries: u32,
    pub window_size: u16,
}

/// One unacknowledged (or not yet transmitted) control message.
#[derive(Debug)]
struct SendSlot {
    ns: u16,
    buf: Vec<u8>,
    sent: bool,
    retries: u32,
    timeout: Duration,
    deadline: Instant,
}

/// Pending-acknowledgement state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckState {
    Idle,
    /// Ack due at the deadline unless piggybacked first.
    Delayed(Instant),
    /// Ack due on the next pump.
    Immediate,
}

/// Per-tunnel reliable delivery state.
#[derive(Debug)]
pub struct Transport {
    config: TransportConfig,
    /// Next send sequence number.
    ns: u16,
    /// Next expected receive sequence number.
    nr: u16,
    /// Peer tunnel id stamped on ack-only ZLBs.
    peer_tunnel_id: u16,
    /// Peer's advertised receive window.
    peer_window: u16,
    sendq: VecDeque<SendSlot>,
    /// Out-of-order messages held until their predecessors arrive.
    reorder: Vec<ControlMessage>,
    ack: AckState,
    failed: bool,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            ns: 0,
            nr: 0,
            peer_tunnel_id: 0,
            peer_window: config.window_size,
            config,
            sendq: VecDeque::new(),
            reorder: Vec::new(),
            ack: AckState::Idle,
            failed: false,
        }
    }

    /// Adopts the peer's Receive Window Size.
    pub fn set_peer_window(&mut self, window: u16) {
        if window > 0 {
            self.peer_window = window;
        }
    }

    /// Records the peer's assigned tunnel id for ack-only ZLBs.
    pub fn set_peer_tunnel_id(&mut self, tunnel_id: u16) {
        self.peer_tunnel_id = tunnel_id;
    }

    /// Queues a message for reliable delivery, assigning its Ns.
    /// Returns the assigned sequence number.
    pub fn enqueue(&mut self, mut msg: ControlMessage) -> u16 {
        let ns = self.ns;
        self.ns = self.ns.wrapping_add(1);
        msg.header.ns = ns;

        trace!(ns, body = %msg.body, "queueing control message");
        self.sendq.push_back(SendSlot {
            ns,
            buf: msg.encode(),
            sent: false,
            retries: 0,
            timeout: self.config.retry_timeout,
            // Placeholder until first transmission.
            deadline: Instant::now(),
        });
        ns
    }

    /// Processes one received control message, advancing the ack and
    /// receive state. Returns the messages now deliverable upward, in
    /// strict Ns order.
    pub fn recv(&mut self, msg: ControlMessage) -> Vec<ControlMessage> {
        // Nr acknowledges everything before it.
        let nr = msg.header.nr;
        let before = self.sendq.len();
        self.sendq.retain(|slot| !seq_before(slot.ns, nr));
        if self.sendq.len() != before {
            trace!(nr, acked = before - self.sendq.len(), "peer acknowledgement");
        }

        // ZLBs carry only the acknowledgement.
        if msg.body == ControlBody::Zlb {
            return Vec::new();
        }

        let ns = msg.header.ns;
        if ns == self.nr {
            // In order: deliver, then drain any buffered successors.
            self.nr = self.nr.wrapping_add(1);
            let mut out = vec![msg];
            loop {
                let Some(pos) = self.reorder.iter().position(|m| m.header.ns == self.nr) else {
                    break;
                };
                out.push(self.reorder.swap_remove(pos));
                self.nr = self.nr.wrapping_add(1);
            }
            if self.ack == AckState::Idle {
                self.ack = AckState::Delayed(Instant::now() + ACK_DELAY);
            }
            out
        } else if !seq_before(ns, self.nr)
            && ns.wrapping_sub(self.nr) < self.config.window_size
        {
            // Ahead but within the window: hold for reordering and
            // prod the peer with our current Nr.
            if !self.reorder.iter().any(|m| m.header.ns == ns) {
                debug!(ns, expected = self.nr, "buffering out-of-order message");
                self.reorder.push(msg);
            }
            self.ack = AckState::Immediate;
            Vec::new()
        } else if seq_before(ns, self.nr) {
            // Duplicate of something already delivered: re-ack.
            trace!(ns, "duplicate control message");
            self.ack = AckState::Immediate;
            Vec::new()
        } else {
            // Outside the window entirely.
            debug!(ns, expected = self.nr, "dropping out-of-window message");
            Vec::new()
        }
    }

    /// Collects everything due on the wire at `now`: first
    /// transmissions permitted by the peer window, retransmissions of
    /// expired slots, and a ZLB if an ack is due with no traffic to
    /// carry it.
    ///
    /// Fails with [`Error::PeerUnresponsive`], exactly once, when a
    /// slot has exhausted its retries.
    pub fn pump(&mut self, now: Instant) -> Result<Vec<Vec<u8>>, Error> {
        if self.failed {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();

        // Retransmissions.
        for slot in self.sendq.iter_mut() {
            if !slot.sent || slot.deadline > now {
                continue;
            }
            if slot.retries >= self.config.max_retries {
                self.failed = true;
                return Err(Error::PeerUnresponsive {
                    retries: slot.retries,
                });
            }
            slot.retries += 1;
            slot.timeout = (slot.timeout * 2).min(self.config.max_retry_timeout);
            slot.deadline = now + slot.timeout;
            patch_sequence(&mut slot.buf, slot.ns, self.nr);
            debug!(ns = slot.ns, retry = slot.retries, "retransmitting");
            out.push(slot.buf.clone());
        }

        // First transmissions, bounded by the peer's window.
        let mut in_flight = self.sendq.iter().filter(|s| s.sent).count();
        for slot in self.sendq.iter_mut() {
            if slot.sent || in_flight >= self.peer_window as usize {
                continue;
            }
            slot.sent = true;
            slot.deadline = now + slot.timeout;
            patch_sequence(&mut slot.buf, slot.ns, self.nr);
            out.push(slot.buf.clone());
            in_flight += 1;
        }

        if !out.is_empty() {
            // Every message carries the current Nr.
            self.ack = AckState::Idle;
        } else {
            let ack_due = match self.ack {
                AckState::Immediate => true,
                AckState::Delayed(deadline) => deadline <= now,
                AckState::Idle => false,
            };
            if ack_due {
                self.ack = AckState::Idle;
                let mut zlb = ControlMessage::new(self.peer_tunnel_id, 0, ControlBody::Zlb);
                zlb.header.ns = self.ns;
                zlb.header.nr = self.nr;
                out.push(zlb.encode());
            }
        }

        Ok(out)
    }

    /// Next instant at which [`Transport::pump`] has work to do.
    pub fn poll_deadline(&self) -> Option<Instant> {
        if self.failed {
            return None;
        }
        let retransmit = self
            .sendq
            .iter()
            .filter(|s| s.sent)
            .map(|s| s.deadline)
            .min();
        let ack = match self.ack {
            AckState::Delayed(deadline) => Some(deadline),
            _ => None,
        };
        match (retransmit, ack) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Whether the message with the given Ns is still unacknowledged.
    pub fn is_unacked(&self, ns: u16) -> bool {
        self.sendq.iter().any(|slot| slot.ns == ns)
    }

    /// Whether any message awaits transmission or acknowledgement.
    pub fn has_pending(&self) -> bool {
        !self.sendq.is_empty()
    }
}
