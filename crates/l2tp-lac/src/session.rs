//! L2TPv2 session state machine (RFC 2661 section 7.4.1, LAC role).
//!
//! Each session runs one task. The parent tunnel feeds it a single
//! ordered input queue (the tunnel-open notification, routed control
//! messages, routed PPP frames, close requests) so no control message
//! can overtake the open notification. The session owns its PPP
//! engine and its data-plane handle; it talks back to the tunnel only
//! through the tunnel's command channel, and writes PPP data messages
//! straight to the shared control socket.
//!
//! States: `waittunnel → waitreply → established → dead`.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use l2tp_wire::avp::{cdn_result, ResultCode};
use l2tp_wire::message::{ControlBody, ControlMessage, DataMessage, FRAMING_SYNC};
use l2tp_wire::ppp::{PppFrame, PppProtocol};

use crate::config::SessionConfig;
use crate::dataplane::{DataPlane, SessionDataPlane};
use crate::events::{Event, EventHandler};
use crate::ppp::{PppAction, PppEngine};
use crate::tunnel::TunnelCmd;
use crate::util::far_future;

/// Tx Connect Speed AVP value reported in ICCN. The real link speed
/// of a tunnelled session is unknowable; peers treat this as
/// informational.
const TX_CONNECT_SPEED: u32 = 100_000_000;

/// Inputs delivered to a session task, in order.
#[derive(Debug)]
pub(crate) enum SessionInput {
    /// The parent tunnel reached the established state.
    TunnelOpen { peer_tunnel_id: u16 },
    /// A control message routed by local session id.
    Ctrl(ControlMessage),
    /// A PPP frame routed by local session id.
    Ppp(PppFrame),
    /// Graceful close, with the CDN result to report.
    Close { result: Option<ResultCode> },
}

/// The tunnel's record of a child session.
pub(crate) struct SessionEntry {
    pub name: String,
    pub input_tx: mpsc::UnboundedSender<SessionInput>,
    pub kill: CancellationToken,
    pub join: tokio::task::JoinHandle<()>,
}

/// Host-facing handle to a session.
#[derive(Clone)]
pub struct SessionHandle {
    name: String,
    session_id: u16,
    input_tx: mpsc::UnboundedSender<SessionInput>,
    kill: CancellationToken,
    done: CancellationToken,
}

impl SessionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The local session id, unique within the parent tunnel.
    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    /// Gracefully closes the session (CDN with admin-disconnect) and
    /// waits for teardown. Idempotent.
    pub async fn close(&self) {
        let _ = self.input_tx.send(SessionInput::Close { result: None });
        self.done.cancelled().await;
    }

    /// Forces immediate teardown without notifying the peer.
    /// Idempotent.
    pub async fn kill(&self) {
        self.kill.cancel();
        self.done.cancelled().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitTunnel,
    WaitReply,
    Established,
    Dead,
}

pub(crate) struct Session {
    tunnel_name: String,
    name: String,
    config: SessionConfig,
    local_tunnel_id: u16,
    session_id: u16,
    call_serial: u32,
    state: State,
    peer_tunnel_id: u16,
    peer_session_id: u16,
    engine: Option<PppEngine>,
    dp: Option<Arc<dyn SessionDataPlane>>,
    /// Whether the data plane was started (SessionUp emitted).
    up: bool,
    result: Option<String>,
    tunnel_tx: mpsc::UnboundedSender<TunnelCmd>,
    socket: Arc<UdpSocket>,
    dataplane: Arc<dyn DataPlane>,
    events: Arc<dyn EventHandler>,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    tunnel_name: String,
    name: String,
    config: SessionConfig,
    local_tunnel_id: u16,
    session_id: u16,
    call_serial: u32,
    tunnel_tx: mpsc::UnboundedSender<TunnelCmd>,
    socket: Arc<UdpSocket>,
    dataplane: Arc<dyn DataPlane>,
    events: Arc<dyn EventHandler>,
) -> (SessionEntry, SessionHandle) {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    let done = CancellationToken::new();

    let peer_session_id = config.peer_session_id.unwrap_or(0);
    let session = Session {
        tunnel_name,
        name: name.clone(),
        config,
        local_tunnel_id,
        session_id,
        call_serial,
        state: State::WaitTunnel,
        peer_tunnel_id: 0,
        peer_session_id,
        engine: None,
        dp: None,
        up: false,
        result: None,
        tunnel_tx,
        socket,
        dataplane,
        events,
    };

    let join = tokio::spawn(session.run(input_rx, kill.clone(), done.clone()));

    let entry = SessionEntry {
        name: name.clone(),
        input_tx: input_tx.clone(),
        kill: kill.clone(),
        join,
    };
    let handle = SessionHandle {
        name,
        session_id,
        input_tx,
        kill,
        done,
    };
    (entry, handle)
}

impl Session {
    async fn run(
        mut self,
        mut input_rx: mpsc::UnboundedReceiver<SessionInput>,
        kill: CancellationToken,
        done: CancellationToken,
    ) {
        info!(
            tunnel = %self.tunnel_name,
            session = %self.name,
            session_id = self.session_id,
            "new session"
        );

        while self.state != State::Dead {
            let deadline = self
                .engine
                .as_ref()
                .and_then(|e| e.poll_deadline())
                .unwrap_or_else(far_future);

            tokio::select! {
                biased;
                _ = kill.cancelled() => {
                    debug!(session = %self.name, "session killed");
                    self.finish(false).await;
                }
                input = input_rx.recv() => match input {
                    Some(input) => self.handle_input(input).await,
                    None => self.close(None).await,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    let now = Instant::now();
                    let actions = match self.engine.as_mut() {
                        Some(engine) => engine.on_timer(now),
                        None => Vec::new(),
                    };
                    self.apply_actions(actions).await;
                }
            }
        }

        done.cancel();
    }

    async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::TunnelOpen { peer_tunnel_id } => {
                if self.state != State::WaitTunnel {
                    return;
                }
                self.peer_tunnel_id = peer_tunnel_id;
                self.send_ctrl(ControlBody::Icrq {
                    assigned_session_id: self.session_id,
                    call_serial: self.call_serial,
                });
                self.state = State::WaitReply;
            }
            SessionInput::Ctrl(msg) => self.handle_ctrl(msg).await,
            SessionInput::Ppp(frame) => self.handle_ppp(frame).await,
            SessionInput::Close { result } => self.close(result).await,
        }
    }

    async fn handle_ctrl(&mut self, msg: ControlMessage) {
        if msg.header.session_id != self.session_id {
            // Mis-delivered; dropping is the safe compromise.
            warn!(
                session = %self.name,
                expected = self.session_id,
                got = msg.header.session_id,
                "control message with wrong session id"
            );
            return;
        }

        debug!(session = %self.name, body = %msg.body, "session control message");

        match (self.state, msg.body) {
            (State::WaitReply, ControlBody::Icrp {
                assigned_session_id,
            }) => self.on_icrp(assigned_session_id).await,
            (State::WaitReply, ControlBody::Cdn { result, .. }) => {
                self.record_result(result.cdn_string());
                self.finish(true).await;
            }
            (State::WaitReply, body @ (ControlBody::Icrq { .. } | ControlBody::Iccn { .. })) => {
                debug!(session = %self.name, %body, "unexpected message, disconnecting");
                self.send_cdn(ResultCode::new(cdn_result::ADMIN_DISCONNECT));
                self.finish(true).await;
            }
            (State::Established, ControlBody::Cdn { result, .. }) => {
                self.record_result(result.cdn_string());
                self.finish(true).await;
            }
            (State::Established, body) => {
                self.send_cdn(ResultCode::with_error(
                    cdn_result::GENERAL_ERROR,
                    l2tp_wire::avp::error_code::BAD_VALUE,
                    format!("unhandled {body} message"),
                ));
                self.finish(true).await;
            }
            (state, body) => {
                trace!(session = %self.name, ?state, %body, "ignoring control message");
            }
        }
    }

    async fn on_icrp(&mut self, peer_session_id: u16) {
        self.peer_session_id = peer_session_id;
        self.send_ctrl(ControlBody::Iccn {
            tx_connect_speed: TX_CONNECT_SPEED,
            framing_type: FRAMING_SYNC,
        });

        let dp = match self.dataplane.new_session(
            self.local_tunnel_id,
            self.peer_tunnel_id,
            &self.config,
        ) {
            Ok(dp) => dp,
            Err(err) => {
                error!(session = %self.name, %err, "failed to establish data plane");
                self.send_cdn(ResultCode::with_error(
                    cdn_result::GENERAL_ERROR,
                    l2tp_wire::avp::error_code::NO_RESOURCE,
                    "data plane setup failed",
                ));
                self.finish(true).await;
                return;
            }
        };
        self.dp = Some(dp);

        self.engine = Some(PppEngine::new(
            self.config.peer_id.clone(),
            self.config.password.clone(),
            rand::random(),
        ));
        self.state = State::Established;
        info!(
            session = %self.name,
            peer_session_id,
            "control plane established"
        );
    }

    async fn handle_ppp(&mut self, frame: PppFrame) {
        if self.state != State::Established {
            trace!(session = %self.name, "dropping PPP frame before establishment");
            return;
        }

        if frame.protocol == PppProtocol::Ipv4 {
            // Inbound IPv4 goes straight to the data plane.
            if let Some(dp) = &self.dp {
                if let Err(err) = dp.handle_inbound(&frame.payload) {
                    debug!(session = %self.name, %err, "data plane rejected inbound packet");
                }
            }
            return;
        }

        let now = Instant::now();
        let actions = match self.engine.as_mut() {
            Some(engine) => engine.handle_frame(&frame, now),
            None => Vec::new(),
        };
        self.apply_actions(actions).await;
    }

    async fn apply_actions(&mut self, actions: Vec<PppAction>) {
        for action in actions {
            if self.state == State::Dead {
                break;
            }
            match action {
                PppAction::Send(frame) => self.send_data(frame).await,
                PppAction::Up(addr) => {
                    let Some(dp) = self.dp.clone() else { continue };
                    match dp.start(addr) {
                        Ok(()) => {
                            self.up = true;
                            let interface_name = dp.interface_name().unwrap_or_default();
                            info!(
                                session = %self.name,
                                %addr,
                                interface = %interface_name,
                                "data plane established"
                            );
                            self.events.handle_event(&Event::SessionUp {
                                tunnel_name: self.tunnel_name.clone(),
                                session_name: self.name.clone(),
                                interface_name,
                            });
                        }
                        Err(err) => {
                            error!(session = %self.name, %err, "data plane start failed");
                            self.send_cdn(ResultCode::with_error(
                                cdn_result::GENERAL_ERROR,
                                l2tp_wire::avp::error_code::NO_RESOURCE,
                                "data plane start failed",
                            ));
                            self.finish(true).await;
                        }
                    }
                }
                PppAction::AuthFailed(message) => {
                    warn!(session = %self.name, %message, "authentication rejected");
                    self.send_cdn(ResultCode::with_error(
                        cdn_result::GENERAL_ERROR,
                        l2tp_wire::avp::error_code::NO_ERROR,
                        format!("PAP authentication failed: {message}"),
                    ));
                    self.finish(true).await;
                }
                PppAction::PeerTerminated => {
                    debug!(session = %self.name, "peer terminated PPP link");
                    self.send_cdn(ResultCode::new(cdn_result::ADMIN_DISCONNECT));
                    self.finish(true).await;
                }
                PppAction::Failed(message) => {
                    warn!(session = %self.name, %message, "PPP negotiation failed");
                    self.send_cdn(ResultCode::with_error(
                        cdn_result::GENERAL_ERROR,
                        l2tp_wire::avp::error_code::NO_ERROR,
                        message,
                    ));
                    self.finish(true).await;
                }
            }
        }
    }

    async fn close(&mut self, result: Option<ResultCode>) {
        match self.state {
            State::WaitTunnel => self.finish(true).await,
            State::WaitReply | State::Established => {
                let rc = result.unwrap_or_else(|| ResultCode::new(cdn_result::ADMIN_DISCONNECT));
                self.send_cdn(rc);
                self.finish(true).await;
            }
            State::Dead => {}
        }
    }

    /// Common teardown. When `graceful`, an established PPP link gets
    /// a Terminate-Request before the session goes away.
    async fn finish(&mut self, graceful: bool) {
        if self.state == State::Dead {
            return;
        }

        if let Some(dp) = self.dp.take() {
            if let Err(err) = dp.down() {
                error!(session = %self.name, %err, "data plane down failed");
            }
        }

        if graceful && self.up {
            let frame = match self.engine.as_mut() {
                Some(engine) => Some(engine.terminate_request()),
                None => None,
            };
            if let Some(frame) = frame {
                self.send_data(frame).await;
            }
        }

        self.events.handle_event(&Event::SessionDown {
            tunnel_name: self.tunnel_name.clone(),
            session_name: self.name.clone(),
            result: self.result.clone().unwrap_or_default(),
        });

        let _ = self
            .tunnel_tx
            .send(TunnelCmd::UnlinkSession(self.session_id));
        self.state = State::Dead;
        info!(session = %self.name, "close");
    }

    fn record_result(&mut self, result: String) {
        if self.result.is_none() {
            self.result = Some(result);
        }
    }

    fn send_cdn(&mut self, result: ResultCode) {
        self.record_result(result.cdn_string());
        self.send_ctrl(ControlBody::Cdn {
            assigned_session_id: self.session_id,
            result,
        });
    }

    fn send_ctrl(&mut self, body: ControlBody) {
        // The tunnel stamps the peer tunnel id at enqueue time.
        let msg = ControlMessage::new(0, self.peer_session_id, body);
        let _ = self.tunnel_tx.send(TunnelCmd::SendCtrl(msg));
    }

    async fn send_data(&mut self, frame: PppFrame) {
        let msg = DataMessage::new(self.peer_tunnel_id, self.peer_session_id, frame.encode());
        if let Err(err) = self.socket.send(&msg.encode()).await {
            debug!(session = %self.name, %err, "data message send failed");
        }
    }
}
