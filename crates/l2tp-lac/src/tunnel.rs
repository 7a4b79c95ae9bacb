//! L2TPv2 control connection (RFC 2661 section 7.2, LAC role).
//!
//! Each tunnel runs one task that owns the UDP socket, the reliable
//! transport and the child session map. The task multiplexes socket
//! reads, host commands, transport deadlines and the hello timer;
//! all tunnel state transitions happen on this task.
//!
//! States: `idle → waitctlreply → established → closing → dead`.
//!
//! Sessions never touch tunnel state: control messages from sessions
//! arrive over the command channel and are stamped with the peer
//! tunnel id when they enter the transport. On teardown the tunnel
//! closes every child session and joins their tasks before it lets
//! go of the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use l2tp_wire::avp::{cdn_result, error_code, stopccn_result, ResultCode};
use l2tp_wire::message::{
    decode_datagram, ControlBody, ControlMessage, DataMessage, Decoded, PROTOCOL_VERSION_AVP,
};
use l2tp_wire::ppp::PppFrame;
use l2tp_wire::WireError;

use crate::config::{SessionConfig, TunnelConfig};
use crate::dataplane::{DataPlane, SocketFd, TunnelDataPlane};
use crate::error::{Error, Result};
use crate::events::{Event, EventHandler};
use crate::session::{self, SessionEntry, SessionHandle, SessionInput};
use crate::transport::{Transport, TransportConfig};
use crate::util::far_future;

/// Largest datagram the control socket will accept.
const MAX_DATAGRAM: usize = 4096;

/// Commands delivered to a tunnel task.
pub(crate) enum TunnelCmd {
    NewSession {
        name: String,
        config: SessionConfig,
        reply: oneshot::Sender<Result<SessionHandle>>,
    },
    /// A control message from a session; the tunnel stamps the peer
    /// tunnel id and hands it to the reliable transport.
    SendCtrl(ControlMessage),
    UnlinkSession(u16),
    Close,
}

/// Host-facing handle to a tunnel.
#[derive(Clone)]
pub struct TunnelHandle {
    name: String,
    tunnel_id: u16,
    cmd_tx: mpsc::UnboundedSender<TunnelCmd>,
    kill: CancellationToken,
    done: CancellationToken,
    fd: SocketFd,
}

impl TunnelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The local tunnel id.
    pub fn tunnel_id(&self) -> u16 {
        self.tunnel_id
    }

    /// Raw descriptor of the control socket, for socket-protect hooks
    /// and host-side data-message writes.
    pub fn control_plane_fd(&self) -> SocketFd {
        self.fd
    }

    /// Creates a session on this tunnel. The session starts its
    /// establishment exchange as soon as the tunnel is up.
    pub async fn new_session(&self, name: &str, config: SessionConfig) -> Result<SessionHandle> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(TunnelCmd::NewSession {
                name: name.to_string(),
                config,
                reply,
            })
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Gracefully closes the tunnel: sessions are disconnected, a
    /// StopCCN is sent and acknowledged (or times out), and the task
    /// exits. Idempotent.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(TunnelCmd::Close);
        self.done.cancelled().await;
    }

    /// Forces immediate teardown, dropping in-flight retransmissions.
    /// Idempotent.
    pub async fn kill(&self) {
        self.kill.cancel();
        self.done.cancelled().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    WaitCtlReply,
    Established,
    Closing,
    Dead,
}

pub(crate) struct Tunnel {
    name: String,
    config: TunnelConfig,
    tunnel_id: u16,
    peer_tunnel_id: u16,
    state: State,
    xport: Transport,
    socket: Arc<UdpSocket>,
    sessions: HashMap<u16, SessionEntry>,
    /// Join handles of sessions that already unlinked themselves.
    finished: Vec<tokio::task::JoinHandle<()>>,
    hello_at: Instant,
    hello_ns: Option<u16>,
    result: Option<String>,
    tdp: Option<Box<dyn TunnelDataPlane>>,
    dataplane: Arc<dyn DataPlane>,
    events: Arc<dyn EventHandler>,
    call_serial: Arc<AtomicU32>,
    cmd_tx: mpsc::UnboundedSender<TunnelCmd>,
}

/// Binds the control socket, starts the tunnel task and returns its
/// handle. The SCCRQ goes out immediately.
pub(crate) async fn spawn(
    name: String,
    config: TunnelConfig,
    peer_addr: SocketAddr,
    dataplane: Arc<dyn DataPlane>,
    events: Arc<dyn EventHandler>,
    call_serial: Arc<AtomicU32>,
) -> Result<TunnelHandle> {
    let local = match &config.local_addr {
        Some(addr) => addr.clone(),
        None if peer_addr.is_ipv4() => "0.0.0.0:0".to_string(),
        None => "[::]:0".to_string(),
    };
    let socket = UdpSocket::bind(&local).await?;
    socket.connect(peer_addr).await?;
    let local_addr = socket.local_addr()?;

    #[cfg(unix)]
    let fd = {
        use std::os::unix::io::AsRawFd;
        socket.as_raw_fd()
    };
    #[cfg(not(unix))]
    let fd = -1;

    let tunnel_id = match config.tunnel_id {
        Some(id) => id,
        None => loop {
            let id = rand::random::<u16>();
            if id != 0 {
                break id;
            }
        },
    };

    let tdp = dataplane.new_tunnel(&config, local_addr, peer_addr, fd)?;

    let xport = Transport::new(TransportConfig {
        retry_timeout: config.retry_timeout,
        max_retry_timeout: config.max_retry_timeout,
        max_retries: config.max_retries,
        window_size: config.window_size,
    });

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    let done = CancellationToken::new();

    let peer_tunnel_id = config.peer_tunnel_id.unwrap_or(0);
    let tunnel = Tunnel {
        name: name.clone(),
        hello_at: far_future(),
        config,
        tunnel_id,
        peer_tunnel_id,
        state: State::Idle,
        xport,
        socket: Arc::new(socket),
        sessions: HashMap::new(),
        finished: Vec::new(),
        hello_ns: None,
        result: None,
        tdp: Some(tdp),
        dataplane,
        events,
        call_serial,
        cmd_tx: cmd_tx.clone(),
    };

    tokio::spawn(tunnel.run(cmd_rx, kill.clone(), done.clone()));

    Ok(TunnelHandle {
        name,
        tunnel_id,
        cmd_tx,
        kill,
        done,
        fd,
    })
}

impl Tunnel {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<TunnelCmd>,
        kill: CancellationToken,
        done: CancellationToken,
    ) {
        info!(
            tunnel = %self.name,
            tunnel_id = self.tunnel_id,
            peer = %self.config.peer_addr,
            "new tunnel"
        );

        self.send_sccrq();
        self.state = State::WaitCtlReply;

        let socket = self.socket.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut killed = false;

        loop {
            // Flush everything the transport has ready.
            match self.xport.pump(Instant::now()) {
                Ok(datagrams) => {
                    for datagram in datagrams {
                        if let Err(err) = socket.send(&datagram).await {
                            error!(tunnel = %self.name, %err, "control send failed");
                            self.record_result(format!("socket error: {err}"));
                            self.close_sessions(lost_carrier());
                            self.state = State::Dead;
                            break;
                        }
                    }
                }
                Err(err) => {
                    warn!(tunnel = %self.name, %err, "transport gave up");
                    self.on_peer_unresponsive();
                }
            }

            // StopCCN acknowledged: teardown completes.
            if self.state == State::Closing && !self.xport.has_pending() {
                self.state = State::Dead;
            }
            if self.state == State::Dead {
                break;
            }

            let mut deadline = self.xport.poll_deadline().unwrap_or_else(far_future);
            if self.state == State::Established {
                deadline = deadline.min(self.hello_at);
            }

            tokio::select! {
                biased;
                _ = kill.cancelled() => {
                    debug!(tunnel = %self.name, "tunnel killed");
                    self.state = State::Dead;
                    killed = true;
                    break;
                }
                result = socket.recv(&mut buf) => match result {
                    Ok(n) => self.on_datagram(&buf[..n]),
                    Err(err) => {
                        error!(tunnel = %self.name, %err, "control receive failed");
                        self.record_result(format!("socket error: {err}"));
                        self.close_sessions(lost_carrier());
                        self.state = State::Dead;
                    }
                },
                cmd = cmd_rx.recv() => {
                    if let Some(cmd) = cmd {
                        self.on_cmd(cmd);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if self.state == State::Established && Instant::now() >= self.hello_at {
                        self.on_hello_timer();
                    }
                    // Transport deadlines are serviced at the top of
                    // the loop.
                }
            }
        }

        self.teardown(killed).await;
        done.cancel();
    }

    /// Final teardown: unwind the children, then the data plane, then
    /// report. The socket is not released until every session task
    /// has finished.
    async fn teardown(&mut self, killed: bool) {
        for entry in self.sessions.values() {
            if killed {
                entry.kill.cancel();
            } else {
                let _ = entry.input_tx.send(SessionInput::Close {
                    result: Some(lost_carrier()),
                });
            }
        }
        for (_, entry) in self.sessions.drain() {
            let _ = entry.join.await;
        }
        for join in self.finished.drain(..) {
            let _ = join.await;
        }

        if let Some(tdp) = self.tdp.take() {
            if let Err(err) = tdp.down() {
                error!(tunnel = %self.name, %err, "tunnel data plane down failed");
            }
        }

        self.events.handle_event(&Event::TunnelDown {
            tunnel_name: self.name.clone(),
            result: self.result.clone().unwrap_or_default(),
        });
        info!(tunnel = %self.name, "close");
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    fn on_datagram(&mut self, buf: &[u8]) {
        match decode_datagram(buf) {
            Ok(Decoded::Control(messages)) => {
                for msg in messages {
                    if msg.header.tunnel_id != self.tunnel_id && msg.header.tunnel_id != 0 {
                        warn!(
                            tunnel = %self.name,
                            expected = self.tunnel_id,
                            got = msg.header.tunnel_id,
                            "control message with wrong tunnel id"
                        );
                        continue;
                    }
                    for delivered in self.xport.recv(msg) {
                        self.dispatch(delivered);
                        if self.state == State::Dead {
                            return;
                        }
                    }
                }
            }
            Ok(Decoded::Data(msg)) => self.on_data(msg),
            Err(err @ WireError::MandatoryUnknownAvp { .. }) => {
                warn!(tunnel = %self.name, %err, "shutting down");
                self.initiate_close(ResultCode::with_error(
                    stopccn_result::GENERAL_ERROR,
                    error_code::MBIT_SHUTDOWN,
                    err.to_string(),
                ));
            }
            Err(err) => {
                warn!(tunnel = %self.name, %err, "bad control message");
                self.initiate_close(ResultCode::with_error(
                    stopccn_result::GENERAL_ERROR,
                    error_code::BAD_VALUE,
                    format!("bad control message: {err}"),
                ));
            }
        }
    }

    fn dispatch(&mut self, msg: ControlMessage) {
        trace!(tunnel = %self.name, body = %msg.body, ns = msg.header.ns, "control message");

        if msg.body.is_session_scoped() {
            let session_id = msg.header.session_id;
            match self.sessions.get(&session_id) {
                Some(entry) => {
                    let _ = entry.input_tx.send(SessionInput::Ctrl(msg));
                }
                None => {
                    warn!(
                        tunnel = %self.name,
                        session_id,
                        body = %msg.body,
                        "message for unknown session"
                    );
                }
            }
            return;
        }

        self.on_tunnel_msg(msg.body);
    }

    fn on_tunnel_msg(&mut self, body: ControlBody) {
        match (self.state, body) {
            (
                State::WaitCtlReply,
                ControlBody::Sccrp {
                    assigned_tunnel_id,
                    receive_window_size,
                    challenge,
                    ..
                },
            ) => {
                if challenge.is_some() {
                    warn!(tunnel = %self.name, "peer requires challenge authentication");
                    self.initiate_close(ResultCode::with_error(
                        stopccn_result::NOT_AUTHORIZED,
                        error_code::NO_ERROR,
                        "challenge authentication not supported",
                    ));
                    return;
                }

                self.peer_tunnel_id = assigned_tunnel_id;
                self.xport.set_peer_tunnel_id(assigned_tunnel_id);
                if let Some(window) = receive_window_size {
                    self.xport.set_peer_window(window);
                }

                self.enqueue_ctrl(ControlMessage::new(0, 0, ControlBody::Scccn));
                self.state = State::Established;
                self.hello_at = Instant::now() + self.config.hello_timeout;

                info!(
                    tunnel = %self.name,
                    peer_tunnel_id = assigned_tunnel_id,
                    "control connection established"
                );
                self.events.handle_event(&Event::TunnelUp {
                    tunnel_name: self.name.clone(),
                    local_tunnel_id: self.tunnel_id,
                    peer_tunnel_id: assigned_tunnel_id,
                });

                for entry in self.sessions.values() {
                    let _ = entry.input_tx.send(SessionInput::TunnelOpen {
                        peer_tunnel_id: assigned_tunnel_id,
                    });
                }
            }
            (State::WaitCtlReply | State::Established, ControlBody::StopCcn { result, .. }) => {
                warn!(tunnel = %self.name, result = %result.stopccn_string(), "peer stopped tunnel");
                self.record_result(result.stopccn_string());
                self.close_sessions(lost_carrier());
                self.state = State::Dead;
            }
            (State::Established, ControlBody::Hello) => {
                // Acknowledgement rides the transport.
            }
            (State::Closing, ControlBody::StopCcn { .. }) => {
                self.state = State::Dead;
            }
            (State::Closing, body) => {
                trace!(tunnel = %self.name, %body, "ignoring while closing");
            }
            (state, body) => {
                warn!(tunnel = %self.name, ?state, %body, "unexpected control message");
                self.initiate_close(ResultCode::with_error(
                    stopccn_result::GENERAL_ERROR,
                    error_code::BAD_VALUE,
                    format!("unhandled {body} message"),
                ));
            }
        }
    }

    fn on_data(&mut self, msg: DataMessage) {
        if msg.header.tunnel_id != self.tunnel_id {
            warn!(
                tunnel = %self.name,
                expected = self.tunnel_id,
                got = msg.header.tunnel_id,
                "data message with wrong tunnel id"
            );
            return;
        }

        let frame = match PppFrame::parse(&msg.payload) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(tunnel = %self.name, %err, "dropping unparseable data message");
                return;
            }
        };

        match self.sessions.get(&msg.header.session_id) {
            Some(entry) => {
                let _ = entry.input_tx.send(SessionInput::Ppp(frame));
            }
            None => {
                debug!(
                    tunnel = %self.name,
                    session_id = msg.header.session_id,
                    "data message for unknown session"
                );
            }
        }
    }

    // ========================================================================
    // Commands and timers
    // ========================================================================

    fn on_cmd(&mut self, cmd: TunnelCmd) {
        match cmd {
            TunnelCmd::NewSession {
                name,
                config,
                reply,
            } => {
                let result = self.add_session(name, config);
                let _ = reply.send(result);
            }
            TunnelCmd::SendCtrl(msg) => {
                self.enqueue_ctrl(msg);
            }
            TunnelCmd::UnlinkSession(session_id) => {
                if let Some(entry) = self.sessions.remove(&session_id) {
                    self.finished.push(entry.join);
                }
            }
            TunnelCmd::Close => match self.state {
                State::Idle | State::WaitCtlReply | State::Established => {
                    self.close_sessions(ResultCode::new(cdn_result::ADMIN_DISCONNECT));
                    self.initiate_close(ResultCode::new(stopccn_result::CLEAR_CONNECTION));
                }
                State::Closing | State::Dead => {}
            },
        }
    }

    fn add_session(&mut self, name: String, config: SessionConfig) -> Result<SessionHandle> {
        if matches!(self.state, State::Closing | State::Dead) {
            return Err(Error::Shutdown);
        }
        if self.sessions.values().any(|entry| entry.name == name) {
            return Err(Error::SessionExists(name));
        }

        let session_id = match config.session_id {
            Some(id) => {
                if self.sessions.contains_key(&id) {
                    return Err(Error::SessionExists(format!("id {id}")));
                }
                id
            }
            None => loop {
                let id = rand::random::<u16>();
                if id != 0 && !self.sessions.contains_key(&id) {
                    break id;
                }
            },
        };

        let call_serial = self.call_serial.fetch_add(1, Ordering::Relaxed);
        let (entry, handle) = session::spawn(
            self.name.clone(),
            name,
            config,
            self.tunnel_id,
            session_id,
            call_serial,
            self.cmd_tx.clone(),
            self.socket.clone(),
            self.dataplane.clone(),
            self.events.clone(),
        );

        // A session created on an already-open tunnel starts at once.
        if self.state == State::Established {
            let _ = entry.input_tx.send(SessionInput::TunnelOpen {
                peer_tunnel_id: self.peer_tunnel_id,
            });
        }

        self.sessions.insert(session_id, entry);
        Ok(handle)
    }

    fn on_hello_timer(&mut self) {
        if let Some(ns) = self.hello_ns {
            if self.xport.is_unacked(ns) {
                warn!(tunnel = %self.name, "hello unacknowledged for a full interval");
                self.on_peer_unresponsive();
                return;
            }
        }

        let ns = self.enqueue_ctrl(ControlMessage::new(0, 0, ControlBody::Hello));
        self.hello_ns = Some(ns);
        self.hello_at = Instant::now() + self.config.hello_timeout;
    }

    // ========================================================================
    // Outbound and shutdown
    // ========================================================================

    fn send_sccrq(&mut self) {
        let host_name = self
            .config
            .host_name
            .clone()
            .unwrap_or_else(|| self.name.clone());
        self.enqueue_ctrl(ControlMessage::new(
            0,
            0,
            ControlBody::Sccrq {
                protocol_version: PROTOCOL_VERSION_AVP,
                host_name,
                framing_caps: self.config.framing_caps,
                assigned_tunnel_id: self.tunnel_id,
                bearer_caps: (self.config.bearer_caps != 0).then_some(self.config.bearer_caps),
                receive_window_size: Some(self.config.window_size),
                tie_breaker: None,
            },
        ));
    }

    fn enqueue_ctrl(&mut self, mut msg: ControlMessage) -> u16 {
        msg.header.tunnel_id = self.peer_tunnel_id;
        self.xport.enqueue(msg)
    }

    /// Sends a StopCCN and waits for its acknowledgement before the
    /// tunnel goes down.
    fn initiate_close(&mut self, result: ResultCode) {
        if matches!(self.state, State::Closing | State::Dead) {
            return;
        }
        self.record_result(result.stopccn_string());
        self.enqueue_ctrl(ControlMessage::new(
            0,
            0,
            ControlBody::StopCcn {
                assigned_tunnel_id: self.tunnel_id,
                result,
            },
        ));
        self.state = State::Closing;
    }

    fn on_peer_unresponsive(&mut self) {
        self.record_result(ResultCode::new(cdn_result::TIMEOUT).cdn_string());
        self.close_sessions(lost_carrier());
        self.state = State::Dead;
    }

    fn close_sessions(&mut self, result: ResultCode) {
        for entry in self.sessions.values() {
            let _ = entry.input_tx.send(SessionInput::Close {
                result: Some(result.clone()),
            });
        }
    }

    fn record_result(&mut self, result: String) {
        if self.result.is_none() {
            self.result = Some(result);
        }
    }
}

fn lost_carrier() -> ResultCode {
    ResultCode::new(cdn_result::LOST_CARRIER)
}
