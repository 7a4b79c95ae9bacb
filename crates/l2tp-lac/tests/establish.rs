//! End-to-end exercises against a scripted LNS on a loopback socket:
//! tunnel and session establishment, PPP bring-up, IPv4 passthrough,
//! peer-initiated disconnect, and retransmission failure.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use l2tp_lac::{
    Context, DataPlane, Event, EventHandler, Result, SessionConfig, SessionDataPlane, SocketFd,
    TunnelConfig, TunnelDataPlane,
};
use l2tp_wire::avp::{cdn_result, error_code, ResultCode};
use l2tp_wire::message::{
    decode_datagram, ControlBody, ControlMessage, DataMessage, Decoded, FRAMING_SYNC,
    PROTOCOL_VERSION_AVP,
};
use l2tp_wire::ppp::{
    encode_options, lcp_opt, parse_options, CpCode, PapCode, PppFrame, PppOption, PppPacket,
    PppProtocol, AUTH_PROTOCOL_PAP,
};
use l2tp_wire::ppp::ipcp_opt;

const LNS_TUNNEL_ID: u16 = 0x4567;
const LNS_SESSION_ID: u16 = 0x0B0B;
const CLIENT_TUNNEL_ID: u16 = 0x0123;
const CLIENT_SESSION_ID: u16 = 0x0A0A;

// ============================================================================
// Test host plumbing
// ============================================================================

struct TestEvents(mpsc::UnboundedSender<Event>);

impl EventHandler for TestEvents {
    fn handle_event(&self, event: &Event) {
        let _ = self.0.send(event.clone());
    }
}

struct TestDataPlane {
    started: mpsc::UnboundedSender<Ipv4Addr>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
}

struct TestTunnelDataPlane;

impl TunnelDataPlane for TestTunnelDataPlane {
    fn down(&self) -> Result<()> {
        Ok(())
    }
}

struct TestSessionDataPlane {
    started: mpsc::UnboundedSender<Ipv4Addr>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl DataPlane for TestDataPlane {
    fn new_tunnel(
        &self,
        _config: &TunnelConfig,
        _local_addr: SocketAddr,
        _peer_addr: SocketAddr,
        _fd: SocketFd,
    ) -> Result<Box<dyn TunnelDataPlane>> {
        Ok(Box::new(TestTunnelDataPlane))
    }

    fn new_session(
        &self,
        _tunnel_id: u16,
        _peer_tunnel_id: u16,
        _config: &SessionConfig,
    ) -> Result<Arc<dyn SessionDataPlane>> {
        Ok(Arc::new(TestSessionDataPlane {
            started: self.started.clone(),
            inbound: self.inbound.clone(),
        }))
    }
}

impl SessionDataPlane for TestSessionDataPlane {
    fn start(&self, addr: Ipv4Addr) -> Result<()> {
        let _ = self.started.send(addr);
        Ok(())
    }

    fn handle_inbound(&self, packet: &[u8]) -> Result<()> {
        let _ = self.inbound.send(packet.to_vec());
        Ok(())
    }

    fn down(&self) -> Result<()> {
        Ok(())
    }

    fn interface_name(&self) -> Result<String> {
        Ok("ppp0".to_string())
    }
}

// ============================================================================
// Scripted LNS
// ============================================================================

struct Lns {
    socket: UdpSocket,
    client: Option<SocketAddr>,
    /// Next sequence number for our control messages.
    ns: u16,
    /// Next sequence number expected from the client.
    nr: u16,
    buf: Vec<u8>,
}

impl Lns {
    async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self {
            socket,
            client: None,
            ns: 0,
            nr: 0,
            buf: vec![0u8; 4096],
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    async fn recv(&mut self) -> Decoded {
        let (n, from) = self.socket.recv_from(&mut self.buf).await.unwrap();
        self.client = Some(from);
        decode_datagram(&self.buf[..n]).unwrap()
    }

    /// Waits for the next new control message, skipping ZLB acks,
    /// retransmitted duplicates and data messages.
    async fn expect_ctrl(&mut self) -> ControlMessage {
        loop {
            let Decoded::Control(messages) = self.recv().await else {
                continue;
            };
            for msg in messages {
                if msg.body == ControlBody::Zlb {
                    continue;
                }
                if (msg.header.ns.wrapping_sub(self.nr) as i16) < 0 {
                    continue; // Duplicate.
                }
                self.nr = msg.header.ns.wrapping_add(1);
                return msg;
            }
        }
    }

    /// Waits for the next PPP frame of the given protocol.
    async fn expect_ppp(&mut self, protocol: PppProtocol) -> PppPacket {
        loop {
            let Decoded::Data(msg) = self.recv().await else {
                continue;
            };
            assert_eq!(msg.header.tunnel_id, LNS_TUNNEL_ID);
            assert_eq!(msg.header.session_id, LNS_SESSION_ID);
            let frame = PppFrame::parse(&msg.payload).unwrap();
            if frame.protocol == protocol {
                return PppPacket::parse(&frame.payload).unwrap();
            }
        }
    }

    async fn send_ctrl(&mut self, session_id: u16, body: ControlBody) {
        let mut msg = ControlMessage::new(CLIENT_TUNNEL_ID, session_id, body);
        msg.header.ns = self.ns;
        msg.header.nr = self.nr;
        self.ns = self.ns.wrapping_add(1);
        self.send_raw(&msg.encode()).await;
    }

    /// Acknowledgement only: carries the sequence state but does not
    /// consume a sequence number.
    async fn send_zlb(&mut self) {
        let mut msg = ControlMessage::new(CLIENT_TUNNEL_ID, 0, ControlBody::Zlb);
        msg.header.ns = self.ns;
        msg.header.nr = self.nr;
        self.send_raw(&msg.encode()).await;
    }

    async fn send_ppp(&mut self, protocol: PppProtocol, packet: PppPacket) {
        let frame = PppFrame::new(protocol, packet.encode());
        let msg = DataMessage::new(CLIENT_TUNNEL_ID, CLIENT_SESSION_ID, frame.encode());
        self.send_raw(&msg.encode()).await;
    }

    async fn send_raw(&self, buf: &[u8]) {
        let client = self.client.expect("no client yet");
        self.socket.send_to(buf, client).await.unwrap();
    }
}

fn cp_packet(code: CpCode, identifier: u8, options: &[PppOption]) -> PppPacket {
    PppPacket::new(code.as_u8(), identifier, encode_options(options))
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_full_establishment_and_disconnect() {
    timeout(Duration::from_secs(30), async {
        let mut lns = Lns::bind().await;

        let (event_tx, mut events) = mpsc::unbounded_channel();
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel();

        let ctx = Context::new(
            Arc::new(TestDataPlane {
                started: started_tx,
                inbound: inbound_tx,
            }),
            Arc::new(TestEvents(event_tx)),
        );

        let mut tcfg = TunnelConfig::new(lns.addr().to_string());
        tcfg.tunnel_id = Some(CLIENT_TUNNEL_ID);
        tcfg.host_name = Some("client.local".to_string());
        let tunnel = ctx.new_tunnel("t1", tcfg).await.unwrap();

        let mut scfg = SessionConfig::new("alice", "s3cret");
        scfg.session_id = Some(CLIENT_SESSION_ID);
        tunnel.new_session("s1", scfg).await.unwrap();

        // --- Tunnel establishment ---------------------------------------
        let sccrq = lns.expect_ctrl().await;
        match sccrq.body {
            ControlBody::Sccrq {
                protocol_version,
                host_name,
                assigned_tunnel_id,
                ..
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION_AVP);
                assert_eq!(host_name, "client.local");
                assert_eq!(assigned_tunnel_id, CLIENT_TUNNEL_ID);
            }
            other => panic!("expected SCCRQ, got {other}"),
        }

        lns.send_ctrl(
            0,
            ControlBody::Sccrp {
                protocol_version: PROTOCOL_VERSION_AVP,
                host_name: "lns.example".to_string(),
                framing_caps: FRAMING_SYNC,
                assigned_tunnel_id: LNS_TUNNEL_ID,
                receive_window_size: Some(4),
                challenge: None,
            },
        )
        .await;

        let scccn = lns.expect_ctrl().await;
        assert_eq!(scccn.body, ControlBody::Scccn);
        assert_eq!(scccn.header.tunnel_id, LNS_TUNNEL_ID);

        assert_eq!(
            events.recv().await.unwrap(),
            Event::TunnelUp {
                tunnel_name: "t1".to_string(),
                local_tunnel_id: CLIENT_TUNNEL_ID,
                peer_tunnel_id: LNS_TUNNEL_ID,
            }
        );

        // --- Session establishment --------------------------------------
        let icrq = lns.expect_ctrl().await;
        match icrq.body {
            ControlBody::Icrq {
                assigned_session_id,
                call_serial,
            } => {
                assert_eq!(assigned_session_id, CLIENT_SESSION_ID);
                assert_eq!(call_serial, 1);
            }
            other => panic!("expected ICRQ, got {other}"),
        }

        lns.send_ctrl(
            CLIENT_SESSION_ID,
            ControlBody::Icrp {
                assigned_session_id: LNS_SESSION_ID,
            },
        )
        .await;

        let iccn = lns.expect_ctrl().await;
        assert_eq!(iccn.header.session_id, LNS_SESSION_ID);
        assert!(matches!(iccn.body, ControlBody::Iccn { .. }));
        lns.send_zlb().await;

        // --- PPP bring-up ------------------------------------------------
        lns.send_ppp(
            PppProtocol::Lcp,
            cp_packet(
                CpCode::ConfigureRequest,
                0x01,
                &[
                    PppOption::from_u16(lcp_opt::AUTH_PROTOCOL, AUTH_PROTOCOL_PAP),
                    PppOption::from_u32(lcp_opt::MAGIC_NUMBER, 0xDEADBEEF),
                    PppOption::from_u16(lcp_opt::MRU, 1400),
                ],
            ),
        )
        .await;

        let ack = lns.expect_ppp(PppProtocol::Lcp).await;
        assert_eq!(ack.code, CpCode::ConfigureAck.as_u8());
        assert_eq!(ack.identifier, 0x01);
        assert_eq!(parse_options(&ack.body).len(), 3);

        let request = lns.expect_ppp(PppProtocol::Lcp).await;
        assert_eq!(request.code, CpCode::ConfigureRequest.as_u8());
        let options = parse_options(&request.body);
        assert_eq!(options[0], PppOption::from_u16(lcp_opt::MRU, 1500));
        assert_eq!(options[1].kind, lcp_opt::MAGIC_NUMBER);

        lns.send_ppp(
            PppProtocol::Lcp,
            PppPacket::new(CpCode::ConfigureAck.as_u8(), request.identifier, request.body),
        )
        .await;

        let auth = lns.expect_ppp(PppProtocol::Pap).await;
        assert_eq!(auth.code, PapCode::AuthenticateRequest.as_u8());
        let (peer_id, password) = l2tp_wire::ppp::parse_pap_request(&auth.body).unwrap();
        assert_eq!(peer_id, "alice");
        assert_eq!(password, "s3cret");

        lns.send_ppp(
            PppProtocol::Pap,
            PppPacket::new(PapCode::AuthenticateAck.as_u8(), auth.identifier, vec![]),
        )
        .await;

        let ipcp = lns.expect_ppp(PppProtocol::Ipcp).await;
        assert_eq!(ipcp.code, CpCode::ConfigureRequest.as_u8());
        assert_eq!(
            parse_options(&ipcp.body),
            vec![PppOption::from_u32(ipcp_opt::IP_ADDRESS, 0)]
        );

        lns.send_ppp(
            PppProtocol::Ipcp,
            cp_packet(
                CpCode::ConfigureNak,
                ipcp.identifier,
                &[PppOption::new(ipcp_opt::IP_ADDRESS, vec![10, 1, 2, 3])],
            ),
        )
        .await;

        let ipcp = lns.expect_ppp(PppProtocol::Ipcp).await;
        assert_eq!(ipcp.code, CpCode::ConfigureRequest.as_u8());
        assert_eq!(
            parse_options(&ipcp.body),
            vec![PppOption::new(ipcp_opt::IP_ADDRESS, vec![10, 1, 2, 3])]
        );

        lns.send_ppp(
            PppProtocol::Ipcp,
            cp_packet(CpCode::ConfigureAck, ipcp.identifier, &[]),
        )
        .await;

        assert_eq!(started.recv().await.unwrap(), Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(
            events.recv().await.unwrap(),
            Event::SessionUp {
                tunnel_name: "t1".to_string(),
                session_name: "s1".to_string(),
                interface_name: "ppp0".to_string(),
            }
        );

        // --- Inbound IPv4 passes through untouched -----------------------
        let packet: Vec<u8> = (0u8..40).collect();
        let frame = PppFrame::new(PppProtocol::Ipv4, packet.clone());
        let msg = DataMessage::new(CLIENT_TUNNEL_ID, CLIENT_SESSION_ID, frame.encode());
        lns.send_raw(&msg.encode()).await;
        assert_eq!(inbound.recv().await.unwrap(), packet);

        // --- Peer-initiated disconnect -----------------------------------
        lns.send_ctrl(
            CLIENT_SESSION_ID,
            ControlBody::Cdn {
                assigned_session_id: LNS_SESSION_ID,
                result: ResultCode::with_error(
                    cdn_result::GENERAL_ERROR,
                    error_code::BAD_VALUE,
                    "xyz",
                ),
            },
        )
        .await;

        assert_eq!(
            events.recv().await.unwrap(),
            Event::SessionDown {
                tunnel_name: "t1".to_string(),
                session_name: "s1".to_string(),
                result: "result 3 (general error), error 6 (field out of range or reserved \
                         field was non-zero), message 'xyz'"
                    .to_string(),
            }
        );

        // --- Graceful shutdown -------------------------------------------
        let close = tokio::spawn(async move {
            ctx.close().await;
        });

        let stopccn = lns.expect_ctrl().await;
        assert!(matches!(stopccn.body, ControlBody::StopCcn { .. }));
        lns.send_zlb().await;

        close.await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::TunnelDown { .. }
        ));
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test]
async fn test_retransmission_gives_up() {
    timeout(Duration::from_secs(30), async {
        // An LNS that never answers.
        let lns = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = lns.local_addr().unwrap();

        let (event_tx, mut events) = mpsc::unbounded_channel();
        let (started_tx, _started) = mpsc::unbounded_channel();
        let (inbound_tx, _inbound) = mpsc::unbounded_channel();
        let ctx = Context::new(
            Arc::new(TestDataPlane {
                started: started_tx,
                inbound: inbound_tx,
            }),
            Arc::new(TestEvents(event_tx)),
        );

        let mut tcfg = TunnelConfig::new(peer.to_string());
        tcfg.retry_timeout = Duration::from_millis(25);
        tcfg.max_retry_timeout = Duration::from_millis(100);
        tcfg.max_retries = 3;
        ctx.new_tunnel("t1", tcfg).await.unwrap();

        // Initial transmission plus three retries.
        let mut buf = [0u8; 4096];
        let mut sccrqs = 0;
        while sccrqs < 4 {
            let (n, _) = lns.recv_from(&mut buf).await.unwrap();
            if let Ok(Decoded::Control(messages)) = decode_datagram(&buf[..n]) {
                sccrqs += messages
                    .iter()
                    .filter(|m| matches!(m.body, ControlBody::Sccrq { .. }))
                    .count();
            }
        }

        assert_eq!(
            events.recv().await.unwrap(),
            Event::TunnelDown {
                tunnel_name: "t1".to_string(),
                result: "result 11 (establish timeout), error 0 (no general error), \
                         message 'unset'"
                    .to_string(),
            }
        );
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test]
async fn test_duplicate_names_and_addresses_rejected() {
    let lns = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let lns2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = lns.local_addr().unwrap();
    let peer2 = lns2.local_addr().unwrap();

    let ctx = Context::new(
        Arc::new(l2tp_lac::NullDataPlane),
        Arc::new(l2tp_lac::NullEventHandler),
    );

    let mut tcfg = TunnelConfig::new(peer.to_string());
    tcfg.retry_timeout = Duration::from_millis(25);
    tcfg.max_retry_timeout = Duration::from_millis(50);
    tcfg.max_retries = 1;
    ctx.new_tunnel("t1", tcfg.clone()).await.unwrap();

    // Same name.
    let mut other = tcfg.clone();
    other.peer_addr = peer2.to_string();
    assert!(matches!(
        ctx.new_tunnel("t1", other).await,
        Err(l2tp_lac::Error::TunnelExists(_))
    ));

    // Same peer address.
    assert!(matches!(
        ctx.new_tunnel("t2", tcfg).await,
        Err(l2tp_lac::Error::AddressInUse(_))
    ));

    ctx.close().await;
}
