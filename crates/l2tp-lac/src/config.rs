//! Tunnel and session configuration.
//!
//! Configuration can be built programmatically or loaded from TOML:
//!
//! ```toml
//! [tunnel.t1]
//! encap = "udp"
//! version = "l2tpv2"
//! peer = "192.0.2.1:1701"
//! host_name = "client.local"
//! hello_timeout = 60000
//! framing_caps = ["sync", "async"]
//!
//! [tunnel.t1.session.s1]
//! pseudowire = "ppp"
//! peer_id = "alice"
//! password = "s3cret"
//! ```
//!
//! Timeouts are integer milliseconds. Only `udp` encapsulation,
//! `l2tpv2` and the `ppp` pseudowire are supported; anything else is
//! rejected at load time.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use l2tp_wire::message::{FRAMING_ASYNC, FRAMING_SYNC};

use crate::error::{Error, Result};

/// Default keepalive interval.
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(60);
/// Default initial retransmission timeout.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(1);
/// Cap for the exponential retransmission backoff.
pub const DEFAULT_MAX_RETRY_TIMEOUT: Duration = Duration::from_secs(8);
/// Default retransmission limit.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default control-channel window size.
pub const DEFAULT_WINDOW_SIZE: u16 = 4;

/// Configuration of one L2TPv2 control connection.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Peer address, `host:port`.
    pub peer_addr: String,
    /// Local address to bind; an ephemeral port on the wildcard
    /// address when unset.
    pub local_addr: Option<String>,
    /// Local tunnel id; allocated when unset.
    pub tunnel_id: Option<u16>,
    /// Expected peer tunnel id; normally learned from SCCRP.
    pub peer_tunnel_id: Option<u16>,
    /// Host Name AVP value; defaults to the tunnel name.
    pub host_name: Option<String>,
    /// Keepalive interval.
    pub hello_timeout: Duration,
    /// Initial retransmission timeout.
    pub retry_timeout: Duration,
    /// Retransmission backoff cap.
    pub max_retry_timeout: Duration,
    /// Retransmissions before the peer is declared unresponsive.
    pub max_retries: u32,
    /// Receive window advertised to the peer.
    pub window_size: u16,
    /// Framing Capabilities AVP bitmask.
    pub framing_caps: u32,
    /// Bearer Capabilities AVP bitmask, omitted when zero.
    pub bearer_caps: u32,
}

impl TunnelConfig {
    /// Configuration with defaults for the given peer.
    pub fn new(peer_addr: impl Into<String>) -> Self {
        Self {
            peer_addr: peer_addr.into(),
            local_addr: None,
            tunnel_id: None,
            peer_tunnel_id: None,
            host_name: None,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            max_retry_timeout: DEFAULT_MAX_RETRY_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            window_size: DEFAULT_WINDOW_SIZE,
            framing_caps: FRAMING_SYNC | FRAMING_ASYNC,
            bearer_caps: 0,
        }
    }
}

/// Configuration of one PPP session inside a tunnel.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local session id; allocated when unset.
    pub session_id: Option<u16>,
    /// Expected peer session id; normally learned from ICRP.
    pub peer_session_id: Option<u16>,
    /// PAP peer id.
    pub peer_id: String,
    /// PAP password.
    pub password: String,
    /// Preferred name for the virtual interface, passed through to
    /// the data plane.
    pub interface_name: Option<String>,
}

impl SessionConfig {
    /// Configuration with defaults for the given credentials.
    pub fn new(peer_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            session_id: None,
            peer_session_id: None,
            peer_id: peer_id.into(),
            password: password.into(),
            interface_name: None,
        }
    }
}

/// A named tunnel with its sessions, as loaded from a config file.
#[derive(Debug, Clone)]
pub struct NamedTunnel {
    pub name: String,
    pub config: TunnelConfig,
    pub sessions: Vec<NamedSession>,
}

/// A named session, as loaded from a config file.
#[derive(Debug, Clone)]
pub struct NamedSession {
    pub name: String,
    pub config: SessionConfig,
}

/// A full configuration: the set of tunnels to bring up.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub tunnels: Vec<NamedTunnel>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    tunnel: BTreeMap<String, RawTunnel>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTunnel {
    encap: Option<String>,
    version: Option<String>,
    peer: String,
    local: Option<String>,
    tid: Option<u16>,
    ptid: Option<u16>,
    host_name: Option<String>,
    hello_timeout: Option<u64>,
    retry_timeout: Option<u64>,
    max_retry_timeout: Option<u64>,
    max_retries: Option<u32>,
    window_size: Option<u16>,
    framing_caps: Option<Vec<String>>,
    #[serde(default)]
    session: BTreeMap<String, RawSession>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSession {
    pseudowire: Option<String>,
    sid: Option<u16>,
    psid: Option<u16>,
    peer_id: String,
    password: String,
    interface_name: Option<String>,
}

impl Config {
    /// Parses a TOML configuration string.
    pub fn parse(input: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(input).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;

        let mut tunnels = Vec::with_capacity(raw.tunnel.len());
        for (name, t) in raw.tunnel {
            tunnels.push(build_tunnel(name, t)?);
        }

        Ok(Self { tunnels })
    }
}

fn build_tunnel(name: String, raw: RawTunnel) -> Result<NamedTunnel> {
    if let Some(encap) = raw.encap.as_deref() {
        if encap != "udp" {
            return Err(Error::Config(format!(
                "tunnel {name:?}: unsupported encap {encap:?} (only \"udp\")"
            )));
        }
    }
    if let Some(version) = raw.version.as_deref() {
        if version != "l2tpv2" {
            return Err(Error::Config(format!(
                "tunnel {name:?}: unsupported version {version:?} (only \"l2tpv2\")"
            )));
        }
    }

    let mut config = TunnelConfig::new(raw.peer);
    config.local_addr = raw.local;
    config.tunnel_id = match raw.tid {
        Some(0) => {
            return Err(Error::Config(format!(
                "tunnel {name:?}: tunnel id must be nonzero"
            )))
        }
        other => other,
    };
    config.peer_tunnel_id = raw.ptid;
    config.host_name = raw.host_name;
    if let Some(ms) = raw.hello_timeout {
        config.hello_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = raw.retry_timeout {
        config.retry_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = raw.max_retry_timeout {
        config.max_retry_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = raw.max_retries {
        config.max_retries = n;
    }
    if let Some(w) = raw.window_size {
        if w == 0 {
            return Err(Error::Config(format!(
                "tunnel {name:?}: window size must be nonzero"
            )));
        }
        config.window_size = w;
    }
    if let Some(caps) = raw.framing_caps {
        config.framing_caps = parse_framing_caps(&name, &caps)?;
    }

    let mut sessions = Vec::with_capacity(raw.session.len());
    for (sname, s) in raw.session {
        sessions.push(build_session(&name, sname, s)?);
    }

    Ok(NamedTunnel {
        name,
        config,
        sessions,
    })
}

fn build_session(tunnel: &str, name: String, raw: RawSession) -> Result<NamedSession> {
    if let Some(pw) = raw.pseudowire.as_deref() {
        if pw != "ppp" {
            return Err(Error::Config(format!(
                "tunnel {tunnel:?} session {name:?}: unsupported pseudowire {pw:?} (only \"ppp\")"
            )));
        }
    }

    let mut config = SessionConfig::new(raw.peer_id, raw.password);
    config.session_id = match raw.sid {
        Some(0) => {
            return Err(Error::Config(format!(
                "tunnel {tunnel:?} session {name:?}: session id must be nonzero"
            )))
        }
        other => other,
    };
    config.peer_session_id = raw.psid;
    config.interface_name = raw.interface_name;

    Ok(NamedSession { name, config })
}

fn parse_framing_caps(tunnel: &str, caps: &[String]) -> Result<u32> {
    let mut out = 0;
    for cap in caps {
        match cap.as_str() {
            "sync" => out |= FRAMING_SYNC,
            "async" => out |= FRAMING_ASYNC,
            other => {
                return Err(Error::Config(format!(
                    "tunnel {tunnel:?}: unknown framing capability {other:?}"
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tunnels_and_sessions() {
        let cfg = Config::parse(
            r#"
            [tunnel.t1]
            encap = "udp"
            version = "l2tpv2"
            peer = "192.0.2.1:1701"
            tid = 412
            ptid = 8192
            host_name = "blackhole.local"
            hello_timeout = 250
            retry_timeout = 250
            max_retries = 2
            window_size = 10
            framing_caps = ["sync"]

            [tunnel.t1.session.s1]
            pseudowire = "ppp"
            sid = 9021
            peer_id = "alice"
            password = "s3cret"
            interface_name = "becky"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.tunnels.len(), 1);
        let t = &cfg.tunnels[0];
        assert_eq!(t.name, "t1");
        assert_eq!(t.config.peer_addr, "192.0.2.1:1701");
        assert_eq!(t.config.tunnel_id, Some(412));
        assert_eq!(t.config.peer_tunnel_id, Some(8192));
        assert_eq!(t.config.host_name.as_deref(), Some("blackhole.local"));
        assert_eq!(t.config.hello_timeout, Duration::from_millis(250));
        assert_eq!(t.config.retry_timeout, Duration::from_millis(250));
        assert_eq!(t.config.max_retries, 2);
        assert_eq!(t.config.window_size, 10);
        assert_eq!(t.config.framing_caps, FRAMING_SYNC);

        assert_eq!(t.sessions.len(), 1);
        let s = &t.sessions[0];
        assert_eq!(s.name, "s1");
        assert_eq!(s.config.session_id, Some(9021));
        assert_eq!(s.config.peer_id, "alice");
        assert_eq!(s.config.password, "s3cret");
        assert_eq!(s.config.interface_name.as_deref(), Some("becky"));
    }

    #[test]
    fn test_defaults_applied() {
        let cfg = Config::parse(
            r#"
            [tunnel.t1]
            peer = "192.0.2.1:1701"
            "#,
        )
        .unwrap();

        let t = &cfg.tunnels[0].config;
        assert_eq!(t.hello_timeout, DEFAULT_HELLO_TIMEOUT);
        assert_eq!(t.retry_timeout, DEFAULT_RETRY_TIMEOUT);
        assert_eq!(t.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(t.window_size, DEFAULT_WINDOW_SIZE);
        assert_eq!(t.framing_caps, FRAMING_SYNC | FRAMING_ASYNC);
        assert_eq!(t.tunnel_id, None);
    }

    #[test]
    fn test_unsupported_values_rejected() {
        assert!(matches!(
            Config::parse("[tunnel.t1]\nencap = \"ip\"\npeer = \"192.0.2.1:1701\"\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::parse("[tunnel.t1]\nversion = \"l2tpv3\"\npeer = \"192.0.2.1:1701\"\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::parse(
                "[tunnel.t1]\npeer = \"192.0.2.1:1701\"\n\
                 [tunnel.t1.session.s1]\npseudowire = \"eth\"\n\
                 peer_id = \"a\"\npassword = \"b\"\n"
            ),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_zero_ids_rejected() {
        assert!(matches!(
            Config::parse("[tunnel.t1]\npeer = \"192.0.2.1:1701\"\ntid = 0\n"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_missing_peer_rejected() {
        assert!(matches!(
            Config::parse("[tunnel.t1]\nhost_name = \"x\"\n"),
            Err(Error::Config(_))
        ));
    }
}
