//! # l2tp-lac
//!
//! A client-side L2TPv2 access concentrator (RFC 2661) that brings up
//! PPP sessions (RFC 1661) inside its tunnels: LCP configuration, PAP
//! authentication (RFC 1334) and IPCP IPv4 negotiation (RFC 1332).
//! Designed as an embedded VPN engine: the host supplies a data plane
//! backed by a virtual interface descriptor and receives lifecycle
//! events; the engine drives everything between the UDP socket and
//! the negotiated IPv4 hand-off.
//!
//! ## Architecture
//!
//! ```text
//! Context
//!   └── Tunnel task (per tunnel)            owns UDP socket
//!         ├── reliable transport            Ns/Nr, retransmit, ZLB
//!         ├── tunnel FSM                    SCCRQ/SCCRP/SCCCN/StopCCN/Hello
//!         └── Session task (per session)    ICRQ/ICRP/ICCN/CDN
//!               ├── PPP engine              LCP → PAP → IPCP
//!               └── data-plane handle       host virtual interface
//! ```
//!
//! Every tunnel and every session runs its own task; state is never
//! shared across tasks. Sessions reach their tunnel only through its
//! command channel, and the tunnel joins all session tasks before
//! releasing its socket.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use l2tp_lac::{Context, NullDataPlane, NullEventHandler, SessionConfig, TunnelConfig};
//!
//! async fn bring_up() -> l2tp_lac::Result<()> {
//!     let ctx = Context::new(Arc::new(NullDataPlane), Arc::new(NullEventHandler));
//!
//!     let mut tcfg = TunnelConfig::new("192.0.2.1:1701");
//!     tcfg.host_name = Some("client.local".to_string());
//!     let tunnel = ctx.new_tunnel("t1", tcfg).await?;
//!
//!     let scfg = SessionConfig::new("alice", "s3cret");
//!     tunnel.new_session("s1", scfg).await?;
//!
//!     // ... wait for events, then:
//!     ctx.close().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

use tracing::debug;

pub mod config;
pub mod dataplane;
pub mod error;
pub mod events;
mod ppp;
mod session;
mod transport;
mod tunnel;
mod util;

pub use config::{Config, NamedSession, NamedTunnel, SessionConfig, TunnelConfig};
pub use dataplane::{DataPlane, NullDataPlane, SessionDataPlane, SocketFd, TunnelDataPlane};
pub use error::{Error, Result};
pub use events::{Event, EventHandler, NullEventHandler};
pub use session::SessionHandle;
pub use tunnel::TunnelHandle;

struct ContextInner {
    names: HashSet<String>,
    peers: HashSet<SocketAddr>,
    /// Creation order, for reverse-order teardown.
    tunnels: Vec<(String, SocketAddr, TunnelHandle)>,
}

/// Top-level owner of all tunnels.
pub struct Context {
    dataplane: Arc<dyn DataPlane>,
    events: Arc<dyn EventHandler>,
    call_serial: Arc<AtomicU32>,
    inner: Mutex<ContextInner>,
}

impl Context {
    /// Creates a context using the given data-plane factory and event
    /// sink.
    pub fn new(dataplane: Arc<dyn DataPlane>, events: Arc<dyn EventHandler>) -> Self {
        Self {
            dataplane,
            events,
            call_serial: Arc::new(AtomicU32::new(1)),
            inner: Mutex::new(ContextInner {
                names: HashSet::new(),
                peers: HashSet::new(),
                tunnels: Vec::new(),
            }),
        }
    }

    /// Creates a tunnel and starts its control connection. Tunnel
    /// names are unique within the context, and at most one tunnel
    /// may target a given peer address.
    pub async fn new_tunnel(&self, name: &str, config: TunnelConfig) -> Result<TunnelHandle> {
        let peer_addr = resolve_peer(&config.peer_addr).await?;

        {
            let mut inner = self.inner.lock().expect("context lock poisoned");
            if inner.names.contains(name) {
                return Err(Error::TunnelExists(name.to_string()));
            }
            if inner.peers.contains(&peer_addr) {
                return Err(Error::AddressInUse(peer_addr));
            }
            inner.names.insert(name.to_string());
            inner.peers.insert(peer_addr);
        }

        match tunnel::spawn(
            name.to_string(),
            config,
            peer_addr,
            self.dataplane.clone(),
            self.events.clone(),
            self.call_serial.clone(),
        )
        .await
        {
            Ok(handle) => {
                let mut inner = self.inner.lock().expect("context lock poisoned");
                inner
                    .tunnels
                    .push((name.to_string(), peer_addr, handle.clone()));
                Ok(handle)
            }
            Err(err) => {
                let mut inner = self.inner.lock().expect("context lock poisoned");
                inner.names.remove(name);
                inner.peers.remove(&peer_addr);
                Err(err)
            }
        }
    }

    /// Looks up a tunnel by name.
    pub fn tunnel(&self, name: &str) -> Option<TunnelHandle> {
        let inner = self.inner.lock().expect("context lock poisoned");
        inner
            .tunnels
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, handle)| handle.clone())
    }

    /// Instantiates every tunnel and session described by a loaded
    /// configuration.
    pub async fn start(&self, config: &Config) -> Result<()> {
        for tunnel in &config.tunnels {
            let handle = self.new_tunnel(&tunnel.name, tunnel.config.clone()).await?;
            for session in &tunnel.sessions {
                handle
                    .new_session(&session.name, session.config.clone())
                    .await?;
            }
        }
        Ok(())
    }

    /// Gracefully tears down all tunnels in reverse creation order.
    /// Idempotent.
    pub async fn close(&self) {
        loop {
            let entry = {
                let mut inner = self.inner.lock().expect("context lock poisoned");
                inner.tunnels.pop()
            };
            let Some((name, peer_addr, handle)) = entry else {
                break;
            };
            debug!(tunnel = %name, "closing tunnel");
            handle.close().await;
            let mut inner = self.inner.lock().expect("context lock poisoned");
            inner.names.remove(&name);
            inner.peers.remove(&peer_addr);
        }
    }
}

async fn resolve_peer(peer: &str) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(peer)
        .await
        .map_err(|err| Error::Config(format!("cannot resolve peer {peer:?}: {err}")))?;
    addrs
        .next()
        .ok_or_else(|| Error::Config(format!("peer {peer:?} resolved to no addresses")))
}
