//! Data-plane interface provided by the embedding host.
//!
//! The engine drives the control plane only. IPv4 packets negotiated
//! up by a session flow through a host-supplied data plane, typically
//! backed by a virtual interface descriptor. The host wraps outbound
//! IPv4 with the headers produced by
//! [`l2tp_wire::header::encode_data`] plus a PPP header and writes
//! them to the tunnel's control socket (see
//! [`crate::TunnelHandle::control_plane_fd`]).

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::config::{SessionConfig, TunnelConfig};
use crate::error::Result;

/// Raw descriptor of the tunnel's UDP socket, handed to the host so
/// it can apply socket-protect hooks and write data messages.
#[cfg(unix)]
pub type SocketFd = std::os::unix::io::RawFd;
/// Raw descriptor placeholder on non-unix targets.
#[cfg(not(unix))]
pub type SocketFd = i32;

/// Factory for per-tunnel and per-session data planes.
pub trait DataPlane: Send + Sync {
    /// Called when a tunnel's control socket is open.
    fn new_tunnel(
        &self,
        config: &TunnelConfig,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        fd: SocketFd,
    ) -> Result<Box<dyn TunnelDataPlane>>;

    /// Called when a session's control plane is established, before
    /// PPP negotiation begins.
    fn new_session(
        &self,
        tunnel_id: u16,
        peer_tunnel_id: u16,
        config: &SessionConfig,
    ) -> Result<Arc<dyn SessionDataPlane>>;
}

/// Per-tunnel data-plane handle.
pub trait TunnelDataPlane: Send + Sync {
    /// Releases tunnel data-plane resources.
    fn down(&self) -> Result<()>;
}

/// Per-session data-plane handle.
pub trait SessionDataPlane: Send + Sync {
    /// The session negotiated `addr` via IPCP and is live.
    fn start(&self, addr: Ipv4Addr) -> Result<()>;

    /// An IPv4 packet arrived from the peer.
    fn handle_inbound(&self, packet: &[u8]) -> Result<()>;

    /// Releases session data-plane resources. Must be idempotent.
    fn down(&self) -> Result<()>;

    /// Name of the backing virtual interface, if any.
    fn interface_name(&self) -> Result<String>;
}

/// A data plane that accepts everything and does nothing. Useful for
/// tests and for hosts that only care about the control plane.
#[derive(Debug, Default)]
pub struct NullDataPlane;

impl DataPlane for NullDataPlane {
    fn new_tunnel(
        &self,
        _config: &TunnelConfig,
        _local_addr: SocketAddr,
        _peer_addr: SocketAddr,
        _fd: SocketFd,
    ) -> Result<Box<dyn TunnelDataPlane>> {
        Ok(Box::new(NullTunnelDataPlane))
    }

    fn new_session(
        &self,
        _tunnel_id: u16,
        _peer_tunnel_id: u16,
        config: &SessionConfig,
    ) -> Result<Arc<dyn SessionDataPlane>> {
        Ok(Arc::new(NullSessionDataPlane {
            interface_name: config.interface_name.clone().unwrap_or_default(),
        }))
    }
}

struct NullTunnelDataPlane;

impl TunnelDataPlane for NullTunnelDataPlane {
    fn down(&self) -> Result<()> {
        Ok(())
    }
}

struct NullSessionDataPlane {
    interface_name: String,
}

impl SessionDataPlane for NullSessionDataPlane {
    fn start(&self, _addr: Ipv4Addr) -> Result<()> {
        Ok(())
    }

    fn handle_inbound(&self, _packet: &[u8]) -> Result<()> {
        Ok(())
    }

    fn down(&self) -> Result<()> {
        Ok(())
    }

    fn interface_name(&self) -> Result<String> {
        Ok(self.interface_name.clone())
    }
}
