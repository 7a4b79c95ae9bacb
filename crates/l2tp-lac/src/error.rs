//! Error types for the L2TP engine.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by tunnel and session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the control socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or invalid wire message.
    #[error("protocol error: {0}")]
    Protocol(#[from] l2tp_wire::WireError),

    /// The peer stopped acknowledging control messages.
    #[error("peer unresponsive after {retries} retries")]
    PeerUnresponsive { retries: u32 },

    /// Invalid or unsupported configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// PAP authentication was rejected by the peer.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A tunnel with this name already exists.
    #[error("tunnel {0:?} already exists")]
    TunnelExists(String),

    /// A tunnel to this peer address already exists.
    #[error("a tunnel to {0} already exists")]
    AddressInUse(SocketAddr),

    /// A session with this name or id already exists on the tunnel.
    #[error("session {0:?} already exists")]
    SessionExists(String),

    /// Data-plane callback failed.
    #[error("data plane error: {0}")]
    DataPlane(String),

    /// The target entity has shut down.
    #[error("shut down")]
    Shutdown,
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
