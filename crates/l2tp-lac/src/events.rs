//! Events delivered to the embedding host.

/// Lifecycle notifications for tunnels and sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A tunnel's control connection reached the established state.
    TunnelUp {
        tunnel_name: String,
        local_tunnel_id: u16,
        peer_tunnel_id: u16,
    },
    /// A tunnel's control connection went away. `result` renders the
    /// StopCCN result code, or the local failure that ended it.
    TunnelDown {
        tunnel_name: String,
        result: String,
    },
    /// A session finished PPP negotiation and its data plane is live.
    SessionUp {
        tunnel_name: String,
        session_name: String,
        interface_name: String,
    },
    /// An established session went away. `result` renders the CDN
    /// result code, or the local failure that ended it.
    SessionDown {
        tunnel_name: String,
        session_name: String,
        result: String,
    },
}

/// Receives [`Event`]s.
///
/// Handlers are invoked from tunnel and session tasks and must not
/// block; hand events off to a channel for anything slow.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

/// An [`EventHandler`] that discards everything.
#[derive(Debug, Default)]
pub struct NullEventHandler;

impl EventHandler for NullEventHandler {
    fn handle_event(&self, _event: &Event) {}
}
