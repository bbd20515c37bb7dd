//! Connection state and lifecycle events.

use ctlwire_protocol::Inbound;
use std::fmt;
use std::time::Duration;

/// Connection state, owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Disconnecting,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events published on the lifecycle channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// One event per state transition.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A reconnection attempt was scheduled.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Reconnection gave up. Emitted once per exhaustion.
    ReconnectionExhausted { attempts: u32 },
    /// The transport failed to open or dropped.
    TransportError { message: String },
    /// An inbound document could not be decoded; the connection was kept.
    ProtocolError { message: String },
}

/// Receives connection notifications.
///
/// `on_transition` runs while the connection state lock is held, so it must
/// not call back into the connection manager.
pub(crate) trait ConnectionObserver: Send + Sync {
    fn on_transition(&self, from: ConnectionState, to: ConnectionState);

    fn on_inbound(&self, inbound: Inbound);
}
