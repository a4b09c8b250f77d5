//! Connection state machine

use std::fmt;

/// Disconnected → Signaling → Connected ⇄ Degraded → Disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    /// Channels being set up or the peer not yet heard from
    Signaling,
    Connected,
    /// Connected with bitrate reduction or FEC active
    Degraded,
}

impl ConnectionState {
    pub fn is_up(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }

    /// Start establishing channels
    pub fn begin(self) -> Self {
        match self {
            ConnectionState::Disconnected => ConnectionState::Signaling,
            other => other,
        }
    }

    /// A channel is up and the peer answered
    pub fn established(self) -> Self {
        match self {
            ConnectionState::Signaling | ConnectionState::Disconnected => ConnectionState::Connected,
            other => other,
        }
    }

    /// Apply a metrics verdict; only meaningful while up
    pub fn with_health(self, degraded: bool) -> Self {
        match (self, degraded) {
            (ConnectionState::Connected, true) => ConnectionState::Degraded,
            (ConnectionState::Degraded, false) => ConnectionState::Connected,
            (other, _) => other,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Signaling => "signaling",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(s)
    }
}
