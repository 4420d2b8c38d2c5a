use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use tether_transport::DeviceId;

/// Which side of the link a [`PeerConnection`](crate::PeerConnection) plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Listens passively and dials attached devices.
    Host,
    /// Listens passively and waits to be dialed.
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Role::Host),
            "client" => Ok(Role::Client),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    /// Host: passive channel open, no device pursued.
    Listening,
    /// Client: passive channel open, waiting to be dialed.
    WaitingForDevice,
    /// Host: first dial to a newly attached device.
    Connecting,
    Connected,
    /// Host: link to the current device broke; re-dialing it.
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Listening => "listening",
            ConnectionState::WaitingForDevice => "waiting_for_device",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    /// Whether a dial to the current device is being pursued.
    pub fn is_dialing(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a connection, published on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub state: ConnectionState,
    /// Device currently pursued or connected by dial.
    pub device: Option<DeviceId>,
    /// Bound address of the passive channel, once listening.
    pub listen_addr: Option<SocketAddr>,
}

impl Snapshot {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Host".parse::<Role>().unwrap(), Role::Host);
        assert_eq!(" client ".parse::<Role>().unwrap(), Role::Client);
        assert!("server".parse::<Role>().is_err());
        assert_eq!(Role::Host.to_string(), "host");
    }

    #[test]
    fn dialing_states() {
        assert!(ConnectionState::Connecting.is_dialing());
        assert!(ConnectionState::Reconnecting.is_dialing());
        assert!(!ConnectionState::Listening.is_dialing());
        assert!(!ConnectionState::Connected.is_dialing());
        assert_eq!(ConnectionState::WaitingForDevice.to_string(), "waiting_for_device");
    }

    #[test]
    fn default_snapshot_is_idle() {
        let snapshot = Snapshot::default();
        assert_eq!(snapshot.state, ConnectionState::Idle);
        assert!(snapshot.device.is_none());
        assert!(!snapshot.is_connected());
    }
}
