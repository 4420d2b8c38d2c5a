use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tether_frame::FrameConfig;

/// Tunables for a [`PeerConnection`](crate::PeerConnection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Address the passive channel binds to.
    pub listen_address: IpAddr,
    /// Port for the passive channel. `None` uses the port given to `start`.
    pub listen_port: Option<u16>,
    /// Fixed delay before a reconnect dial or a listen retry.
    pub retry_delay: Duration,
    /// Report `did_change_connection(false)` when a device detach tears down
    /// a connected channel.
    pub notify_on_detach: bool,
    /// Frame limits for every channel.
    pub frame: FrameConfig,
}

impl PeerConfig {
    pub fn with_listen_address(mut self, address: IpAddr) -> Self {
        self.listen_address = address;
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_notify_on_detach(mut self, notify: bool) -> Self {
        self.notify_on_detach = notify;
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: None,
            retry_delay: Duration::from_secs(1),
            notify_on_detach: true,
            frame: FrameConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PeerConfig::default();
        assert!(config.listen_address.is_loopback());
        assert_eq!(config.listen_port, None);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert!(config.notify_on_detach);
        assert_eq!(config.frame, FrameConfig::default());
    }

    #[test]
    fn builders_override_fields() {
        let config = PeerConfig::default()
            .with_listen_port(0)
            .with_retry_delay(Duration::from_millis(250))
            .with_notify_on_detach(false)
            .with_frame_config(FrameConfig { max_payload_size: 1024 });

        assert_eq!(config.listen_port, Some(0));
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert!(!config.notify_on_detach);
        assert_eq!(config.frame.max_payload_size, 1024);
    }
}
