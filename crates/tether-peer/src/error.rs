use tether_registry::RegistryError;
use tether_transport::{DeviceId, TransportError};

/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// The passive channel could not be opened.
    #[error("failed to listen on port {port}: {source}")]
    TransportListen {
        port: u16,
        #[source]
        source: TransportError,
    },

    /// A dial to a device failed. Recovered by the reconnect loop.
    #[error("failed to connect to device {device}: {source}")]
    TransportConnect {
        device: DeviceId,
        #[source]
        source: TransportError,
    },

    /// A frame could not be written to the active channel.
    #[error("failed to send frame of type {type_id}: {source}")]
    TransportSend {
        type_id: u32,
        #[source]
        source: TransportError,
    },

    /// Packet encoding failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// No channel is connected.
    #[error("not connected")]
    NotConnected,

    /// `start` was called more than once.
    #[error("peer connection already started")]
    AlreadyStarted,

    /// `start` was called outside a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The control loop has shut down.
    #[error("peer connection stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, PeerError>;
