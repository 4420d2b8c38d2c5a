use std::net::SocketAddr;

use tether_frame::FrameEnvelope;
use tether_transport::{ChannelEvent, DeviceEvent, DeviceId, SendReceipt, TransportError};
use tokio::sync::oneshot;

use crate::error::PeerError;

/// Input to the control loop. Every state change is driven by one of these.
pub(crate) enum Event<S> {
    /// Forwarded from the device monitor.
    Device(DeviceEvent),
    /// A dial finished. `attempt` identifies which one.
    ConnectCompleted {
        attempt: u64,
        device: DeviceId,
        result: Result<S, TransportError>,
    },
    /// The passive channel is bound.
    Listening(SocketAddr),
    ListenFailed(PeerError),
    ListenRetryDue,
    /// The passive channel accepted an inbound link.
    Accepted { stream: S, from: SocketAddr },
    Channel(ChannelEvent),
    RetryDue { timer: u64, device: DeviceId },
    Send {
        frame: FrameEnvelope,
        reply: oneshot::Sender<Result<SendReceipt, PeerError>>,
    },
    Shutdown,
}

impl<S> From<ChannelEvent> for Event<S> {
    fn from(event: ChannelEvent) -> Self {
        Event::Channel(event)
    }
}
