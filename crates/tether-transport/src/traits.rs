use std::future::Future;
use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::device::DeviceId;
use crate::error::Result;

/// A transport able to open passive channels and dial devices.
///
/// Implementations only establish byte streams; framing and delegate events
/// are layered on top by [`Channel`](crate::Channel). Completion of `listen`
/// and `connect` is the resolution of the returned future, so callers on an
/// event loop spawn them and feed the result back as an event.
pub trait Transport: Send + Sync + 'static {
    /// Connected, bidirectional byte stream.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Passive channel returned by [`Transport::listen`].
    type Listener: TransportListener<Stream = Self::Stream>;

    /// Open a passive channel bound to `address:port`.
    fn listen(
        &self,
        port: u16,
        address: IpAddr,
    ) -> impl Future<Output = Result<Self::Listener>> + Send;

    /// Dial `port` on `device` over this transport.
    fn connect(
        &self,
        port: u16,
        device: DeviceId,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Transport name for diagnostics.
    fn name(&self) -> &'static str;
}

/// A bound passive channel yielding accepted connections.
pub trait TransportListener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next inbound connection and the address it came from.
    fn accept(&mut self) -> impl Future<Output = Result<(Self::Stream, SocketAddr)>> + Send;

    /// The address this listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;
}
