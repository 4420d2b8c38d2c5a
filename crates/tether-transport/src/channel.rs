use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tether_frame::{FrameCodec, FrameConfig, FrameEnvelope, FrameFilter};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::DeviceId;
use crate::error::{Result, TransportError};

/// Identifier distinguishing successive channels owned by one manager.
pub type ChannelId = u64;

/// Delegate events emitted by a live [`Channel`].
#[derive(Debug)]
pub enum ChannelEvent {
    /// A complete frame passed the header filter.
    Frame {
        channel: ChannelId,
        frame: FrameEnvelope,
    },
    /// The remote side closed the link or the stream failed.
    ///
    /// Emitted at most once per channel, and never after a local close.
    Ended {
        channel: ChannelId,
        error: Option<TransportError>,
    },
}

impl ChannelEvent {
    /// The channel this event belongs to.
    pub fn channel(&self) -> ChannelId {
        match self {
            ChannelEvent::Frame { channel, .. } | ChannelEvent::Ended { channel, .. } => *channel,
        }
    }
}

/// Options used when adopting a stream as a [`Channel`].
#[derive(Clone)]
pub struct ChannelOptions {
    pub id: ChannelId,
    pub device: Option<DeviceId>,
    pub peer_addr: Option<SocketAddr>,
    pub frame: FrameConfig,
    pub filter: Option<Arc<dyn FrameFilter>>,
}

impl ChannelOptions {
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            device: None,
            peer_addr: None,
            frame: FrameConfig::default(),
            filter: None,
        }
    }

    /// Associate the channel with the device it was dialed on.
    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.device = Some(device);
        self
    }

    /// Record the address an accepted channel came from.
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    /// Install the `shouldAcceptFrame` check applied before payloads are read.
    pub fn with_filter(mut self, filter: Arc<dyn FrameFilter>) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl std::fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("peer_addr", &self.peer_addr)
            .field("frame", &self.frame)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

struct Outbound {
    frame: FrameEnvelope,
    done: oneshot::Sender<Result<()>>,
}

/// Completion of a queued frame write.
#[derive(Debug)]
pub struct SendReceipt {
    rx: oneshot::Receiver<Result<()>>,
}

impl SendReceipt {
    /// Wait until the frame is written (or the write fails).
    ///
    /// A channel closed before the write happened reports
    /// [`TransportError::Closed`].
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(TransportError::Closed))
    }
}

/// A live framed link over an established stream.
///
/// Owns a reader task (frames and end-of-stream become [`ChannelEvent`]s on
/// the owner's queue) and a writer task (frames queued by
/// [`Channel::send_frame`]). Closing or dropping the channel stops both tasks
/// and releases the stream.
pub struct Channel {
    id: ChannelId,
    device: Option<DeviceId>,
    peer_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

impl Channel {
    /// Adopt `stream` and start delivering its events to `events`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S, E>(stream: S, options: ChannelOptions, events: mpsc::UnboundedSender<E>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        E: From<ChannelEvent> + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let mut decoder = FrameCodec::new(options.frame.clone());
        if let Some(filter) = options.filter.clone() {
            decoder = decoder.with_filter(filter);
        }
        let reader = FramedRead::new(read_half, decoder);
        let writer = FramedWrite::new(write_half, FrameCodec::new(options.frame.clone()));

        let cancel = CancellationToken::new();
        let (outbound, queue) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(options.id, reader, events, cancel.clone()));
        tokio::spawn(write_loop(options.id, writer, queue, cancel.clone()));

        debug!(channel = options.id, device = ?options.device, peer = ?options.peer_addr, "channel opened");

        Self {
            id: options.id,
            device: options.device,
            peer_addr: options.peer_addr,
            outbound,
            cancel,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The device this channel was dialed on, if any.
    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    /// The remote address of an accepted channel, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }

    /// Queue a frame for writing. The receipt resolves once it is written.
    pub fn send_frame(&self, frame: FrameEnvelope) -> Result<SendReceipt> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (done, rx) = oneshot::channel();
        self.outbound
            .send(Outbound { frame, done })
            .map_err(|_| TransportError::Closed)?;
        Ok(SendReceipt { rx })
    }

    /// Close the channel without emitting [`ChannelEvent::Ended`].
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(channel = self.id, "closing channel");
            self.cancel.cancel();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

async fn read_loop<S, E>(
    id: ChannelId,
    mut reader: FramedRead<ReadHalf<S>, FrameCodec>,
    events: mpsc::UnboundedSender<E>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite,
    E: From<ChannelEvent>,
{
    let error = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = reader.next() => match next {
                Some(Ok(frame)) => {
                    let event = ChannelEvent::Frame { channel: id, frame };
                    if events.send(event.into()).is_err() {
                        debug!(channel = id, "channel owner gone; closing");
                        cancel.cancel();
                        return;
                    }
                }
                Some(Err(err)) => break Some(TransportError::from(err)),
                None => break None,
            },
        }
    };

    if cancel.is_cancelled() {
        return;
    }
    cancel.cancel();

    match &error {
        Some(err) => debug!(channel = id, error = %err, "channel ended with error"),
        None => debug!(channel = id, "channel ended by remote"),
    }
    let _ = events.send(ChannelEvent::Ended { channel: id, error }.into());
}

async fn write_loop<S>(
    id: ChannelId,
    mut writer: FramedWrite<WriteHalf<S>, FrameCodec>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite,
{
    loop {
        let Outbound { frame, done } = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        let type_id = frame.type_id;
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = writer.send(frame) => result.map_err(TransportError::from),
        };
        if let Err(err) = &result {
            warn!(channel = id, type_id, error = %err, "frame write failed");
        }
        let _ = done.send(result);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use tether_frame::{encode_frame, FrameHeader, NO_TAG};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn wire(type_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(type_id, NO_TAG, payload, &mut buf).unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn delivers_frames_then_end_event() {
        let (near, mut far) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let _channel = Channel::spawn(near, ChannelOptions::new(7), tx);

        far.write_all(&wire(3, b"hello")).await.unwrap();
        drop(far);

        match rx.recv().await.unwrap() {
            ChannelEvent::Frame { channel, frame } => {
                assert_eq!(channel, 7);
                assert_eq!(frame.type_id, 3);
                assert_eq!(frame.payload.as_ref(), b"hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::Ended { channel: 7, error: None }
        ));
    }

    #[tokio::test]
    async fn send_frame_writes_wire_format() {
        let (near, mut far) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let channel = Channel::spawn(near, ChannelOptions::new(1), tx);

        let receipt = channel
            .send_frame(FrameEnvelope::new(11, &b"data"[..]))
            .unwrap();
        receipt.wait().await.unwrap();

        let expected = wire(11, b"data");
        let mut buf = vec![0u8; expected.len()];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn filter_drops_rejected_frames() {
        let (near, mut far) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let filter: Arc<dyn FrameFilter> = Arc::new(|h: &FrameHeader| h.type_id != 42);
        let _channel = Channel::spawn(near, ChannelOptions::new(2).with_filter(filter), tx);

        far.write_all(&wire(42, b"unwanted")).await.unwrap();
        far.write_all(&wire(1, b"wanted")).await.unwrap();
        drop(far);

        match rx.recv().await.unwrap() {
            ChannelEvent::Frame { frame, .. } => assert_eq!(frame.type_id, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), ChannelEvent::Ended { .. }));
    }

    #[tokio::test]
    async fn local_close_emits_no_end_event_and_releases_stream() {
        let (near, mut far) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let channel = Channel::spawn(near, ChannelOptions::new(3), tx);

        channel.close();
        assert!(!channel.is_open());
        assert!(matches!(
            channel.send_frame(FrameEnvelope::new(1, &b"x"[..])),
            Err(TransportError::Closed)
        ));

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), far.read(&mut buf))
            .await
            .expect("far end should observe close")
            .unwrap();
        assert_eq!(read, 0);

        drop(channel);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn malformed_stream_ends_with_error() {
        let (near, mut far) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let _channel = Channel::spawn(near, ChannelOptions::new(4), tx);

        far.write_all(&[0, 0, 0, 9, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ChannelEvent::Ended { channel, error } => {
                assert_eq!(channel, 4);
                assert!(matches!(
                    error,
                    Some(TransportError::Frame(tether_frame::FrameError::UnsupportedVersion(9)))
                ));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
