use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tether_frame::{FrameEnvelope, NO_TAG};
use tether_registry::{PacketRegistry, TypedPacket};
use tether_transport::{DeviceCallback, DeviceId, DeviceMonitor, Transport};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::DropGuard;
use tracing::debug;

use crate::config::PeerConfig;
use crate::error::{PeerError, Result};
use crate::event::Event;
use crate::manager::ConnectionManager;
use crate::sink::PeerEventSink;
use crate::state::{ConnectionState, Role, Snapshot};

/// One logical peer link in the host or client role.
///
/// Created once, configured with the `with_*` builders, then started with
/// [`PeerConnection::start`]. State is observed through [`snapshot`] or
/// [`watch`]; frames are sent with the `send*` family. Dropping the
/// connection stops its control task.
///
/// [`snapshot`]: PeerConnection::snapshot
/// [`watch`]: PeerConnection::watch
pub struct PeerConnection<T: Transport> {
    role: Role,
    transport: Arc<T>,
    sink: Arc<dyn PeerEventSink>,
    config: PeerConfig,
    monitor: Option<Arc<dyn DeviceMonitor>>,
    registry: Arc<PacketRegistry>,
    snapshot: Arc<watch::Sender<Snapshot>>,
    lifecycle: Mutex<Lifecycle<T>>,
}

enum Lifecycle<T: Transport> {
    NotStarted,
    Running(Running<T>),
    Stopped,
}

struct Running<T: Transport> {
    events: mpsc::UnboundedSender<Event<T::Stream>>,
    task: JoinHandle<()>,
    _stop_on_drop: DropGuard,
}

impl<T: Transport> PeerConnection<T> {
    pub fn new(role: Role, transport: T, sink: Arc<dyn PeerEventSink>) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        Self {
            role,
            transport: Arc::new(transport),
            sink,
            config: PeerConfig::default(),
            monitor: None,
            registry: Arc::new(PacketRegistry::new()),
            snapshot: Arc::new(snapshot),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        }
    }

    pub fn with_config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    /// Device monitor consulted by the host role. Ignored by clients.
    pub fn with_monitor(mut self, monitor: Arc<dyn DeviceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Registry used by [`send_value`](PeerConnection::send_value).
    pub fn with_registry(mut self, registry: Arc<PacketRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Start the control task on the current tokio runtime.
    ///
    /// `port` is the port devices are dialed on and, unless
    /// [`PeerConfig::listen_port`] overrides it, the passive channel port.
    pub fn start(&self, port: u16) -> Result<()> {
        let handle = Handle::try_current().map_err(|_| PeerError::NoRuntime)?;

        let mut lifecycle = lock(&self.lifecycle);
        if !matches!(*lifecycle, Lifecycle::NotStarted) {
            return Err(PeerError::AlreadyStarted);
        }

        let (events, queue) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(
            self.role,
            port,
            self.config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.sink),
            events.clone(),
            Arc::clone(&self.snapshot),
        );

        if self.role == Role::Host {
            if let Some(monitor) = &self.monitor {
                let forward = events.clone();
                let callback: DeviceCallback = Arc::new(move |event| {
                    // Fails only once the control task is gone.
                    let _ = forward.send(Event::Device(event));
                });
                manager = manager.with_subscription(monitor.subscribe(callback));
            }
        }

        let stop = manager.shutdown_token();
        let task = handle.spawn(manager.run(queue));
        *lifecycle = Lifecycle::Running(Running {
            events,
            task,
            _stop_on_drop: stop.drop_guard(),
        });
        Ok(())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> Snapshot {
        *self.snapshot.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn current_device(&self) -> Option<DeviceId> {
        self.snapshot.borrow().device
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to snapshot changes.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    /// Send an untagged frame.
    pub async fn send(&self, type_id: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.send_tagged(type_id, NO_TAG, payload).await
    }

    /// Send a frame and wait until it is written to the channel.
    ///
    /// Fails with [`PeerError::NotConnected`] without waiting when no channel
    /// is connected. Frames are never queued for a later connection.
    pub async fn send_tagged(&self, type_id: u32, tag: u32, payload: impl Into<Bytes>) -> Result<()> {
        if !self.is_connected() {
            return Err(PeerError::NotConnected);
        }
        let events = self.events()?;

        let (reply, receipt) = oneshot::channel();
        let frame = FrameEnvelope::tagged(type_id, tag, payload);
        events
            .send(Event::Send { frame, reply })
            .map_err(|_| PeerError::Stopped)?;

        let receipt = receipt.await.map_err(|_| PeerError::Stopped)??;
        receipt
            .wait()
            .await
            .map_err(|source| PeerError::TransportSend { type_id, source })
    }

    /// Encode `value` with the registry binding for `type_id` and send it.
    pub async fn send_value<V: 'static>(&self, value: &V, type_id: u32) -> Result<()> {
        let payload = self.registry.encode(value, type_id)?;
        self.send(type_id, payload).await
    }

    /// Send a packet under its own type id.
    pub async fn send_packet<P: TypedPacket + 'static>(&self, packet: &P) -> Result<()> {
        self.send_value(packet, P::TYPE_ID).await
    }

    /// Stop the control task and wait for it to finish.
    ///
    /// Closes the channel and the passive listener, cancels pending retries,
    /// and releases the monitor subscription. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let running = {
            let mut lifecycle = lock(&self.lifecycle);
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    *lifecycle = other;
                    return Ok(());
                }
            }
        };

        let Running {
            events,
            task,
            _stop_on_drop: stop_guard,
        } = running;
        // Queued behind already pending events.
        let _ = events.send(Event::Shutdown);
        drop(events);

        if let Err(err) = task.await {
            debug!(error = %err, "control task ended abnormally");
        }
        drop(stop_guard);
        Ok(())
    }

    fn events(&self) -> Result<mpsc::UnboundedSender<Event<T::Stream>>> {
        match &*lock(&self.lifecycle) {
            Lifecycle::Running(running) => Ok(running.events.clone()),
            Lifecycle::NotStarted => Err(PeerError::NotConnected),
            Lifecycle::Stopped => Err(PeerError::Stopped),
        }
    }
}

impl<T: Transport> std::fmt::Debug for PeerConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("role", &self.role)
            .field("transport", &self.transport.name())
            .field("snapshot", &self.snapshot())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn lock<L>(lifecycle: &Mutex<L>) -> MutexGuard<'_, L> {
    lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::time::Duration;

    use bytes::BytesMut;
    use serde::{Deserialize, Serialize};
    use tether_frame::{decode_header, encode_frame, HEADER_SIZE};
    use tether_transport::{
        DeviceEvent, ManualDeviceMonitor, MemoryDevice, MemoryTransport, Subscription,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Notify;

    use super::*;

    const PORT: u16 = 9000;
    const WAIT: Duration = Duration::from_secs(30);

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Data(u32, Bytes),
        Connection(bool),
    }

    #[derive(Default)]
    struct RecordingSink {
        rejected: HashSet<u32>,
        seen: Mutex<Vec<Seen>>,
        notify: Notify,
    }

    impl RecordingSink {
        fn rejecting(types: &[u32]) -> Self {
            Self {
                rejected: types.iter().copied().collect(),
                ..Self::default()
            }
        }

        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }

        fn connection_changes(&self) -> Vec<bool> {
            self.seen()
                .into_iter()
                .filter_map(|seen| match seen {
                    Seen::Connection(connected) => Some(connected),
                    Seen::Data(..) => None,
                })
                .collect()
        }

        fn record(&self, seen: Seen) {
            self.seen.lock().unwrap().push(seen);
            self.notify.notify_one();
        }

        async fn wait_for_len(&self, len: usize) {
            tokio::time::timeout(WAIT, async {
                while self.seen.lock().unwrap().len() < len {
                    self.notify.notified().await;
                }
            })
            .await
            .expect("sink events did not arrive");
        }
    }

    impl PeerEventSink for RecordingSink {
        fn should_accept_data_of_type(&self, type_id: u32) -> bool {
            !self.rejected.contains(&type_id)
        }

        fn did_receive_data(&self, payload: Bytes, type_id: u32) {
            self.record(Seen::Data(type_id, payload));
        }

        fn did_change_connection(&self, connected: bool) {
            self.record(Seen::Connection(connected));
        }
    }

    /// Monitor that forwards whatever the test emits, duplicates included.
    #[derive(Default)]
    struct ScriptedMonitor {
        callbacks: Mutex<Vec<DeviceCallback>>,
    }

    impl ScriptedMonitor {
        fn emit(&self, event: DeviceEvent) {
            for callback in self.callbacks.lock().unwrap().iter() {
                callback(event);
            }
        }
    }

    impl DeviceMonitor for ScriptedMonitor {
        fn subscribe(&self, callback: DeviceCallback) -> Subscription {
            self.callbacks.lock().unwrap().push(callback);
            Subscription::empty()
        }
    }

    struct Harness {
        transport: MemoryTransport,
        monitor: ManualDeviceMonitor,
        sink: Arc<RecordingSink>,
        peer: PeerConnection<MemoryTransport>,
    }

    fn host() -> Harness {
        host_with(RecordingSink::default(), PeerConfig::default())
    }

    fn host_with(sink: RecordingSink, config: PeerConfig) -> Harness {
        let transport = MemoryTransport::new();
        let monitor = ManualDeviceMonitor::new();
        let sink = Arc::new(sink);
        let peer = PeerConnection::new(Role::Host, transport.clone(), sink.clone())
            .with_config(config)
            .with_monitor(Arc::new(monitor.clone()));
        Harness {
            transport,
            monitor,
            sink,
            peer,
        }
    }

    async fn wait_until(peer: &PeerConnection<MemoryTransport>, check: impl Fn(&Snapshot) -> bool) {
        let mut rx = peer.watch();
        tokio::time::timeout(WAIT, rx.wait_for(|snapshot| check(snapshot)))
            .await
            .expect("timed out waiting for snapshot")
            .expect("snapshot channel closed");
    }

    async fn wait_for_state(peer: &PeerConnection<MemoryTransport>, state: ConnectionState) {
        wait_until(peer, |snapshot| snapshot.state == state).await;
    }

    async fn connect_device(h: &Harness, id: u64) -> (MemoryDevice, DuplexStream) {
        let device = h.transport.add_device(DeviceId(id));
        h.monitor.attach(DeviceId(id));
        wait_for_state(&h.peer, ConnectionState::Connected).await;
        let far = device.accept().await.expect("device end of the dial");
        (device, far)
    }

    async fn write_frame(stream: &mut DuplexStream, type_id: u32, payload: &[u8]) {
        let mut buf = BytesMut::new();
        encode_frame(type_id, NO_TAG, payload, &mut buf).unwrap();
        stream.write_all(&buf).await.unwrap();
    }

    async fn read_frame(stream: &mut DuplexStream) -> FrameEnvelope {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await.unwrap();
        let header = decode_header(&header, usize::MAX).unwrap().unwrap();
        let mut payload = vec![0u8; header.payload_size as usize];
        stream.read_exact(&mut payload).await.unwrap();
        FrameEnvelope::tagged(header.type_id, header.tag, payload)
    }

    #[tokio::test(start_paused = true)]
    async fn host_starts_listening() {
        let h = host();
        assert_eq!(h.peer.state(), ConnectionState::Idle);

        h.peer.start(PORT).unwrap();
        wait_until(&h.peer, |s| s.listen_addr.is_some()).await;

        let snapshot = h.peer.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Listening);
        assert_eq!(snapshot.listen_addr.unwrap().port(), PORT);
        assert!(h.transport.is_listening(PORT));
        assert_eq!(h.monitor.subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_connects_and_reports_once() {
        let h = host();
        h.peer.start(PORT).unwrap();

        let (device, _far) = connect_device(&h, 5).await;

        assert_eq!(h.peer.current_device(), Some(DeviceId(5)));
        assert!(h.peer.is_connected());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.sink.connection_changes(), vec![true]);
        assert_eq!(device.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_replayed_for_devices_present_before_start() {
        let h = host();
        h.transport.add_device(DeviceId(3));
        h.monitor.attach(DeviceId(3));

        h.peer.start(PORT).unwrap();
        wait_for_state(&h.peer, ConnectionState::Connected).await;
        assert_eq!(h.peer.current_device(), Some(DeviceId(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_end_schedules_one_retry_after_delay() {
        let h = host();
        h.peer.start(PORT).unwrap();
        let (device, far) = connect_device(&h, 5).await;

        drop(far);
        wait_for_state(&h.peer, ConnectionState::Reconnecting).await;
        h.sink.wait_for_len(2).await;
        assert_eq!(h.sink.connection_changes(), vec![true, false]);
        assert_eq!(h.peer.current_device(), Some(DeviceId(5)));

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(device.connect_attempts(), 1);

        wait_for_state(&h.peer, ConnectionState::Connected).await;
        assert_eq!(device.connect_attempts(), 2);
        assert_eq!(h.sink.connection_changes(), vec![true, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_before_retry_makes_retry_a_no_op() {
        let h = host();
        h.peer.start(PORT).unwrap();
        let (device, far) = connect_device(&h, 5).await;

        drop(far);
        wait_for_state(&h.peer, ConnectionState::Reconnecting).await;
        h.monitor.detach(DeviceId(5));
        wait_for_state(&h.peer, ConnectionState::Listening).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        let snapshot = h.peer.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Listening);
        assert_eq!(snapshot.device, None);
        assert_eq!(device.connect_attempts(), 1);
        assert_eq!(h.sink.connection_changes(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dials_retry_until_device_answers() {
        let h = host();
        let device = h.transport.add_device(DeviceId(8));
        device.fail_next(2);
        h.peer.start(PORT).unwrap();

        h.monitor.attach(DeviceId(8));
        wait_for_state(&h.peer, ConnectionState::Connected).await;

        assert_eq!(device.connect_attempts(), 3);
        assert_eq!(h.sink.connection_changes(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_attach_does_not_dial_twice() {
        let transport = MemoryTransport::new();
        let device = transport.add_device(DeviceId(5));
        device.set_connect_delay(Duration::from_millis(500));
        let monitor = Arc::new(ScriptedMonitor::default());
        let sink = Arc::new(RecordingSink::default());
        let peer = PeerConnection::new(Role::Host, transport.clone(), sink.clone())
            .with_monitor(monitor.clone());
        peer.start(PORT).unwrap();

        monitor.emit(DeviceEvent::Attached(DeviceId(5)));
        wait_for_state(&peer, ConnectionState::Connecting).await;
        monitor.emit(DeviceEvent::Attached(DeviceId(5)));

        wait_for_state(&peer, ConnectionState::Connected).await;
        assert_eq!(device.connect_attempts(), 1);
        assert_eq!(sink.connection_changes(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_during_dial_discards_the_result() {
        let h = host();
        let device = h.transport.add_device(DeviceId(5));
        device.set_connect_delay(Duration::from_millis(500));
        h.peer.start(PORT).unwrap();

        h.monitor.attach(DeviceId(5));
        wait_for_state(&h.peer, ConnectionState::Connecting).await;
        h.monitor.detach(DeviceId(5));
        wait_for_state(&h.peer, ConnectionState::Listening).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.peer.snapshot().device, None);
        assert_eq!(h.peer.state(), ConnectionState::Listening);
        assert_eq!(device.connections(), 0);
        assert!(h.sink.seen().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn detach_of_connected_device_returns_to_listening() {
        let h = host();
        h.peer.start(PORT).unwrap();
        let (_device, mut far) = connect_device(&h, 5).await;

        h.monitor.detach(DeviceId(5));
        wait_for_state(&h.peer, ConnectionState::Listening).await;
        assert_eq!(h.peer.current_device(), None);
        h.sink.wait_for_len(2).await;
        assert_eq!(h.sink.connection_changes(), vec![true, false]);

        // The device sees its end closed.
        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_notification_can_be_suppressed() {
        let h = host_with(
            RecordingSink::default(),
            PeerConfig::default().with_notify_on_detach(false),
        );
        h.peer.start(PORT).unwrap();
        let (_device, _far) = connect_device(&h, 5).await;

        h.monitor.detach(DeviceId(5));
        wait_for_state(&h.peer, ConnectionState::Listening).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.sink.connection_changes(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_while_connected_is_ignored() {
        let h = host();
        h.peer.start(PORT).unwrap();
        let (_device, _far) = connect_device(&h, 5).await;

        let other = h.transport.add_device(DeviceId(6));
        h.monitor.attach(DeviceId(6));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(h.peer.current_device(), Some(DeviceId(5)));
        assert_eq!(other.connect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_of_another_device_supersedes_pending_retry() {
        let h = host();
        h.peer.start(PORT).unwrap();
        let (first, far) = connect_device(&h, 5).await;

        drop(far);
        wait_for_state(&h.peer, ConnectionState::Reconnecting).await;
        assert_eq!(h.peer.current_device(), Some(DeviceId(5)));

        let second = h.transport.add_device(DeviceId(6));
        h.monitor.attach(DeviceId(6));
        wait_for_state(&h.peer, ConnectionState::Connected).await;
        assert_eq!(h.peer.current_device(), Some(DeviceId(6)));

        // Well past the retry delay scheduled for device 5.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(first.connect_attempts(), 1);
        assert_eq!(second.connect_attempts(), 1);
        assert_eq!(h.peer.current_device(), Some(DeviceId(6)));
        assert!(h.peer.is_connected());
        assert_eq!(h.sink.connection_changes(), vec![true, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_link_wins_over_dial_in_flight() {
        let h = host();
        let device = h.transport.add_device(DeviceId(5));
        device.set_connect_delay(Duration::from_millis(500));
        h.peer.start(PORT).unwrap();
        wait_until(&h.peer, |s| s.listen_addr.is_some()).await;

        h.monitor.attach(DeviceId(5));
        wait_for_state(&h.peer, ConnectionState::Connecting).await;

        let mut near = h.transport.dial(PORT).unwrap();
        wait_for_state(&h.peer, ConnectionState::Connected).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(device.connections(), 0);
        assert!(device.try_accept().is_none());
        assert_eq!(h.peer.current_device(), None);
        assert_eq!(h.sink.connection_changes(), vec![true]);

        // The accepted link is still the one carrying traffic.
        write_frame(&mut near, 9, b"inbound").await;
        h.sink.wait_for_len(2).await;
        assert_eq!(h.sink.seen()[1], Seen::Data(9, Bytes::from_static(b"inbound")));
        h.peer.send(3, Bytes::from_static(b"out")).await.unwrap();
        let frame = read_frame(&mut near).await;
        assert_eq!(frame.payload.as_ref(), b"out");
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_types_never_reach_the_sink() {
        let h = host_with(RecordingSink::rejecting(&[42]), PeerConfig::default());
        h.peer.start(PORT).unwrap();
        let (_device, mut far) = connect_device(&h, 5).await;

        write_frame(&mut far, 42, &[0xAB; 4096]).await;
        write_frame(&mut far, 7, b"status").await;
        h.sink.wait_for_len(2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            h.sink.seen(),
            vec![
                Seen::Connection(true),
                Seen::Data(7, Bytes::from_static(b"status")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_connection() {
        let h = host();
        assert!(matches!(
            h.peer.send(1, Bytes::from_static(b"x")).await,
            Err(PeerError::NotConnected)
        ));

        h.peer.start(PORT).unwrap();
        wait_for_state(&h.peer, ConnectionState::Listening).await;
        assert!(matches!(
            h.peer.send(1, Bytes::from_static(b"x")).await,
            Err(PeerError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn send_writes_frames_to_the_device() {
        let h = host();
        h.peer.start(PORT).unwrap();
        let (_device, mut far) = connect_device(&h, 5).await;

        h.peer.send(3, Bytes::from_static(b"ping")).await.unwrap();
        h.peer.send_tagged(4, 77, b"tagged".to_vec()).await.unwrap();

        let first = read_frame(&mut far).await;
        assert_eq!((first.type_id, first.tag), (3, NO_TAG));
        assert_eq!(first.payload.as_ref(), b"ping");

        let second = read_frame(&mut far).await;
        assert_eq!((second.type_id, second.tag), (4, 77));
        assert_eq!(second.payload.as_ref(), b"tagged");
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Volume {
        level: u8,
    }

    impl TypedPacket for Volume {
        const TYPE_ID: u32 = 20;
    }

    #[tokio::test(start_paused = true)]
    async fn send_packet_encodes_through_registry() {
        let mut registry = PacketRegistry::new();
        registry.register_packet::<Volume>().unwrap();

        let transport = MemoryTransport::new();
        let monitor = ManualDeviceMonitor::new();
        let sink = Arc::new(RecordingSink::default());
        let peer = PeerConnection::new(Role::Host, transport.clone(), sink)
            .with_monitor(Arc::new(monitor.clone()))
            .with_registry(Arc::new(registry));
        peer.start(PORT).unwrap();

        let device = transport.add_device(DeviceId(1));
        monitor.attach(DeviceId(1));
        wait_for_state(&peer, ConnectionState::Connected).await;
        let mut far = device.accept().await.unwrap();

        peer.send_packet(&Volume { level: 9 }).await.unwrap();
        let frame = read_frame(&mut far).await;
        assert_eq!(frame.type_id, Volume::TYPE_ID);
        assert_eq!(frame.payload.as_ref(), br#"{"level":9}"#);

        assert!(matches!(
            peer.send_value(&Volume { level: 1 }, 21).await,
            Err(PeerError::Registry(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn host_accepts_inbound_links() {
        let h = host();
        h.peer.start(PORT).unwrap();
        wait_until(&h.peer, |s| s.listen_addr.is_some()).await;

        let mut near = h.transport.dial(PORT).unwrap();
        wait_for_state(&h.peer, ConnectionState::Connected).await;
        assert_eq!(h.peer.current_device(), None);

        write_frame(&mut near, 9, b"hi").await;
        h.sink.wait_for_len(2).await;
        assert_eq!(h.sink.seen()[1], Seen::Data(9, Bytes::from_static(b"hi")));

        drop(near);
        wait_for_state(&h.peer, ConnectionState::Listening).await;
        assert_eq!(h.sink.connection_changes(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn client_waits_to_be_dialed_and_goes_idle_on_close() {
        let transport = MemoryTransport::new();
        let monitor = ManualDeviceMonitor::new();
        let sink = Arc::new(RecordingSink::default());
        let peer = PeerConnection::new(Role::Client, transport.clone(), sink.clone())
            .with_monitor(Arc::new(monitor.clone()));
        peer.start(PORT).unwrap();

        wait_for_state(&peer, ConnectionState::WaitingForDevice).await;
        wait_until(&peer, |s| s.listen_addr.is_some()).await;
        assert_eq!(monitor.subscriber_count(), 0);

        let near = transport.dial(PORT).unwrap();
        wait_for_state(&peer, ConnectionState::Connected).await;

        drop(near);
        wait_for_state(&peer, ConnectionState::Idle).await;
        assert_eq!(peer.current_device(), None);
        assert_eq!(sink.connection_changes(), vec![true, false]);

        // Still reachable after going idle.
        let _again = transport.dial(PORT).unwrap();
        wait_for_state(&peer, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn listen_failure_is_retried() {
        let transport = MemoryTransport::new();
        let blocker = transport
            .listen(PORT, std::net::Ipv4Addr::LOCALHOST.into())
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let peer = PeerConnection::new(Role::Client, transport.clone(), sink);
        peer.start(PORT).unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(peer.snapshot().listen_addr, None);

        drop(blocker);
        wait_until(&peer, |s| s.listen_addr.is_some()).await;
        let addr: SocketAddr = peer.snapshot().listen_addr.unwrap();
        assert_eq!(addr.port(), PORT);
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_rejected() {
        let h = host();
        h.peer.start(PORT).unwrap();
        assert!(matches!(h.peer.start(PORT), Err(PeerError::AlreadyStarted)));
    }

    #[test]
    fn start_outside_runtime_fails() {
        let h = host();
        assert!(matches!(h.peer.start(PORT), Err(PeerError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_everything() {
        let h = host();
        h.peer.start(PORT).unwrap();
        let (_device, mut far) = connect_device(&h, 5).await;

        h.peer.shutdown().await.unwrap();

        assert_eq!(h.peer.state(), ConnectionState::Idle);
        assert_eq!(h.monitor.subscriber_count(), 0);
        assert_eq!(h.sink.connection_changes(), vec![true, false]);
        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);

        assert!(matches!(
            h.peer.send(1, Bytes::new()).await,
            Err(PeerError::NotConnected)
        ));
        assert!(matches!(h.peer.start(PORT), Err(PeerError::AlreadyStarted)));
        h.peer.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_connection_stops_the_loop() {
        let h = host();
        h.peer.start(PORT).unwrap();
        let (_device, mut far) = connect_device(&h, 5).await;
        let mut watch = h.peer.watch();

        drop(h.peer);
        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
        tokio::time::timeout(WAIT, watch.wait_for(|s| s.state == ConnectionState::Idle))
            .await
            .unwrap()
            .ok();
    }
}
