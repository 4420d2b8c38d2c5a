//! In-process transport over `tokio::io::duplex` pipes.
//!
//! Devices are scripted through [`MemoryDevice`]: reachability, forced dial
//! failures, dial latency, and access to the far end of every successful
//! dial. Listeners are reachable through [`MemoryTransport::dial`].

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::device::DeviceId;
use crate::error::{Result, TransportError};
use crate::traits::{Transport, TransportListener};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// In-process transport. Cloning shares the same devices and listeners.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
}

struct MemoryInner {
    listeners: HashMap<u16, mpsc::UnboundedSender<(DuplexStream, SocketAddr)>>,
    devices: HashMap<DeviceId, MemoryDevice>,
    buffer_size: usize,
    next_remote_port: u16,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create a transport whose pipes buffer `buffer_size` bytes per direction.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                listeners: HashMap::new(),
                devices: HashMap::new(),
                buffer_size,
                next_remote_port: 49152,
            })),
        }
    }

    /// Register a dialable device, or return the existing handle.
    pub fn add_device(&self, id: DeviceId) -> MemoryDevice {
        lock(&self.inner)
            .devices
            .entry(id)
            .or_insert_with(|| MemoryDevice::new(id))
            .clone()
    }

    pub fn device(&self, id: DeviceId) -> Option<MemoryDevice> {
        lock(&self.inner).devices.get(&id).cloned()
    }

    /// Whether a live listener is bound on `port`.
    pub fn is_listening(&self, port: u16) -> bool {
        lock(&self.inner)
            .listeners
            .get(&port)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Open an inbound connection to the listener on `port`.
    ///
    /// Returns the dialer's end of the pipe.
    pub fn dial(&self, port: u16) -> Result<DuplexStream> {
        let mut inner = lock(&self.inner);
        let from = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), inner.next_remote_port);
        inner.next_remote_port = inner.next_remote_port.checked_add(1).unwrap_or(49152);

        let (near, far) = tokio::io::duplex(inner.buffer_size);
        let delivered = inner
            .listeners
            .get(&port)
            .is_some_and(|tx| tx.send((far, from)).is_ok());
        if !delivered {
            return Err(std::io::Error::new(
                ErrorKind::ConnectionRefused,
                format!("nothing listening on memory port {port}"),
            )
            .into());
        }

        debug!(port, %from, "memory dial delivered");
        Ok(near)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        let mut devices: Vec<_> = inner.devices.keys().copied().collect();
        devices.sort_unstable();
        f.debug_struct("MemoryTransport")
            .field("devices", &devices)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

impl Transport for MemoryTransport {
    type Stream = DuplexStream;
    type Listener = MemoryListener;

    async fn listen(&self, port: u16, address: IpAddr) -> Result<MemoryListener> {
        let local = SocketAddr::new(address, port);
        let mut inner = lock(&self.inner);
        if inner.listeners.get(&port).is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::Bind {
                addr: local,
                source: std::io::Error::new(ErrorKind::AddrInUse, "memory port already bound"),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.listeners.insert(port, tx);
        debug!(%local, "memory listener bound");
        Ok(MemoryListener { local, incoming: rx })
    }

    async fn connect(&self, _port: u16, device: DeviceId) -> Result<DuplexStream> {
        let (handle, buffer_size) = {
            let inner = lock(&self.inner);
            let handle = inner
                .devices
                .get(&device)
                .cloned()
                .ok_or(TransportError::UnknownDevice(device))?;
            (handle, inner.buffer_size)
        };

        let delay = handle.begin_attempt();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        handle.complete_attempt(buffer_size)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Passive channel of a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryListener {
    local: SocketAddr,
    incoming: mpsc::UnboundedReceiver<(DuplexStream, SocketAddr)>,
}

impl TransportListener for MemoryListener {
    type Stream = DuplexStream;

    async fn accept(&mut self) -> Result<(DuplexStream, SocketAddr)> {
        self.incoming.recv().await.ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }
}

/// Scriptable device reachable through a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryDevice {
    id: DeviceId,
    shared: Arc<DeviceShared>,
}

struct DeviceShared {
    state: Mutex<DeviceState>,
    accepted_tx: mpsc::UnboundedSender<DuplexStream>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

struct DeviceState {
    reachable: bool,
    fail_next: usize,
    connect_delay: Duration,
    attempts: usize,
    connections: usize,
}

impl MemoryDevice {
    fn new(id: DeviceId) -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            id,
            shared: Arc::new(DeviceShared {
                state: Mutex::new(DeviceState {
                    reachable: true,
                    fail_next: 0,
                    connect_delay: Duration::ZERO,
                    attempts: 0,
                    connections: 0,
                }),
                accepted_tx,
                accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Refuse (`false`) or accept (`true`) subsequent dials.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.shared.state).reachable = reachable;
    }

    /// Refuse the next `count` dials regardless of reachability.
    pub fn fail_next(&self, count: usize) {
        lock(&self.shared.state).fail_next = count;
    }

    /// Delay every dial by `delay` before it resolves.
    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.shared.state).connect_delay = delay;
    }

    /// Dials attempted so far, successful or not.
    pub fn connect_attempts(&self) -> usize {
        lock(&self.shared.state).attempts
    }

    /// Dials that produced a connection.
    pub fn connections(&self) -> usize {
        lock(&self.shared.state).connections
    }

    /// Wait for the device's end of the next successful dial.
    pub async fn accept(&self) -> Option<DuplexStream> {
        self.shared.accepted_rx.lock().await.recv().await
    }

    /// The device's end of an already completed dial, if any.
    pub fn try_accept(&self) -> Option<DuplexStream> {
        self.shared
            .accepted_rx
            .try_lock()
            .ok()
            .and_then(|mut rx| rx.try_recv().ok())
    }

    fn begin_attempt(&self) -> Duration {
        let mut state = lock(&self.shared.state);
        state.attempts += 1;
        state.connect_delay
    }

    fn complete_attempt(&self, buffer_size: usize) -> Result<DuplexStream> {
        let mut state = lock(&self.shared.state);
        if state.fail_next > 0 || !state.reachable {
            state.fail_next = state.fail_next.saturating_sub(1);
            return Err(TransportError::Connect {
                device: self.id,
                source: std::io::Error::new(ErrorKind::ConnectionRefused, "device refused dial"),
            });
        }

        let (near, far) = tokio::io::duplex(buffer_size);
        self.shared
            .accepted_tx
            .send(far)
            .map_err(|_| TransportError::Closed)?;
        state.connections += 1;
        debug!(device = %self.id, "memory dial connected");
        Ok(near)
    }
}

impl std::fmt::Debug for MemoryDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("MemoryDevice")
            .field("id", &self.id)
            .field("reachable", &state.reachable)
            .field("attempts", &state.attempts)
            .field("connections", &state.connections)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
