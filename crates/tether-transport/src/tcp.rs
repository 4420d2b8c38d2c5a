use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::device::DeviceId;
use crate::error::{Result, TransportError};
use crate::traits::{Transport, TransportListener};

/// Where a device can be reached over TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEndpoint {
    pub host: IpAddr,
    /// Port override; when `None` the port passed to `connect` is used.
    pub port: Option<u16>,
}

impl DeviceEndpoint {
    pub fn new(host: IpAddr) -> Self {
        Self { host, port: None }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Resolve the socket address for a dial on `port`.
    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.host, self.port.unwrap_or(port))
    }
}

impl From<SocketAddr> for DeviceEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip()).with_port(addr.port())
    }
}

impl FromStr for DeviceEndpoint {
    type Err = std::net::AddrParseError;

    /// Parses `HOST` or `HOST:PORT` (`[V6]:PORT` for IPv6).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        match s.parse::<SocketAddr>() {
            Ok(addr) => Ok(addr.into()),
            Err(_) => s.parse::<IpAddr>().map(Self::new),
        }
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}", SocketAddr::new(self.host, port)),
            None => write!(f, "{}", self.host),
        }
    }
}

/// Shared `DeviceId -> DeviceEndpoint` table consulted by [`TcpTransport`].
#[derive(Debug, Clone, Default)]
pub struct DeviceDirectory {
    entries: Arc<RwLock<HashMap<DeviceId, DeviceEndpoint>>>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a device endpoint.
    pub fn insert(&self, device: DeviceId, endpoint: DeviceEndpoint) -> Option<DeviceEndpoint> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device, endpoint)
    }

    pub fn remove(&self, device: DeviceId) -> Option<DeviceEndpoint> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&device)
    }

    pub fn get(&self, device: DeviceId) -> Option<DeviceEndpoint> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device)
            .copied()
    }

    /// Registered devices, ascending.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        devices.sort_unstable();
        devices
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// TCP transport: passive channels are TCP listeners, devices are dialed
/// at the address registered in a [`DeviceDirectory`].
#[derive(Debug, Clone)]
pub struct TcpTransport {
    directory: DeviceDirectory,
    connect_timeout: Duration,
    nodelay: bool,
}

impl TcpTransport {
    /// Default dial timeout.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(directory: DeviceDirectory) -> Self {
        Self {
            directory,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Toggle `TCP_NODELAY` on dialed and accepted streams. Default: on.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;
    type Listener = TcpTransportListener;

    async fn listen(&self, port: u16, address: IpAddr) -> Result<TcpTransportListener> {
        let addr = SocketAddr::new(address, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let bound = listener.local_addr()?;

        info!(addr = %bound, "listening on tcp");
        Ok(TcpTransportListener {
            listener,
            nodelay: self.nodelay,
        })
    }

    async fn connect(&self, port: u16, device: DeviceId) -> Result<TcpStream> {
        let endpoint = self
            .directory
            .get(device)
            .ok_or(TransportError::UnknownDevice(device))?;
        let addr = endpoint.socket_addr(port);

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { device, source }),
            Err(_) => {
                return Err(TransportError::Connect {
                    device,
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connect to {addr} timed out after {:?}", self.connect_timeout),
                    ),
                })
            }
        };
        stream.set_nodelay(self.nodelay)?;

        debug!(%device, %addr, "connected to device");
        Ok(stream)
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Bound TCP listener.
#[derive(Debug)]
pub struct TcpTransportListener {
    listener: TcpListener,
    nodelay: bool,
}

impl TransportListener for TcpTransportListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, from) = self.listener.accept().await.map_err(TransportError::Accept)?;
        stream.set_nodelay(self.nodelay)?;
        debug!(%from, "accepted connection");
        Ok((stream, from))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn endpoint_parses_host_and_host_port() {
        let plain: DeviceEndpoint = "127.0.0.1".parse().unwrap();
        assert_eq!(plain, DeviceEndpoint::new(LOOPBACK));
        assert_eq!(plain.socket_addr(9000).port(), 9000);

        let with_port: DeviceEndpoint = "127.0.0.1:9100".parse().unwrap();
        assert_eq!(with_port.port, Some(9100));
        assert_eq!(with_port.socket_addr(9000).port(), 9100);
        assert_eq!(with_port.to_string(), "127.0.0.1:9100");

        assert!("not-an-ip".parse::<DeviceEndpoint>().is_err());
    }

    #[test]
    fn directory_insert_get_remove() {
        let directory = DeviceDirectory::new();
        assert!(directory.is_empty());

        directory.insert(DeviceId(2), DeviceEndpoint::new(LOOPBACK));
        directory.insert(DeviceId(1), DeviceEndpoint::new(LOOPBACK).with_port(1));
        assert_eq!(directory.devices(), vec![DeviceId(1), DeviceId(2)]);
        assert_eq!(directory.get(DeviceId(1)).unwrap().port, Some(1));

        assert!(directory.remove(DeviceId(1)).is_some());
        assert!(directory.get(DeviceId(1)).is_none());
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn listen_accept_connect_over_loopback() {
        let directory = DeviceDirectory::new();
        let transport = TcpTransport::new(directory.clone());

        let mut listener = transport.listen(0, LOOPBACK).await.unwrap();
        let bound = listener.local_addr().unwrap();
        directory.insert(DeviceId(5), DeviceEndpoint::from(bound));

        let server = tokio::spawn(async move {
            let (mut stream, from) = listener.accept().await.unwrap();
            assert!(from.ip().is_loopback());
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut client = transport.connect(0, DeviceId(5)).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn connect_unknown_device_fails() {
        let transport = TcpTransport::new(DeviceDirectory::new());
        let err = transport.connect(9000, DeviceId(77)).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownDevice(DeviceId(77))));
    }

    #[tokio::test]
    async fn connect_refused_is_connect_error() {
        let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let closed_port = probe.local_addr().unwrap().port();
        drop(probe);

        let directory = DeviceDirectory::new();
        directory.insert(DeviceId(1), DeviceEndpoint::new(LOOPBACK));
        let transport = TcpTransport::new(directory);

        let err = transport.connect(closed_port, DeviceId(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { device: DeviceId(1), .. }));
    }

    #[tokio::test]
    async fn listen_on_taken_port_is_bind_error() {
        let transport = TcpTransport::new(DeviceDirectory::new());
        let first = transport.listen(0, LOOPBACK).await.unwrap();
        let port = first.local_addr().unwrap().port();

        let err = transport.listen(port, LOOPBACK).await.unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));
    }
}
