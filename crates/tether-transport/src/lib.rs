//! Transport channel and device monitor contracts.
//!
//! This is the lowest layer of tether. It provides:
//! - [`Transport`] / [`TransportListener`]: dial a device or accept inbound links
//! - [`Channel`]: a live framed link delivering [`ChannelEvent`]s to its owner
//! - [`DeviceMonitor`]: attach/detach notifications with explicit [`Subscription`]s
//!
//! Two transports ship with the crate: [`TcpTransport`] (loopback/LAN TCP
//! addressed through a [`DeviceDirectory`]) and [`MemoryTransport`]
//! (in-process duplex pipes with scriptable devices).

pub mod channel;
pub mod device;
pub mod error;
pub mod memory;
pub mod tcp;
pub mod traits;

pub use channel::{Channel, ChannelEvent, ChannelId, ChannelOptions, SendReceipt};
pub use device::{
    DeviceCallback, DeviceEvent, DeviceId, DeviceMonitor, ManualDeviceMonitor, Subscription,
};
pub use error::{Result, TransportError};
pub use memory::{MemoryDevice, MemoryListener, MemoryTransport};
pub use tcp::{DeviceDirectory, DeviceEndpoint, TcpTransport, TcpTransportListener};
pub use traits::{Transport, TransportListener};
