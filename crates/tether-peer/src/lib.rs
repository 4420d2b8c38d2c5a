//! Connection lifecycle management for tether peers.
//!
//! A [`PeerConnection`] owns one logical link to a remote peer. In the host
//! role it listens on loopback and actively dials devices reported by a
//! [`DeviceMonitor`](tether_transport::DeviceMonitor), re-dialing the same
//! device after a link failure. In the client role it only listens and waits
//! to be dialed.
//!
//! All state lives on a single control task. Device notifications, dial
//! results, accepted streams, channel frames and retry timers are queued as
//! events and applied one at a time; results that no longer match the current
//! attempt, channel or timer are discarded.
//!
//! Inbound frames pass the application's [`PeerEventSink`] acceptance check
//! before their payload is read, then reach `did_receive_data`.

pub mod config;
pub mod connection;
pub mod error;
mod event;
mod manager;
pub mod sink;
pub mod state;

pub use config::PeerConfig;
pub use connection::PeerConnection;
pub use error::{PeerError, Result};
pub use sink::{PeerEventSink, RoutedSink, SinkFilter};
pub use state::{ConnectionState, Role, Snapshot};
