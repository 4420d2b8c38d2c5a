//! Typed packet registry for the tether peer channel.
//!
//! Maps a 32-bit message type identifier to an encode/decode contract and
//! routes inbound frames to typed handlers. Two codec strategies sit behind
//! one [`PacketCodec`] interface:
//! - structured packets ([`JsonCodec`]): any serde value, JSON on the wire
//! - binary packets ([`BinaryCodec`]): the type supplies its own encoding
//!
//! The registry is built once at startup and then shared read-only as an
//! `Arc<PacketRegistry>`.

pub mod codec;
pub mod dispatch;
pub mod error;
pub mod registry;

#[cfg(feature = "schema")]
pub mod schema;

pub use codec::{BinaryCodec, BinaryPacket, FnCodec, JsonCodec, PacketCodec, PacketFlavor, TypedPacket};
pub use dispatch::Dispatcher;
pub use error::{CodecError, RegistryError, Result};
pub use registry::{BindingInfo, PacketRegistry};

#[cfg(feature = "schema")]
pub use schema::{SchemaCodec, SchemaViolation};
