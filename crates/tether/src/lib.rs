//! Typed, self-healing peer links between a host and attachable devices.
//!
//! tether keeps one framed link alive between a host process and a device
//! that comes and goes: it dials devices as they attach, re-dials after link
//! failures, and routes inbound frames by numeric message type.
//!
//! # Crate Structure
//!
//! - [`frame`]: typed, tagged, length-prefixed frames
//! - [`transport`]: transport, channel and device monitor contracts (TCP, in-memory)
//! - [`registry`]: type-id keyed packet codecs and inbound dispatch
//! - [`peer`]: the connection lifecycle manager (behind the `peer` feature)

/// Re-export frame types.
pub mod frame {
    pub use tether_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use tether_transport::*;
}

/// Re-export registry types.
pub mod registry {
    pub use tether_registry::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use tether_peer::*;
}
