//! Typed, tagged frames for the tether peer channel.
//!
//! Every unit crossing the transport is framed with a 16-byte header:
//! - A 4-byte big-endian protocol version
//! - A 4-byte big-endian message type identifier
//! - A 4-byte big-endian correlation tag ([`NO_TAG`] when unused)
//! - A 4-byte big-endian payload length
//!
//! Decoding is header-first: a [`FrameFilter`] sees the header before the
//! payload is buffered, so unwanted payloads never accumulate in memory.

pub mod codec;
pub mod error;
pub mod filter;

#[cfg(feature = "async")]
pub mod framed;

pub use codec::{
    decode_frame, decode_header, encode_frame, FrameConfig, FrameEnvelope, FrameHeader,
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE, NO_TAG, PROTOCOL_VERSION,
};
pub use error::{FrameError, Result};
pub use filter::{AcceptAll, FrameFilter};

#[cfg(feature = "async")]
pub use framed::FrameCodec;
