use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: version (4) + type (4) + tag (4) + length (4) = 16 bytes.
pub const HEADER_SIZE: usize = 16;

/// The only wire protocol version this codec speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Tag value meaning "no correlation requested".
pub const NO_TAG: u32 = 0xFFFF_FFFF;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// A typed, tagged unit crossing the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEnvelope {
    /// Application-defined message type.
    pub type_id: u32,
    /// Correlation tag, [`NO_TAG`] when unused.
    pub tag: u32,
    /// The message payload.
    pub payload: Bytes,
}

impl FrameEnvelope {
    /// Create an untagged frame.
    pub fn new(type_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::tagged(type_id, NO_TAG, payload)
    }

    /// Create a frame carrying a correlation tag.
    pub fn tagged(type_id: u32, tag: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            tag,
            payload: payload.into(),
        }
    }

    /// Whether the frame carries a correlation tag.
    pub fn has_tag(&self) -> bool {
        self.tag != NO_TAG
    }

    /// The header describing this frame.
    ///
    /// Payloads longer than `u32::MAX` report `u32::MAX`; such frames cannot
    /// be encoded and [`encode_frame`] rejects them.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            version: PROTOCOL_VERSION,
            type_id: self.type_id,
            tag: self.tag,
            payload_size: payload_len_field(self.payload.len()),
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u32,
    pub type_id: u32,
    pub tag: u32,
    pub payload_size: u32,
}

/// Encode a frame into the wire format.
///
/// Wire format (all fields big-endian):
/// ```text
/// ┌──────────────┬───────────┬──────────┬──────────────┬──────────────────┐
/// │ Version (4B) │ Type (4B) │ Tag (4B) │ Length (4B)  │ Payload          │
/// │ 0x00000001   │           │          │              │ (Length bytes)   │
/// └──────────────┴───────────┴──────────┴──────────────┴──────────────────┘
/// ```
pub fn encode_frame(type_id: u32, tag: u32, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32(PROTOCOL_VERSION);
    dst.put_u32(type_id);
    dst.put_u32(tag);
    dst.put_u32(length);
    dst.put_slice(payload);
    Ok(())
}

/// Length field for a payload of `len` bytes, saturating at `u32::MAX`.
fn payload_len_field(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Decode a frame header from the front of a buffer without consuming it.
///
/// Returns `Ok(None)` if fewer than [`HEADER_SIZE`] bytes are buffered.
pub fn decode_header(src: &[u8], max_payload: usize) -> Result<Option<FrameHeader>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut cursor = &src[..HEADER_SIZE];
    let header = FrameHeader {
        version: cursor.get_u32(),
        type_id: cursor.get_u32(),
        tag: cursor.get_u32(),
        payload_size: cursor.get_u32(),
    };

    if header.version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(header.version));
    }
    if header.payload_size as usize > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: header.payload_size as usize,
            max: max_payload,
        });
    }

    Ok(Some(header))
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<FrameEnvelope>> {
    let header = match decode_header(src, max_payload)? {
        Some(header) => header,
        None => return Ok(None),
    };

    let total = HEADER_SIZE + header.payload_size as usize;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(header.payload_size as usize).freeze();

    Ok(Some(FrameEnvelope {
        type_id: header.type_id,
        tag: header.tag,
        payload,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
