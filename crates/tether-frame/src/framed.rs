use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::codec::{decode_frame, decode_header, encode_frame, FrameConfig, FrameEnvelope, FrameHeader, HEADER_SIZE};
use crate::error::FrameError;
use crate::filter::FrameFilter;

/// `tokio_util` codec for tether frames with header-first admission.
///
/// Rejected frames are skipped incrementally: their payload bytes are
/// dropped as they arrive, so the read buffer never grows past one header
/// for a frame nobody wants.
pub struct FrameCodec {
    config: FrameConfig,
    filter: Option<Arc<dyn FrameFilter>>,
    admitted: Option<FrameHeader>,
    skip_remaining: usize,
    discarded: u64,
}

impl FrameCodec {
    /// Create a codec that admits every frame.
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            filter: None,
            admitted: None,
            skip_remaining: 0,
            discarded: 0,
        }
    }

    /// Install a header filter.
    pub fn with_filter(mut self, filter: Arc<dyn FrameFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Number of frames discarded by the filter so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Current codec configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(FrameConfig::default())
    }
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("config", &self.config)
            .field("filtered", &self.filter.is_some())
            .field("skip_remaining", &self.skip_remaining)
            .field("discarded", &self.discarded)
            .finish()
    }
}

impl Decoder for FrameCodec {
    type Item = FrameEnvelope;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FrameEnvelope>, FrameError> {
        let max = self.config.max_payload_size;

        loop {
            if self.skip_remaining > 0 {
                let n = self.skip_remaining.min(src.len());
                src.advance(n);
                self.skip_remaining -= n;
                if self.skip_remaining > 0 {
                    return Ok(None);
                }
            }

            let header = match self.admitted {
                Some(header) => header,
                None => {
                    let Some(header) = decode_header(src, max)? else {
                        src.reserve(HEADER_SIZE - src.len());
                        return Ok(None);
                    };

                    let admit = self
                        .filter
                        .as_ref()
                        .map_or(true, |filter| filter.accept(&header));
                    if !admit {
                        trace!(
                            type_id = header.type_id,
                            size = header.payload_size,
                            "discarding rejected frame"
                        );
                        src.advance(HEADER_SIZE);
                        self.skip_remaining = header.payload_size as usize;
                        self.discarded = self.discarded.saturating_add(1);
                        continue;
                    }

                    self.admitted = Some(header);
                    header
                }
            };

            let total = HEADER_SIZE + header.payload_size as usize;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            self.admitted = None;
            return decode_frame(src, max);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<FrameEnvelope>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.skip_remaining == 0 && self.admitted.is_none() => {
                Ok(None)
            }
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<FrameEnvelope> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: FrameEnvelope, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.config.max_payload_size,
            });
        }
        encode_frame(frame.type_id, frame.tag, frame.payload.as_ref(), dst)
    }
}
