use crate::codec::FrameHeader;

/// Header-level admission check consulted before a payload is buffered.
///
/// Returning `false` discards the frame: its payload bytes are skipped as
/// they arrive and the frame is never surfaced to the reader.
pub trait FrameFilter: Send + Sync {
    fn accept(&self, header: &FrameHeader) -> bool;
}

impl<F> FrameFilter for F
where
    F: Fn(&FrameHeader) -> bool + Send + Sync,
{
    fn accept(&self, header: &FrameHeader) -> bool {
        self(header)
    }
}

/// Filter that admits every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl FrameFilter for AcceptAll {
    fn accept(&self, _header: &FrameHeader) -> bool {
        true
    }
}
