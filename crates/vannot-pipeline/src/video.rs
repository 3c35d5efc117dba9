//! Video source abstraction.
//!
//! A source decodes frames sequentially into caller-provided buffers. Real
//! decoders (FFmpeg bindings, hardware decoders) live in the host; the
//! pipeline only depends on this trait.

use async_trait::async_trait;

use crate::buffer_pool::FrameShape;
use crate::error::VideoError;

/// Stream properties reported when a source is opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub shape: FrameShape,
    /// Decoded frame count, when the container reports one
    pub estimated_frame_count: Option<u64>,
    pub fps: f64,
}

/// Metadata for one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMeta {
    pub timestamp_seconds: f64,
    /// Bytes written into the destination (0 when none was given)
    pub bytes_written: usize,
}

/// Outcome of reading the next frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameRead {
    Frame(FrameMeta),
    EndOfStream,
}

/// Sequential frame decoder.
#[async_trait]
pub trait VideoSource: Send {
    /// Open the stream. Called once before any frame is read.
    async fn open(&mut self) -> Result<VideoInfo, VideoError>;

    /// Decode the next frame into `dst`.
    ///
    /// `dst` is `None` for frames the sampling policy skips; the source
    /// must still advance past them but need not write pixels.
    /// A [`VideoError::FrameDecode`] marks only this frame as bad; any
    /// other error ends the stream.
    async fn next_frame(&mut self, dst: Option<&mut [u8]>) -> Result<FrameRead, VideoError>;
}
