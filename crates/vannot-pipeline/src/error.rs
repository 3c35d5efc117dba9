//! Error types for pipeline operations.

use std::time::Duration;
use thiserror::Error;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Job-level errors. Every variant except `InvalidConfig` is fatal for the
/// job it occurs in and is reported once in the terminal event.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("Video could not be opened: {0}")]
    VideoOpen(#[source] VideoError),

    #[error("Video read failed at frame {frame_index}: {source}")]
    VideoRead {
        frame_index: u64,
        #[source]
        source: VideoError,
    },

    #[error("Drain did not finish within {0:?}")]
    DrainTimeout(Duration),

    #[error("Memory emergency: usage {usage_percent:.1}% exceeded the emergency threshold")]
    MemoryEmergency { usage_percent: f64 },

    #[error("Stage task failed: {0}")]
    StageFailed(String),
}

impl PipelineError {
    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a stage failure error.
    pub fn stage_failed(message: impl Into<String>) -> Self {
        Self::StageFailed(message.into())
    }
}

/// Errors raised by a [`VideoSource`](crate::video::VideoSource).
#[derive(Debug, Error)]
pub enum VideoError {
    #[error("Video container unreadable: {0}")]
    Unreadable(String),

    /// A single frame could not be decoded; the stream itself is intact.
    #[error("Frame decode failed: {0}")]
    FrameDecode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VideoError {
    pub fn unreadable(message: impl Into<String>) -> Self {
        Self::Unreadable(message.into())
    }

    pub fn frame_decode(message: impl Into<String>) -> Self {
        Self::FrameDecode(message.into())
    }

    /// Whether reading can continue with the next frame.
    pub fn is_per_frame(&self) -> bool {
        matches!(self, VideoError::FrameDecode(_))
    }
}

/// Errors raised by a [`DetectionModel`](crate::model::DetectionModel).
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// Accelerator or host memory ran out. Retrying with fewer frames may help.
    #[error("Model resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Model inference failed: {0}")]
    Failed(String),
}

impl ModelError {
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Buffer pool flow-control conditions. Not an error for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("Buffer pool exhausted ({allocated} of {max_allocated} buffers allocated)")]
    Exhausted {
        allocated: usize,
        max_allocated: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_error_classification() {
        assert!(VideoError::frame_decode("bad slice").is_per_frame());
        assert!(!VideoError::unreadable("no moov atom").is_per_frame());
    }

    #[test]
    fn test_error_messages() {
        let err = PipelineError::VideoOpen(VideoError::unreadable("truncated"));
        assert_eq!(
            err.to_string(),
            "Video could not be opened: Video container unreadable: truncated"
        );

        let err = PipelineError::MemoryEmergency { usage_percent: 97.31 };
        assert!(err.to_string().contains("97.3"));
    }

    #[test]
    fn test_model_error_kind() {
        assert!(matches!(
            ModelError::resource_exhausted("CUDA OOM"),
            ModelError::ResourceExhausted(_)
        ));
        assert!(matches!(ModelError::failed("segfault"), ModelError::Failed(_)));
    }
}
