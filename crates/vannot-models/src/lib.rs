//! Shared data models for the video frame detection pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Pipeline jobs and their lifecycle states
//! - Detection records and per-frame results
//! - Events streamed from the pipeline to the job host
//! - Frame sampling policies

pub mod detection;
pub mod event;
pub mod job;
pub mod sampling;

// Re-export common types
pub use detection::{BoundingBox, DetectionRecord, FailureKind, FrameDetections, FrameFailure};
pub use event::PipelineEvent;
pub use job::{JobId, JobStatus, PipelineJob};
pub use sampling::{SamplingPolicy, SamplingPolicyParseError};
