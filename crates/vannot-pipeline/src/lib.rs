//! Bounded video frame detection pipeline.
//!
//! This crate provides:
//! - A fixed-size frame buffer pool with RAII handles
//! - Frame source, batch assembler, inference dispatcher and result
//!   streamer stages joined by bounded channels
//! - Batch degradation on resource exhaustion and timeouts
//! - Memory pressure monitoring with pool shrinking and throttling
//! - A controller that runs one job per [`JobHandle`]
//!
//! Decoders and models are injected through the [`VideoSource`] and
//! [`DetectionModel`] traits.

pub mod assembler;
pub mod buffer_pool;
pub mod config;
pub mod control;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod pressure;
pub mod records;
pub mod source;
pub mod streamer;
pub mod synthetic;
pub mod video;

pub use assembler::{Batch, BatchAssembler};
pub use buffer_pool::{BufferHandle, BufferPool, FrameShape, PoolStats};
pub use config::{MemoryThresholds, PipelineConfig, PressureConfig};
pub use controller::{JobHandle, PipelineController};
pub use dispatcher::{BatchInvoker, BatchOutcome, InferenceDispatcher, InvokerSettings};
pub use error::{ModelError, PipelineError, PipelineResult, PoolError, VideoError};
pub use logging::JobLogger;
pub use model::{DetectionModel, FrameView, RawDetection, COCO_CLASSES};
pub use pressure::{
    MemoryProbe, PressureLevel, PressureMonitor, PressureSignals, ProcessMemoryProbe,
    ResourceSnapshot,
};
pub use records::RecordFilter;
pub use source::{FrameSource, FrameTask, SourceReport, SourceSettings};
pub use streamer::{JobOutcome, ResultStreamer, StreamerReport, StreamerSettings};
pub use synthetic::{ScriptedModel, SyntheticVideo};
pub use video::{FrameMeta, FrameRead, VideoInfo, VideoSource};
