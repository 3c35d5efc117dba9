//! Job host for the frame detection pipeline.
//!
//! This crate provides:
//! - Worker configuration loaded from the environment
//! - A host that runs one job, relays its events and summarizes it
//! - The `vannot-worker` and `pipeline-selfcheck` binaries

pub mod config;
pub mod error;
pub mod host;

pub use config::{EventOutput, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use host::{JobHost, JobSummary};
