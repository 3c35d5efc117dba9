//! Pipeline metrics.
//!
//! Recorded through the `metrics` facade; the host decides whether a
//! recorder (e.g. Prometheus) is installed.

use metrics::{counter, gauge, histogram};

use crate::pressure::PressureLevel;

/// Metric names as constants for consistency.
pub mod names {
    // Buffer pool
    pub const POOL_FREE: &str = "vannot_pool_free_buffers";
    pub const POOL_IN_USE: &str = "vannot_pool_in_use_buffers";
    pub const POOL_OVERFLOW: &str = "vannot_pool_overflow_buffers";
    pub const POOL_EXHAUSTED_TOTAL: &str = "vannot_pool_exhausted_total";
    pub const POOL_RETIRED_TOTAL: &str = "vannot_pool_retired_total";

    // Frames
    pub const FRAMES_DECODED_TOTAL: &str = "vannot_frames_decoded_total";
    pub const FRAMES_SAMPLED_TOTAL: &str = "vannot_frames_sampled_total";
    pub const FRAMES_FAILED_TOTAL: &str = "vannot_frames_failed_total";
    pub const FRAMES_EMITTED_TOTAL: &str = "vannot_frames_emitted_total";
    pub const FRAMES_OUT_OF_ORDER_TOTAL: &str = "vannot_frames_out_of_order_total";

    // Inference
    pub const INFERENCE_DURATION_SECONDS: &str = "vannot_inference_duration_seconds";
    pub const INFERENCE_BATCH_SIZE: &str = "vannot_inference_batch_size";
    pub const BATCH_SPLITS_TOTAL: &str = "vannot_batch_splits_total";
    pub const BATCH_CEILING: &str = "vannot_batch_ceiling";

    // Memory pressure
    pub const MEMORY_USAGE_RATIO: &str = "vannot_memory_usage_ratio";
    pub const PRESSURE_ALERTS_TOTAL: &str = "vannot_pressure_alerts_total";

    // Jobs
    pub const JOBS_FINISHED_TOTAL: &str = "vannot_jobs_finished_total";
    pub const JOB_DURATION_SECONDS: &str = "vannot_job_duration_seconds";
}

/// Publish buffer pool occupancy.
pub fn record_pool_state(free: usize, in_use: usize, overflow: usize) {
    gauge!(names::POOL_FREE).set(free as f64);
    gauge!(names::POOL_IN_USE).set(in_use as f64);
    gauge!(names::POOL_OVERFLOW).set(overflow as f64);
}

pub fn record_pool_exhausted() {
    counter!(names::POOL_EXHAUSTED_TOTAL).increment(1);
}

pub fn record_pool_retired(count: usize) {
    counter!(names::POOL_RETIRED_TOTAL).increment(count as u64);
}

pub fn record_frame_decoded(sampled: bool) {
    counter!(names::FRAMES_DECODED_TOTAL).increment(1);
    if sampled {
        counter!(names::FRAMES_SAMPLED_TOTAL).increment(1);
    }
}

/// Record a frame flagged with a failure.
pub fn record_frame_failed(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::FRAMES_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_frame_emitted(out_of_order: bool) {
    counter!(names::FRAMES_EMITTED_TOTAL).increment(1);
    if out_of_order {
        counter!(names::FRAMES_OUT_OF_ORDER_TOTAL).increment(1);
    }
}

/// Record one model call.
pub fn record_inference(batch_size: usize, duration_secs: f64, outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    histogram!(names::INFERENCE_DURATION_SECONDS, &labels).record(duration_secs);
    histogram!(names::INFERENCE_BATCH_SIZE).record(batch_size as f64);
}

pub fn record_batch_split() {
    counter!(names::BATCH_SPLITS_TOTAL).increment(1);
}

pub fn record_batch_ceiling(ceiling: usize) {
    gauge!(names::BATCH_CEILING).set(ceiling as f64);
}

pub fn record_memory_usage(ratio: f64) {
    gauge!(names::MEMORY_USAGE_RATIO).set(ratio);
}

pub fn record_pressure_alert(level: PressureLevel) {
    let labels = [("level", level.as_str().to_string())];
    counter!(names::PRESSURE_ALERTS_TOTAL, &labels).increment(1);
}

/// Record a finished job.
pub fn record_job_finished(status: &str, duration_secs: f64) {
    let labels = [("status", status.to_string())];
    counter!(names::JOBS_FINISHED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(duration_secs);
}
