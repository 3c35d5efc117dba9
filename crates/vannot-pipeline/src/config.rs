//! Pipeline configuration.
//!
//! Every option has a default; sizes that the model derives from the batch
//! size or worker count stay unset until read through their accessor so that
//! changing `batch_size` keeps them consistent.

use std::str::FromStr;
use std::time::Duration;

use vannot_models::SamplingPolicy;

use crate::error::{PipelineError, PipelineResult};

/// Memory usage thresholds, as a fraction of the available memory limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryThresholds {
    /// Log only
    pub warning: f64,
    /// Shrink the buffer pool and throttle the frame source
    pub critical: f64,
    /// Cancel the job
    pub emergency: f64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warning: 0.75,
            critical: 0.85,
            emergency: 0.95,
        }
    }
}

impl MemoryThresholds {
    fn validate(&self) -> PipelineResult<()> {
        let ordered = 0.0 < self.warning
            && self.warning <= self.critical
            && self.critical <= self.emergency
            && self.emergency <= 1.0;
        if !ordered {
            return Err(PipelineError::invalid_config(format!(
                "memory thresholds must satisfy 0 < warning <= critical <= emergency <= 1, got {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Pressure monitor settings.
#[derive(Debug, Clone)]
pub struct PressureConfig {
    /// How often memory is sampled
    pub sample_interval: Duration,
    /// Minimum time between two alerts of the same level
    pub alert_cooldown: Duration,
    /// Fraction of the pool capacity released on a critical alert
    pub shrink_fraction: f64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            alert_cooldown: Duration::from_secs(30),
            shrink_fraction: 0.25,
        }
    }
}

/// Configuration for a single pipeline job.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Frames per inference call
    pub batch_size: usize,
    /// Depth of the frame channel (default: 2 x batch_size)
    pub frame_queue_depth: Option<usize>,
    /// Which decoded frames are sampled
    pub sampling_policy: SamplingPolicy,
    /// Pre-allocated frame buffers
    /// (default: queue depth + batch_size x (worker_count + 1))
    pub buffer_pool_capacity: Option<usize>,
    /// Allocation ceiling as a multiple of the pool capacity
    pub overflow_factor: f64,
    /// Concurrent inference calls (default: available parallelism)
    pub worker_count: Option<usize>,
    /// Per-call inference timeout
    pub inference_timeout: Duration,
    /// Minimum number of frames between two progress events
    pub progress_interval_frames: u64,
    pub memory_thresholds: MemoryThresholds,
    /// Completed batches held for reordering (default: 2 x worker_count)
    pub reorder_window: Option<usize>,
    /// Longest wait for a missing batch before emitting around it.
    /// Defaults to twice `inference_timeout`, so a batch that is still
    /// within its inference budget (including one split retry) is not
    /// reported out of order.
    pub reorder_timeout: Option<Duration>,
    /// Time in-flight batches get to finish after cancellation
    pub drain_timeout: Duration,
    /// Wait between buffer acquisition attempts when the pool is exhausted
    pub acquire_backoff: Duration,
    /// Extra wait between acquisitions while memory pressure is critical
    pub throttle_backoff: Duration,
    /// Detections below this confidence are dropped
    pub confidence_threshold: f32,
    /// Class-wise NMS IoU threshold; `None` keeps model output as is
    pub nms_threshold: Option<f32>,
    /// Consecutive successful calls before a degraded batch ceiling is raised
    pub recovery_successes: u32,
    /// Capacity of the event channel handed to the job host
    pub event_queue_depth: usize,
    pub pressure: PressureConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            frame_queue_depth: None,
            sampling_policy: SamplingPolicy::default(),
            buffer_pool_capacity: None,
            overflow_factor: 1.5,
            worker_count: None,
            inference_timeout: Duration::from_secs(30),
            progress_interval_frames: 32,
            memory_thresholds: MemoryThresholds::default(),
            reorder_window: None,
            reorder_timeout: None,
            drain_timeout: Duration::from_secs(10),
            acquire_backoff: Duration::from_millis(5),
            throttle_backoff: Duration::from_millis(20),
            confidence_threshold: 0.25,
            nms_threshold: None,
            recovery_successes: 4,
            event_queue_depth: 64,
            pressure: PressureConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables (`PIPELINE_*`).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup, falling back to defaults
    /// for missing or unparsable values.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key);
        let defaults = Self::default();

        Self {
            batch_size: parsed(&parse, "PIPELINE_BATCH_SIZE").unwrap_or(defaults.batch_size),
            frame_queue_depth: parsed(&parse, "PIPELINE_FRAME_QUEUE_DEPTH"),
            sampling_policy: parsed(&parse, "PIPELINE_SAMPLING")
                .unwrap_or(defaults.sampling_policy),
            buffer_pool_capacity: parsed(&parse, "PIPELINE_POOL_CAPACITY"),
            overflow_factor: parsed(&parse, "PIPELINE_OVERFLOW_FACTOR")
                .unwrap_or(defaults.overflow_factor),
            worker_count: parsed(&parse, "PIPELINE_WORKERS"),
            inference_timeout: parsed(&parse, "PIPELINE_INFERENCE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.inference_timeout),
            progress_interval_frames: parsed(&parse, "PIPELINE_PROGRESS_INTERVAL_FRAMES")
                .unwrap_or(defaults.progress_interval_frames),
            memory_thresholds: MemoryThresholds {
                warning: parsed(&parse, "PIPELINE_MEMORY_WARNING")
                    .unwrap_or(defaults.memory_thresholds.warning),
                critical: parsed(&parse, "PIPELINE_MEMORY_CRITICAL")
                    .unwrap_or(defaults.memory_thresholds.critical),
                emergency: parsed(&parse, "PIPELINE_MEMORY_EMERGENCY")
                    .unwrap_or(defaults.memory_thresholds.emergency),
            },
            reorder_window: parsed(&parse, "PIPELINE_REORDER_WINDOW"),
            reorder_timeout: parsed(&parse, "PIPELINE_REORDER_TIMEOUT_MS").map(Duration::from_millis),
            drain_timeout: parsed(&parse, "PIPELINE_DRAIN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_timeout),
            acquire_backoff: defaults.acquire_backoff,
            throttle_backoff: parsed(&parse, "PIPELINE_THROTTLE_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.throttle_backoff),
            confidence_threshold: parsed(&parse, "PIPELINE_CONFIDENCE_THRESHOLD")
                .unwrap_or(defaults.confidence_threshold),
            nms_threshold: parsed(&parse, "PIPELINE_NMS_THRESHOLD"),
            recovery_successes: parsed(&parse, "PIPELINE_RECOVERY_SUCCESSES")
                .unwrap_or(defaults.recovery_successes),
            event_queue_depth: parsed(&parse, "PIPELINE_EVENT_QUEUE_DEPTH")
                .unwrap_or(defaults.event_queue_depth),
            pressure: PressureConfig {
                sample_interval: parsed(&parse, "PIPELINE_PRESSURE_INTERVAL_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.pressure.sample_interval),
                alert_cooldown: parsed(&parse, "PIPELINE_ALERT_COOLDOWN_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.pressure.alert_cooldown),
                shrink_fraction: parsed(&parse, "PIPELINE_SHRINK_FRACTION")
                    .unwrap_or(defaults.pressure.shrink_fraction),
            },
        }
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the sampling policy.
    pub fn with_sampling_policy(mut self, policy: SamplingPolicy) -> Self {
        self.sampling_policy = policy;
        self
    }

    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker_count = Some(workers);
        self
    }

    /// Set pool capacity and overflow factor.
    pub fn with_pool(mut self, capacity: usize, overflow_factor: f64) -> Self {
        self.buffer_pool_capacity = Some(capacity);
        self.overflow_factor = overflow_factor;
        self
    }

    /// Set the per-call inference timeout.
    pub fn with_inference_timeout(mut self, timeout: Duration) -> Self {
        self.inference_timeout = timeout;
        self
    }

    /// Set the drain timeout used on cancellation.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the progress interval in frames.
    pub fn with_progress_interval(mut self, frames: u64) -> Self {
        self.progress_interval_frames = frames;
        self
    }

    pub fn frame_queue_depth(&self) -> usize {
        self.frame_queue_depth.unwrap_or(self.batch_size * 2)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    /// Buffers held at once in steady state: the frame queue, one batch per
    /// worker, the batch being assembled, the batch queued for dispatch and
    /// the frame being decoded.
    pub fn buffer_pool_capacity(&self) -> usize {
        self.buffer_pool_capacity.unwrap_or_else(|| {
            self.frame_queue_depth() + self.batch_size * (self.worker_count() + 2) + 1
        })
    }

    pub fn reorder_timeout(&self) -> Duration {
        self.reorder_timeout
            .unwrap_or_else(|| self.inference_timeout.saturating_mul(2))
    }

    pub fn reorder_window(&self) -> usize {
        self.reorder_window.unwrap_or(self.worker_count() * 2)
    }

    /// Highest number of buffers the pool may allocate.
    pub fn max_allocated_buffers(&self) -> usize {
        (self.buffer_pool_capacity() as f64 * self.overflow_factor).ceil() as usize
    }

    /// Validate configuration.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::invalid_config("batch_size must be at least 1"));
        }
        if self.frame_queue_depth() == 0 {
            return Err(PipelineError::invalid_config(
                "frame_queue_depth must be at least 1",
            ));
        }
        if self.worker_count() == 0 {
            return Err(PipelineError::invalid_config("worker_count must be at least 1"));
        }
        if self.buffer_pool_capacity() == 0 {
            return Err(PipelineError::invalid_config(
                "buffer_pool_capacity must be at least 1",
            ));
        }
        if !(self.overflow_factor >= 1.0) {
            return Err(PipelineError::invalid_config(format!(
                "overflow_factor must be >= 1.0, got {}",
                self.overflow_factor
            )));
        }
        // The assembler only emits full batches until end of stream, so the
        // pool must be able to hold one.
        if self.max_allocated_buffers() < self.batch_size {
            return Err(PipelineError::invalid_config(format!(
                "buffer pool can allocate at most {} buffers, fewer than batch_size {}",
                self.max_allocated_buffers(),
                self.batch_size
            )));
        }
        if self.inference_timeout.is_zero() || self.drain_timeout.is_zero() {
            return Err(PipelineError::invalid_config(
                "inference_timeout and drain_timeout must be non-zero",
            ));
        }
        if self.progress_interval_frames == 0 {
            return Err(PipelineError::invalid_config(
                "progress_interval_frames must be at least 1",
            ));
        }
        if self.reorder_window() == 0 || self.event_queue_depth == 0 {
            return Err(PipelineError::invalid_config(
                "reorder_window and event_queue_depth must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PipelineError::invalid_config(
                "confidence_threshold must be within [0, 1]",
            ));
        }
        if let Some(nms) = self.nms_threshold {
            if !(nms > 0.0 && nms <= 1.0) {
                return Err(PipelineError::invalid_config(
                    "nms_threshold must be within (0, 1]",
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.pressure.shrink_fraction) {
            return Err(PipelineError::invalid_config(
                "shrink_fraction must be within [0, 1]",
            ));
        }
        if self.pressure.sample_interval.is_zero() {
            return Err(PipelineError::invalid_config(
                "pressure sample_interval must be non-zero",
            ));
        }
        self.memory_thresholds.validate()
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default().with_workers(4);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.frame_queue_depth(), 16);
        assert_eq!(config.buffer_pool_capacity(), 65);
        assert_eq!(config.max_allocated_buffers(), 98);
        assert_eq!(config.reorder_window(), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reorder_timeout_follows_inference_timeout() {
        let config = PipelineConfig::default();
        assert_eq!(config.reorder_timeout(), Duration::from_secs(60));

        let config = config.with_inference_timeout(Duration::from_secs(2));
        assert_eq!(config.reorder_timeout(), Duration::from_secs(4));

        let config = PipelineConfig {
            reorder_timeout: Some(Duration::from_millis(250)),
            ..config
        };
        assert_eq!(config.reorder_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_derived_sizes_follow_batch_size() {
        let config = PipelineConfig::default().with_batch_size(4).with_workers(2);
        assert_eq!(config.frame_queue_depth(), 8);
        assert_eq!(config.buffer_pool_capacity(), 25);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("PIPELINE_BATCH_SIZE", "4"),
            ("PIPELINE_SAMPLING", "every:5"),
            ("PIPELINE_WORKERS", "2"),
            ("PIPELINE_INFERENCE_TIMEOUT_MS", "1500"),
            ("PIPELINE_MEMORY_CRITICAL", "0.9"),
            ("PIPELINE_OVERFLOW_FACTOR", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = PipelineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.sampling_policy, SamplingPolicy::every_nth(5));
        assert_eq!(config.worker_count(), 2);
        assert_eq!(config.inference_timeout, Duration::from_millis(1500));
        assert!((config.memory_thresholds.critical - 0.9).abs() < f64::EPSILON);
        assert!((config.overflow_factor - 1.5).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_pool_smaller_than_batch() {
        let config = PipelineConfig::default()
            .with_workers(2)
            .with_batch_size(8)
            .with_pool(4, 1.0);
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let mut config = PipelineConfig::default().with_workers(2);
        config.memory_thresholds = MemoryThresholds {
            warning: 0.9,
            critical: 0.8,
            emergency: 0.95,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_batch_and_bad_overflow() {
        let config = PipelineConfig::default().with_workers(1).with_batch_size(0);
        assert!(config.validate().is_err());

        let config = PipelineConfig::default().with_workers(1).with_pool(16, 0.5);
        assert!(config.validate().is_err());
    }
}
