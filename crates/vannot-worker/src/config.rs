//! Worker configuration.

use std::env;
use std::time::Duration;

use vannot_pipeline::{FrameShape, PipelineConfig, ScriptedModel, SyntheticVideo};

use crate::error::{WorkerError, WorkerResult};

/// Where relayed pipeline events go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutput {
    /// Structured log lines only
    Log,
    /// One JSON document per event on stdout, plus log lines
    Json,
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Frames in the synthetic input video
    pub synthetic_frames: u64,
    pub frame_width: u32,
    pub frame_height: u32,
    pub frame_channels: u32,
    pub fps: f64,
    /// Simulated per-call model latency
    pub model_latency: Duration,
    /// Largest batch the simulated model accepts before reporting exhaustion
    pub model_batch_limit: Option<usize>,
    /// Hard limit for one job, after which the host cancels it
    pub job_timeout: Duration,
    /// Install the Prometheus recorder
    pub metrics_enabled: bool,
    pub event_output: EventOutput,
    /// Pipeline settings passed to every job
    pub pipeline: PipelineConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            synthetic_frames: 300,
            frame_width: 64,
            frame_height: 48,
            frame_channels: 3,
            fps: 30.0,
            model_latency: Duration::ZERO,
            model_batch_limit: None,
            job_timeout: Duration::from_secs(600),
            metrics_enabled: false,
            event_output: EventOutput::Log,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).map(|s| s.trim().to_string());

        Self {
            synthetic_frames: parse("WORKER_SYNTHETIC_FRAMES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.synthetic_frames),
            frame_width: parse("WORKER_FRAME_WIDTH")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.frame_width),
            frame_height: parse("WORKER_FRAME_HEIGHT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.frame_height),
            frame_channels: parse("WORKER_FRAME_CHANNELS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.frame_channels),
            fps: parse("WORKER_FPS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.fps),
            model_latency: parse("WORKER_MODEL_LATENCY_MS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.model_latency),
            model_batch_limit: parse("WORKER_MODEL_BATCH_LIMIT").and_then(|s| s.parse().ok()),
            job_timeout: parse("WORKER_JOB_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            metrics_enabled: parse("WORKER_METRICS_ENABLED")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.metrics_enabled),
            event_output: match parse("WORKER_EVENT_OUTPUT").map(|v| v.to_lowercase()) {
                Some(v) if v == "json" => EventOutput::Json,
                _ => defaults.event_output,
            },
            pipeline: PipelineConfig::from_lookup(&lookup),
        }
    }

    pub fn validate(&self) -> WorkerResult<()> {
        if self.synthetic_frames == 0 {
            return Err(WorkerError::config_error("WORKER_SYNTHETIC_FRAMES must be positive"));
        }
        if self.frame_width == 0 || self.frame_height == 0 || self.frame_channels == 0 {
            return Err(WorkerError::config_error("frame dimensions must be positive"));
        }
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(WorkerError::config_error(format!("invalid fps {}", self.fps)));
        }
        if self.job_timeout.is_zero() {
            return Err(WorkerError::config_error("WORKER_JOB_TIMEOUT_SECS must be positive"));
        }
        if self.model_batch_limit == Some(0) {
            return Err(WorkerError::config_error("WORKER_MODEL_BATCH_LIMIT must be positive"));
        }
        self.pipeline.validate()?;
        Ok(())
    }

    pub fn frame_shape(&self) -> FrameShape {
        FrameShape::new(self.frame_width, self.frame_height, self.frame_channels)
    }

    /// Input video for a synthetic run.
    pub fn synthetic_video(&self) -> SyntheticVideo {
        SyntheticVideo::new(self.synthetic_frames, self.frame_shape()).with_fps(self.fps)
    }

    /// Simulated detector matching the configured latency and batch limit.
    pub fn scripted_model(&self) -> ScriptedModel {
        let model = ScriptedModel::new().with_delay(self.model_latency);
        match self.model_batch_limit {
            Some(limit) => model.exhausted_above(limit),
            None => model,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.event_output, EventOutput::Log);
        assert!(!config.metrics_enabled);
    }

    #[test]
    fn test_from_lookup() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("WORKER_SYNTHETIC_FRAMES", "120"),
            ("WORKER_MODEL_BATCH_LIMIT", "2"),
            ("WORKER_METRICS_ENABLED", "true"),
            ("WORKER_EVENT_OUTPUT", "JSON"),
            ("WORKER_JOB_TIMEOUT_SECS", "5"),
            ("PIPELINE_BATCH_SIZE", "4"),
        ]));

        assert_eq!(config.synthetic_frames, 120);
        assert_eq!(config.model_batch_limit, Some(2));
        assert!(config.metrics_enabled);
        assert_eq!(config.event_output, EventOutput::Json);
        assert_eq!(config.job_timeout, Duration::from_secs(5));
        assert_eq!(config.pipeline.batch_size, 4);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("WORKER_SYNTHETIC_FRAMES", "lots"),
            ("WORKER_FPS", ""),
        ]));
        assert_eq!(config.synthetic_frames, 300);
        assert_eq!(config.fps, 30.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = WorkerConfig::default();
        config.frame_width = 0;
        assert!(matches!(config.validate(), Err(WorkerError::ConfigError(_))));

        let mut config = WorkerConfig::default();
        config.model_batch_limit = Some(0);
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.pipeline.batch_size = 0;
        assert!(matches!(config.validate(), Err(WorkerError::Pipeline(_))));
    }
}
