//! Memory pressure monitoring.
//!
//! The monitor samples memory periodically and reacts per threshold:
//! warning logs, critical shrinks the buffer pool and throttles the frame
//! source, emergency cancels the job.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::buffer_pool::BufferPool;
use crate::config::{MemoryThresholds, PressureConfig};
use crate::logging::JobLogger;
use crate::metrics;

/// Memory usage at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ResourceSnapshot {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub accelerator_used_bytes: Option<u64>,
    pub accelerator_limit_bytes: Option<u64>,
}

impl ResourceSnapshot {
    pub fn new(used_bytes: u64, limit_bytes: u64) -> Self {
        Self {
            used_bytes,
            limit_bytes,
            ..Default::default()
        }
    }

    pub fn with_accelerator(mut self, used_bytes: u64, limit_bytes: u64) -> Self {
        self.accelerator_used_bytes = Some(used_bytes);
        self.accelerator_limit_bytes = Some(limit_bytes);
        self
    }

    /// Highest of the host and accelerator usage ratios.
    pub fn usage_ratio(&self) -> f64 {
        let host = ratio(self.used_bytes, self.limit_bytes);
        match (self.accelerator_used_bytes, self.accelerator_limit_bytes) {
            (Some(used), Some(limit)) => host.max(ratio(used, limit)),
            _ => host,
        }
    }
}

fn ratio(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        used as f64 / limit as f64
    }
}

/// Severity derived from a usage ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

impl PressureLevel {
    pub fn from_ratio(ratio: f64, thresholds: &MemoryThresholds) -> Self {
        if ratio >= thresholds.emergency {
            PressureLevel::Emergency
        } else if ratio >= thresholds.critical {
            PressureLevel::Critical
        } else if ratio >= thresholds.warning {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
            PressureLevel::Emergency => "emergency",
        }
    }
}

/// Source of memory readings.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> io::Result<ResourceSnapshot>;
}

/// Reads process RSS and total system memory from `/proc`.
#[derive(Debug, Clone, Default)]
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
    fn sample(&self) -> io::Result<ResourceSnapshot> {
        let status = std::fs::read_to_string("/proc/self/status")?;
        let meminfo = std::fs::read_to_string("/proc/meminfo")?;

        let used = parse_kib_field(&status, "VmRSS:")
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "VmRSS missing"))?;
        let limit = parse_kib_field(&meminfo, "MemTotal:")
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "MemTotal missing"))?;

        Ok(ResourceSnapshot::new(used, limit))
    }
}

/// Parse a `Key:   1234 kB` line into bytes.
fn parse_kib_field(contents: &str, key: &str) -> Option<u64> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse::<u64>().ok())
        .map(|kib| kib * 1024)
}

/// Flags the monitor raises for the other stages.
#[derive(Debug, Default)]
pub struct PressureSignals {
    throttled: AtomicBool,
    emergency: Mutex<Option<f64>>,
}

impl PressureSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Acquire)
    }

    pub fn set_throttled(&self, throttled: bool) {
        self.throttled.store(throttled, Ordering::Release);
    }

    /// Record an emergency. The first reading is kept.
    pub fn trigger_emergency(&self, usage_percent: f64) {
        let mut slot = self.emergency.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(usage_percent);
    }

    /// Usage percent at the time of the emergency, if one occurred.
    pub fn emergency(&self) -> Option<f64> {
        *self.emergency.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Periodic memory sampler bound to one job.
pub struct PressureMonitor {
    probe: Arc<dyn MemoryProbe>,
    thresholds: MemoryThresholds,
    config: PressureConfig,
    pool: BufferPool,
    signals: Arc<PressureSignals>,
    cancel: CancellationToken,
    last_alert: HashMap<PressureLevel, Instant>,
    logger: JobLogger,
}

impl PressureMonitor {
    pub fn new(
        probe: Arc<dyn MemoryProbe>,
        thresholds: MemoryThresholds,
        config: PressureConfig,
        pool: BufferPool,
        signals: Arc<PressureSignals>,
        cancel: CancellationToken,
        logger: JobLogger,
    ) -> Self {
        Self {
            probe,
            thresholds,
            config,
            pool,
            signals,
            cancel,
            last_alert: HashMap::new(),
            logger,
        }
    }

    /// Take one reading. Probe failures are logged and yield `None`.
    pub fn sample(&self) -> Option<ResourceSnapshot> {
        match self.probe.sample() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                self.logger
                    .log_warning(&format!("Memory probe failed: {}", e));
                None
            }
        }
    }

    /// React to a snapshot and return its level.
    pub fn evaluate(&mut self, snapshot: &ResourceSnapshot, now: Instant) -> PressureLevel {
        let usage = snapshot.usage_ratio();
        let level = PressureLevel::from_ratio(usage, &self.thresholds);
        metrics::record_memory_usage(usage);

        self.signals.set_throttled(level >= PressureLevel::Critical);

        match level {
            PressureLevel::Normal => {}
            PressureLevel::Emergency => {
                // Not debounced: the job ends here.
                if self.signals.emergency().is_none() {
                    metrics::record_pressure_alert(level);
                    self.logger.log_error(&format!(
                        "Memory emergency at {:.1}% usage, cancelling job",
                        usage * 100.0
                    ));
                }
                self.signals.trigger_emergency(usage * 100.0);
                self.cancel.cancel();
            }
            PressureLevel::Warning | PressureLevel::Critical => {
                if self.should_alert(level, now) {
                    metrics::record_pressure_alert(level);
                    if level == PressureLevel::Critical {
                        let target = (self.pool.capacity() as f64 * self.config.shrink_fraction)
                            .ceil() as usize;
                        let removed = self.pool.shrink(target);
                        self.logger.log_warning(&format!(
                            "Memory critical at {:.1}% usage, released {} pooled buffers and throttled reads",
                            usage * 100.0,
                            removed
                        ));
                    } else {
                        self.logger.log_warning(&format!(
                            "Memory usage high: {:.1}%",
                            usage * 100.0
                        ));
                    }
                }
            }
        }

        level
    }

    fn should_alert(&mut self, level: PressureLevel, now: Instant) -> bool {
        match self.last_alert.get(&level) {
            Some(last) if now.duration_since(*last) < self.config.alert_cooldown => false,
            _ => {
                self.last_alert.insert(level, now);
                true
            }
        }
    }

    /// Sample until `stop` or the job's cancellation token fires.
    pub async fn run(mut self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(snapshot) = self.sample() {
                        self.evaluate(&snapshot, Instant::now());
                    }
                }
            }
        }
        self.signals.set_throttled(false);
    }
}
