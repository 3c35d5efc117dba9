//! Frame source stage.
//!
//! Decodes frames sequentially, applies the sampling policy, and sends each
//! sampled frame downstream in a pooled buffer. Backpressure comes from two
//! places: an exhausted buffer pool and a full frame channel. Neither drops
//! frames; the source simply waits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use vannot_models::SamplingPolicy;

use crate::buffer_pool::{BufferHandle, BufferPool};
use crate::control::StageControl;
use crate::error::{PipelineError, PipelineResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::pressure::PressureSignals;
use crate::video::{FrameRead, VideoSource};

/// One sampled frame travelling through the pipeline.
#[derive(Debug)]
pub struct FrameTask {
    /// Gap-free from 0 within a job
    pub sequence_number: u64,
    pub source_frame_index: u64,
    pub timestamp_seconds: f64,
    pub buffer: BufferHandle,
    /// Decode error for frames that must not reach the model
    pub malformed: Option<String>,
}

impl FrameTask {
    pub fn is_malformed(&self) -> bool {
        self.malformed.is_some()
    }
}

/// Counters reported when the source stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceReport {
    pub frames_decoded: u64,
    pub frames_sampled: u64,
    /// Whether the source stopped because the job was cancelled
    pub cancelled: bool,
}

/// Static settings for the frame source.
#[derive(Debug, Clone, Copy)]
pub struct SourceSettings {
    pub policy: SamplingPolicy,
    /// Used to timestamp frames that failed to decode
    pub fps: f64,
    pub acquire_backoff: Duration,
    pub throttle_backoff: Duration,
}

/// Frame source stage.
pub struct FrameSource {
    video: Box<dyn VideoSource>,
    pool: BufferPool,
    output: mpsc::Sender<FrameTask>,
    control: StageControl,
    signals: Arc<PressureSignals>,
    settings: SourceSettings,
    logger: JobLogger,
}

impl FrameSource {
    pub fn new(
        video: Box<dyn VideoSource>,
        pool: BufferPool,
        output: mpsc::Sender<FrameTask>,
        control: StageControl,
        signals: Arc<PressureSignals>,
        settings: SourceSettings,
        logger: JobLogger,
    ) -> Self {
        Self {
            video,
            pool,
            output,
            control,
            signals,
            settings,
            logger,
        }
    }

    /// Read until end of stream, cancellation or a fatal read error. The
    /// output channel closes when this returns.
    pub async fn run(mut self) -> PipelineResult<SourceReport> {
        self.logger
            .log_start(&format!("sampling policy {}", self.settings.policy));

        let mut report = SourceReport::default();
        let mut frame_index: u64 = 0;
        let mut sequence_number: u64 = 0;

        loop {
            if !self.control.wait_if_paused().await {
                report.cancelled = true;
                break;
            }

            let sampled = self.settings.policy.includes(frame_index);
            let mut buffer = if sampled {
                match self.acquire_buffer().await {
                    Some(buffer) => Some(buffer),
                    None => {
                        report.cancelled = true;
                        break;
                    }
                }
            } else {
                None
            };

            let read = tokio::select! {
                biased;
                _ = self.control.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                read = self.video.next_frame(buffer.as_mut().map(|b| b.as_mut_slice())) => read,
            };

            let (timestamp_seconds, malformed) = match read {
                Ok(FrameRead::EndOfStream) => break,
                Ok(FrameRead::Frame(meta)) => {
                    let malformed = buffer
                        .as_ref()
                        .filter(|b| meta.bytes_written != b.len())
                        .map(|b| {
                            format!(
                                "decoded {} bytes, expected {}",
                                meta.bytes_written,
                                b.len()
                            )
                        });
                    (meta.timestamp_seconds, malformed)
                }
                Err(e) if e.is_per_frame() => {
                    self.logger
                        .log_warning(&format!("Frame {} failed to decode: {}", frame_index, e));
                    (self.estimated_timestamp(frame_index), Some(e.to_string()))
                }
                Err(e) => {
                    self.logger
                        .log_error(&format!("Read failed at frame {}: {}", frame_index, e));
                    return Err(PipelineError::VideoRead {
                        frame_index,
                        source: e,
                    });
                }
            };

            let current_index = frame_index;
            frame_index += 1;
            report.frames_decoded += 1;
            metrics::record_frame_decoded(sampled);

            let Some(buffer) = buffer.take() else {
                continue;
            };

            let task = FrameTask {
                sequence_number,
                source_frame_index: current_index,
                timestamp_seconds,
                buffer,
                malformed,
            };

            let sent = tokio::select! {
                biased;
                _ = self.control.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                sent = self.output.send(task) => sent,
            };
            if sent.is_err() {
                // Downstream is gone; nothing left to feed.
                break;
            }

            sequence_number += 1;
            report.frames_sampled += 1;
        }

        self.logger.log_completion(&format!(
            "{} frames decoded, {} sampled{}",
            report.frames_decoded,
            report.frames_sampled,
            if report.cancelled { " (cancelled)" } else { "" }
        ));
        Ok(report)
    }

    fn estimated_timestamp(&self, frame_index: u64) -> f64 {
        if self.settings.fps > 0.0 {
            frame_index as f64 / self.settings.fps
        } else {
            0.0
        }
    }

    /// Acquire a buffer, backing off while the pool is exhausted or memory
    /// is critical. `None` on cancellation.
    async fn acquire_buffer(&mut self) -> Option<BufferHandle> {
        loop {
            if self.signals.is_throttled() {
                tokio::select! {
                    biased;
                    _ = self.control.cancelled() => return None,
                    _ = tokio::time::sleep(self.settings.throttle_backoff) => {}
                }
            }

            match self.pool.acquire() {
                Ok(buffer) => return Some(buffer),
                Err(_) => {
                    tokio::select! {
                        biased;
                        _ = self.control.cancelled() => return None,
                        _ = tokio::time::sleep(self.settings.acquire_backoff) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::FrameShape;
    use crate::synthetic::SyntheticVideo;
    use std::time::Instant;
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;
    use vannot_models::JobId;

    fn shape() -> FrameShape {
        FrameShape::new(4, 2, 3)
    }

    fn settings(policy: SamplingPolicy) -> SourceSettings {
        SourceSettings {
            policy,
            fps: 30.0,
            acquire_backoff: Duration::from_millis(2),
            throttle_backoff: Duration::from_millis(30),
        }
    }

    struct Wiring {
        source: FrameSource,
        frames: mpsc::Receiver<FrameTask>,
        signals: Arc<PressureSignals>,
        cancel: CancellationToken,
        _pause: watch::Sender<bool>,
    }

    fn wire(video: SyntheticVideo, pool: &BufferPool, policy: SamplingPolicy) -> Wiring {
        let (tx, frames) = mpsc::channel(16);
        let (pause, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let signals = Arc::new(PressureSignals::new());
        let source = FrameSource::new(
            Box::new(video),
            pool.clone(),
            tx,
            StageControl::new(cancel.clone(), pause_rx),
            Arc::clone(&signals),
            settings(policy),
            JobLogger::new(&JobId::new(), "source"),
        );
        Wiring {
            source,
            frames,
            signals,
            cancel,
            _pause: pause,
        }
    }

    #[tokio::test]
    async fn test_throttle_delays_each_acquisition() {
        let pool = BufferPool::new(shape(), 8, 1.0);
        let mut wiring = wire(SyntheticVideo::new(3, shape()), &pool, SamplingPolicy::All);
        wiring.signals.set_throttled(true);

        let started = Instant::now();
        let report = wiring.source.run().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(report.frames_sampled, 3);

        let mut sequences = Vec::new();
        while let Some(task) = wiring.frames.recv().await {
            sequences.push(task.sequence_number);
        }
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_exhausted_pool_waits_without_dropping_frames() {
        let pool = BufferPool::new(shape(), 2, 1.0);
        let wiring = wire(SyntheticVideo::new(10, shape()), &pool, SamplingPolicy::All);
        let mut frames = wiring.frames;
        let source = tokio::spawn(wiring.source.run());

        let mut sequences = Vec::new();
        let mut indices = Vec::new();
        while let Some(task) = frames.recv().await {
            sequences.push(task.sequence_number);
            indices.push(task.source_frame_index);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let report = source.await.unwrap().unwrap();
        assert_eq!(sequences, (0..10).collect::<Vec<_>>());
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        assert_eq!(report.frames_sampled, 10);

        let stats = pool.stats();
        assert!(stats.exhausted > 0);
        assert_eq!(stats.peak_in_use, 2);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_sampling_keeps_sequence_gap_free() {
        let pool = BufferPool::new(shape(), 4, 1.0);
        let video = SyntheticVideo::new(9, shape()).with_decode_failure(5);
        let mut wiring = wire(video, &pool, SamplingPolicy::every_nth(3));

        let report = wiring.source.run().await.unwrap();
        assert_eq!(report.frames_decoded, 9);
        assert_eq!(report.frames_sampled, 3);

        let mut tasks = Vec::new();
        while let Some(task) = wiring.frames.recv().await {
            tasks.push(task);
        }
        let sequences: Vec<u64> = tasks.iter().map(|t| t.sequence_number).collect();
        let indices: Vec<u64> = tasks.iter().map(|t| t.source_frame_index).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(indices, vec![2, 5, 8]);
        assert!(!tasks[0].is_malformed());
        assert!(tasks[1].is_malformed());
        assert!((tasks[1].timestamp_seconds - 5.0 / 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let pool = BufferPool::new(shape(), 4, 1.0);
        let mut wiring = wire(SyntheticVideo::new(9, shape()), &pool, SamplingPolicy::All);
        wiring.cancel.cancel();

        let report = wiring.source.run().await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.frames_sampled, 0);
        assert!(wiring.frames.recv().await.is_none());
        assert_eq!(pool.stats().in_use, 0);
    }
}
