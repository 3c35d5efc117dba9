//! Synthetic video source and scripted detection model.
//!
//! Used by the self-check binary and the test suites to drive the pipeline
//! without a decoder or an inference runtime.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::buffer_pool::FrameShape;
use crate::error::{ModelError, VideoError};
use crate::model::{DetectionModel, FrameView, RawDetection};
use crate::video::{FrameMeta, FrameRead, VideoInfo, VideoSource};

/// In-memory video producing a deterministic pixel pattern.
#[derive(Debug, Clone)]
pub struct SyntheticVideo {
    shape: FrameShape,
    frame_count: u64,
    fps: f64,
    report_frame_count: bool,
    open_error: Option<String>,
    decode_failures: HashSet<u64>,
    fatal_at: Option<u64>,
    frame_delay: Option<Duration>,
    next_index: u64,
}

impl SyntheticVideo {
    pub fn new(frame_count: u64, shape: FrameShape) -> Self {
        Self {
            shape,
            frame_count,
            fps: 30.0,
            report_frame_count: true,
            open_error: None,
            decode_failures: HashSet::new(),
            fatal_at: None,
            frame_delay: None,
            next_index: 0,
        }
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    /// Fail `open()` as an unreadable container would.
    pub fn failing_open(mut self, message: impl Into<String>) -> Self {
        self.open_error = Some(message.into());
        self
    }

    /// Report a per-frame decode error at `index`.
    pub fn with_decode_failure(mut self, index: u64) -> Self {
        self.decode_failures.insert(index);
        self
    }

    /// End the stream with a fatal read error at `index`.
    pub fn with_fatal_error_at(mut self, index: u64) -> Self {
        self.fatal_at = Some(index);
        self
    }

    /// Sleep before producing each frame.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    /// Do not report a frame count on open.
    pub fn without_frame_count(mut self) -> Self {
        self.report_frame_count = false;
        self
    }
}

#[async_trait]
impl VideoSource for SyntheticVideo {
    async fn open(&mut self) -> Result<VideoInfo, VideoError> {
        if let Some(message) = &self.open_error {
            return Err(VideoError::unreadable(message.clone()));
        }
        Ok(VideoInfo {
            shape: self.shape,
            estimated_frame_count: self.report_frame_count.then_some(self.frame_count),
            fps: self.fps,
        })
    }

    async fn next_frame(&mut self, dst: Option<&mut [u8]>) -> Result<FrameRead, VideoError> {
        if self.next_index >= self.frame_count {
            return Ok(FrameRead::EndOfStream);
        }
        if let Some(delay) = self.frame_delay {
            tokio::time::sleep(delay).await;
        }

        let index = self.next_index;
        if self.fatal_at == Some(index) {
            return Err(VideoError::unreadable(format!("stream truncated at frame {}", index)));
        }
        self.next_index += 1;

        if self.decode_failures.contains(&index) {
            return Err(VideoError::frame_decode(format!("corrupt slice in frame {}", index)));
        }

        let bytes_written = match dst {
            Some(dst) => {
                dst.fill((index % 251) as u8);
                dst.len()
            }
            None => 0,
        };

        Ok(FrameRead::Frame(FrameMeta {
            timestamp_seconds: index as f64 / self.fps,
            bytes_written,
        }))
    }
}

/// Detection model with scripted failures and call accounting.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    exhaust_above: Option<usize>,
    fail_sequences: HashSet<u64>,
    delay: Duration,
    slow_above: Option<(usize, Duration)>,
    detections_per_frame: usize,
    calls: AtomicU64,
    frames_seen: AtomicU64,
    largest_batch: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            detections_per_frame: 1,
            ..Default::default()
        }
    }

    /// Report resource exhaustion for batches larger than `size`.
    pub fn exhausted_above(mut self, size: usize) -> Self {
        self.exhaust_above = Some(size);
        self
    }

    /// Fail any call that includes `sequence_number`.
    pub fn failing_on(mut self, sequence_number: u64) -> Self {
        self.fail_sequences.insert(sequence_number);
        self
    }

    /// Block every call for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block calls larger than `size` for `delay`.
    pub fn slow_above(mut self, size: usize, delay: Duration) -> Self {
        self.slow_above = Some((size, delay));
        self
    }

    pub fn with_detections_per_frame(mut self, count: usize) -> Self {
        self.detections_per_frame = count;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen.load(Ordering::Acquire)
    }

    pub fn largest_batch(&self) -> usize {
        self.largest_batch.load(Ordering::Acquire)
    }

    /// Highest number of concurrent calls observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    fn detections_for(&self, frame: &FrameView<'_>) -> Vec<RawDetection> {
        (0..self.detections_per_frame)
            .map(|i| {
                let offset = ((frame.sequence_number as usize + i) % 10) as f32 / 20.0;
                RawDetection::new(
                    (frame.sequence_number as usize + i) % 80,
                    0.9,
                    offset,
                    offset,
                    0.2,
                    0.3,
                )
            })
            .collect()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DetectionModel for ScriptedModel {
    fn predict_batch(&self, frames: &[FrameView<'_>]) -> Result<Vec<Vec<RawDetection>>, ModelError> {
        let running = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(running, Ordering::AcqRel);
        self.calls.fetch_add(1, Ordering::AcqRel);
        self.largest_batch.fetch_max(frames.len(), Ordering::AcqRel);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some((size, delay)) = self.slow_above {
            if frames.len() > size {
                std::thread::sleep(delay);
            }
        }

        if let Some(limit) = self.exhaust_above {
            if frames.len() > limit {
                return Err(ModelError::resource_exhausted(format!(
                    "cannot fit {} frames, limit {}",
                    frames.len(),
                    limit
                )));
            }
        }
        if frames
            .iter()
            .any(|f| self.fail_sequences.contains(&f.sequence_number))
        {
            return Err(ModelError::failed("scripted failure"));
        }

        self.frames_seen.fetch_add(frames.len() as u64, Ordering::AcqRel);
        Ok(frames.iter().map(|f| self.detections_for(f)).collect())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_video_sequence() {
        let shape = FrameShape::new(2, 2, 3);
        let mut video = SyntheticVideo::new(3, shape).with_decode_failure(1);
        let info = video.open().await.unwrap();
        assert_eq!(info.estimated_frame_count, Some(3));

        let mut buf = vec![0u8; shape.byte_len()];
        let first = video.next_frame(Some(&mut buf)).await.unwrap();
        assert_eq!(
            first,
            FrameRead::Frame(FrameMeta {
                timestamp_seconds: 0.0,
                bytes_written: 12
            })
        );

        let err = video.next_frame(None).await.unwrap_err();
        assert!(err.is_per_frame());

        assert!(matches!(video.next_frame(None).await.unwrap(), FrameRead::Frame(_)));
        assert_eq!(video.next_frame(None).await.unwrap(), FrameRead::EndOfStream);
    }

    #[tokio::test]
    async fn test_failing_open() {
        let mut video = SyntheticVideo::new(3, FrameShape::new(2, 2, 3)).failing_open("no moov atom");
        assert!(matches!(video.open().await, Err(VideoError::Unreadable(_))));
    }

    #[test]
    fn test_scripted_model_exhaustion() {
        let model = ScriptedModel::new().exhausted_above(2);
        let data = [0u8; 4];
        let frame = FrameView {
            sequence_number: 3,
            shape: FrameShape::new(2, 2, 1),
            data: &data,
        };

        let err = model.predict_batch(&[frame, frame, frame]).unwrap_err();
        assert!(matches!(err, ModelError::ResourceExhausted(_)));

        let ok = model.predict_batch(&[frame, frame]).unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok[0][0].class_id, 3);
        assert_eq!(model.calls(), 2);
        assert_eq!(model.frames_seen(), 2);
        assert_eq!(model.largest_batch(), 3);
    }
}
