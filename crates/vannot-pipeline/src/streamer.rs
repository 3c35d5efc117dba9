//! Result streamer stage.
//!
//! Batches complete out of order when several workers run at once. The
//! streamer holds completed batches in a bounded reorder window and emits
//! per-frame results in sequence order. If a batch is missing for too long,
//! or the window fills up, the streamer emits around the gap; the late batch
//! is then emitted on arrival with `out_of_order` set.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use vannot_models::{FrameDetections, JobStatus, PipelineEvent};

use crate::dispatcher::BatchOutcome;
use crate::logging::JobLogger;
use crate::metrics;

/// How the job ended, as decided by the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn completed() -> Self {
        Self {
            status: JobStatus::Completed,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamerSettings {
    /// Completed batches held while waiting for a missing one
    pub reorder_window: usize,
    pub reorder_timeout: Duration,
    pub progress_interval_frames: u64,
    /// Expected number of sampled frames, if known
    pub total_estimate: Option<u64>,
}

/// Counters reported when the streamer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamerReport {
    pub frames_emitted: u64,
    pub out_of_order: u64,
    pub gaps_skipped: u64,
}

pub struct ResultStreamer {
    input: mpsc::Receiver<BatchOutcome>,
    events: mpsc::Sender<PipelineEvent>,
    finish: oneshot::Receiver<JobOutcome>,
    frames_processed: Arc<AtomicU64>,
    settings: StreamerSettings,
    logger: JobLogger,

    pending: BTreeMap<u64, BatchOutcome>,
    next_expected: u64,
    gap_deadline: Option<Instant>,
    last_progress: u64,
    receiver_gone: bool,
    report: StreamerReport,
}

impl ResultStreamer {
    pub fn new(
        input: mpsc::Receiver<BatchOutcome>,
        events: mpsc::Sender<PipelineEvent>,
        finish: oneshot::Receiver<JobOutcome>,
        frames_processed: Arc<AtomicU64>,
        settings: StreamerSettings,
        logger: JobLogger,
    ) -> Self {
        Self {
            input,
            events,
            finish,
            frames_processed,
            settings,
            logger,
            pending: BTreeMap::new(),
            next_expected: 0,
            gap_deadline: None,
            last_progress: 0,
            receiver_gone: false,
            report: StreamerReport::default(),
        }
    }

    /// Stream results until the input closes and the controller reports the
    /// outcome, then emit the terminal event.
    pub async fn run(mut self) -> StreamerReport {
        let outcome = loop {
            let gap_deadline = self.gap_deadline;
            tokio::select! {
                biased;
                next = self.input.recv() => match next {
                    Some(batch) => self.accept(batch).await,
                    None => break self.wait_for_outcome().await,
                },
                _ = sleep_until_opt(gap_deadline) => {
                    self.logger.log_warning(&format!(
                        "Batch starting at frame {} missing for {:?}, emitting around it",
                        self.next_expected, self.settings.reorder_timeout
                    ));
                    self.flush_pending().await;
                }
                outcome = &mut self.finish => {
                    // Controller gave up draining; emit what arrived.
                    break outcome.unwrap_or_else(|_| JobOutcome::failed("controller stopped"));
                }
            }
        };

        self.flush_pending().await;
        self.finish_job(outcome).await;
        self.report
    }

    async fn wait_for_outcome(&mut self) -> JobOutcome {
        self.flush_pending().await;
        (&mut self.finish)
            .await
            .unwrap_or_else(|_| JobOutcome::failed("controller stopped"))
    }

    async fn accept(&mut self, batch: BatchOutcome) {
        let first = batch.first_sequence;

        if first < self.next_expected {
            self.logger.log_warning(&format!(
                "Batch starting at frame {} arrived after later frames",
                first
            ));
            self.emit_batch(batch, true).await;
            return;
        }

        self.pending.insert(first, batch);
        self.drain_ready().await;

        if self.pending.len() > self.settings.reorder_window {
            self.logger.log_warning(&format!(
                "Reorder window of {} batches full, emitting around frame {}",
                self.settings.reorder_window, self.next_expected
            ));
            self.flush_pending().await;
        }
    }

    /// Emit every batch that continues the in-order run.
    async fn drain_ready(&mut self) {
        let mut advanced = false;
        while let Some(batch) = self.pending.remove(&self.next_expected) {
            self.next_expected = batch.first_sequence + batch.frames.len().max(1) as u64;
            self.emit_batch(batch, false).await;
            advanced = true;
        }

        if self.pending.is_empty() {
            self.gap_deadline = None;
        } else if advanced || self.gap_deadline.is_none() {
            self.gap_deadline = Some(Instant::now() + self.settings.reorder_timeout);
        }
    }

    /// Give up on the current gap and emit everything held, in order.
    async fn flush_pending(&mut self) {
        while let Some((first, batch)) = self.pending.pop_first() {
            if first > self.next_expected {
                self.report.gaps_skipped += 1;
            }
            self.next_expected = first + batch.frames.len().max(1) as u64;
            self.emit_batch(batch, false).await;
        }
        self.gap_deadline = None;
    }

    async fn emit_batch(&mut self, batch: BatchOutcome, out_of_order: bool) {
        for mut frame in batch.frames {
            frame.out_of_order = out_of_order;
            self.emit_frame(frame).await;
        }
    }

    async fn emit_frame(&mut self, frame: FrameDetections) {
        let out_of_order = frame.out_of_order;
        self.send(PipelineEvent::Detections(frame)).await;

        let processed = self.frames_processed.fetch_add(1, Ordering::AcqRel) + 1;
        self.report.frames_emitted += 1;
        if out_of_order {
            self.report.out_of_order += 1;
        }
        metrics::record_frame_emitted(out_of_order);

        if processed - self.last_progress >= self.settings.progress_interval_frames {
            self.last_progress = processed;
            self.logger.log_progress(&format!("{} frames processed", processed));
            self.send(PipelineEvent::Progress {
                frames_processed: processed,
                total_estimate: self.settings.total_estimate,
            })
            .await;
        }
    }

    async fn finish_job(&mut self, outcome: JobOutcome) {
        let frames_processed = self.frames_processed.load(Ordering::Acquire);
        self.logger.log_completion(&format!(
            "{} frames emitted, status {}",
            frames_processed,
            outcome.status.as_str()
        ));
        self.send(PipelineEvent::Finished {
            status: outcome.status,
            frames_processed,
            error: outcome.error,
        })
        .await;
    }

    async fn send(&mut self, event: PipelineEvent) {
        if self.receiver_gone {
            return;
        }
        if self.events.send(event).await.is_err() {
            self.receiver_gone = true;
            self.logger
                .log_warning("Event receiver dropped, discarding remaining events");
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vannot_models::JobId;

    fn outcome(first: u64, len: u64) -> BatchOutcome {
        BatchOutcome {
            first_sequence: first,
            frames: (first..first + len)
                .map(|seq| FrameDetections::ok(seq, seq * 5, seq as f64, Vec::new()))
                .collect(),
        }
    }

    struct Harness {
        batches: mpsc::Sender<BatchOutcome>,
        finish: oneshot::Sender<JobOutcome>,
        events: mpsc::Receiver<PipelineEvent>,
        processed: Arc<AtomicU64>,
        task: tokio::task::JoinHandle<StreamerReport>,
    }

    fn harness(window: usize, timeout: Duration, interval: u64) -> Harness {
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (finish_tx, finish_rx) = oneshot::channel();
        let processed = Arc::new(AtomicU64::new(0));
        let streamer = ResultStreamer::new(
            batch_rx,
            event_tx,
            finish_rx,
            Arc::clone(&processed),
            StreamerSettings {
                reorder_window: window,
                reorder_timeout: timeout,
                progress_interval_frames: interval,
                total_estimate: Some(12),
            },
            JobLogger::new(&JobId::new(), "streamer"),
        );
        Harness {
            batches: batch_tx,
            finish: finish_tx,
            events: event_rx,
            processed,
            task: tokio::spawn(streamer.run()),
        }
    }

    async fn collect(mut events: mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Some(event) = events.recv().await {
            out.push(event);
        }
        out
    }

    fn detections(events: &[PipelineEvent]) -> Vec<(u64, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Detections(f) => Some((f.sequence_number, f.out_of_order)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reorders_batches() {
        let h = harness(8, Duration::from_secs(5), 100);
        h.batches.send(outcome(4, 4)).await.unwrap();
        h.batches.send(outcome(8, 4)).await.unwrap();
        h.batches.send(outcome(0, 4)).await.unwrap();
        drop(h.batches);
        h.finish.send(JobOutcome::completed()).unwrap();

        let report = h.task.await.unwrap();
        let events = collect(h.events).await;

        let seqs: Vec<u64> = detections(&events).iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, (0..12).collect::<Vec<_>>());
        assert_eq!(report.frames_emitted, 12);
        assert_eq!(report.out_of_order, 0);
        assert_eq!(h.processed.load(Ordering::Acquire), 12);

        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_gap_timeout_then_late_batch_flagged() {
        let h = harness(8, Duration::from_millis(30), 100);
        h.batches.send(outcome(4, 4)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        h.batches.send(outcome(0, 4)).await.unwrap();
        drop(h.batches);
        h.finish.send(JobOutcome::completed()).unwrap();

        let report = h.task.await.unwrap();
        let events = collect(h.events).await;
        let emitted = detections(&events);

        assert_eq!(emitted.len(), 8);
        assert_eq!(emitted[0], (4, false));
        assert_eq!(emitted[4], (0, true));
        assert_eq!(report.out_of_order, 4);
        assert_eq!(report.gaps_skipped, 1);

        let in_order: Vec<u64> = emitted.iter().filter(|(_, o)| !o).map(|(s, _)| *s).collect();
        assert!(in_order.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_window_overflow_emits_around_gap() {
        let h = harness(1, Duration::from_secs(60), 100);
        h.batches.send(outcome(2, 2)).await.unwrap();
        h.batches.send(outcome(4, 2)).await.unwrap();
        h.batches.send(outcome(0, 2)).await.unwrap();
        drop(h.batches);
        h.finish.send(JobOutcome::completed()).unwrap();

        h.task.await.unwrap();
        let emitted = detections(&collect(h.events).await);
        assert_eq!(
            emitted,
            vec![(2, false), (3, false), (4, false), (5, false), (0, true), (1, true)]
        );
    }

    #[tokio::test]
    async fn test_progress_interval() {
        let h = harness(8, Duration::from_secs(5), 4);
        h.batches.send(outcome(0, 10)).await.unwrap();
        drop(h.batches);
        h.finish.send(JobOutcome::completed()).unwrap();
        h.task.await.unwrap();

        let progress: Vec<u64> = collect(h.events)
            .await
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Progress {
                    frames_processed, ..
                } => Some(*frames_processed),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![4, 8]);
    }

    #[tokio::test]
    async fn test_keeps_draining_without_receiver() {
        let h = harness(8, Duration::from_secs(5), 1);
        drop(h.events);
        for first in (0..40).step_by(4) {
            h.batches.send(outcome(first, 4)).await.unwrap();
        }
        drop(h.batches);
        h.finish.send(JobOutcome::failed("boom")).unwrap();

        let report = h.task.await.unwrap();
        assert_eq!(report.frames_emitted, 40);
    }

    #[tokio::test]
    async fn test_finish_before_input_closes() {
        let h = harness(8, Duration::from_secs(5), 100);
        h.batches.send(outcome(0, 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.finish
            .send(JobOutcome::failed("drain timed out"))
            .unwrap();

        h.task.await.unwrap();
        let events = collect(h.events).await;
        match events.last().unwrap() {
            PipelineEvent::Finished { status, error, .. } => {
                assert_eq!(*status, JobStatus::Failed);
                assert_eq!(error.as_deref(), Some("drain timed out"));
            }
            other => panic!("unexpected terminal event {:?}", other),
        }
        drop(h.batches);
    }
}
