//! Inference dispatcher stage.
//!
//! Runs batches through the detection model on a bounded worker pool. A
//! batch whose call runs out of memory or times out is split in half and
//! each half retried, down to single frames; a single frame that still
//! fails becomes a failure-flagged result. Every batch therefore yields
//! exactly one result per frame.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use vannot_models::{FailureKind, FrameDetections, FrameFailure};

use crate::assembler::Batch;
use crate::control::StageControl;
use crate::error::ModelError;
use crate::logging::JobLogger;
use crate::metrics;
use crate::model::{DetectionModel, FrameView, RawDetection};
use crate::records::RecordFilter;
use crate::source::FrameTask;

/// Results for one batch, keyed by its first sequence number.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub first_sequence: u64,
    /// One entry per frame of the batch, in sequence order
    pub frames: Vec<FrameDetections>,
}

#[derive(Debug)]
struct CeilingState {
    current: usize,
    successes: u32,
}

/// Upper bound on frames per model call.
///
/// Lowered to half the failing size after a resource failure and doubled
/// back after `recovery_successes` consecutive successful calls.
#[derive(Debug)]
pub struct BatchCeiling {
    state: Mutex<CeilingState>,
    max: usize,
    recovery_successes: u32,
}

impl BatchCeiling {
    pub fn new(max: usize, recovery_successes: u32) -> Self {
        let max = max.max(1);
        Self {
            state: Mutex::new(CeilingState {
                current: max,
                successes: 0,
            }),
            max,
            recovery_successes: recovery_successes.max(1),
        }
    }

    pub fn current(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).current
    }

    /// Record a successful call.
    pub fn success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.current >= self.max {
            return;
        }
        state.successes += 1;
        if state.successes >= self.recovery_successes {
            state.current = (state.current * 2).min(self.max);
            state.successes = 0;
            metrics::record_batch_ceiling(state.current);
        }
    }

    /// Record a resource failure of a call with `size` frames.
    pub fn failure(&self, size: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.current = state.current.min((size / 2).max(1));
        state.successes = 0;
        metrics::record_batch_ceiling(state.current);
    }
}

/// Settings for [`BatchInvoker`].
#[derive(Debug, Clone, Copy)]
pub struct InvokerSettings {
    pub batch_size: usize,
    pub inference_timeout: Duration,
    pub recovery_successes: u32,
    pub filter: RecordFilter,
}

enum CallFailure {
    Exhausted(String),
    Timeout,
    Failed(String),
}

struct InvokerInner {
    model: Arc<dyn DetectionModel>,
    settings: InvokerSettings,
    ceiling: BatchCeiling,
    logger: JobLogger,
}

/// Runs single batches through the model with the degradation policy.
#[derive(Clone)]
pub struct BatchInvoker {
    inner: Arc<InvokerInner>,
}

impl BatchInvoker {
    pub fn new(model: Arc<dyn DetectionModel>, settings: InvokerSettings, logger: JobLogger) -> Self {
        Self {
            inner: Arc::new(InvokerInner {
                ceiling: BatchCeiling::new(settings.batch_size, settings.recovery_successes),
                model,
                settings,
                logger,
            }),
        }
    }

    /// Current batch ceiling.
    pub fn ceiling(&self) -> usize {
        self.inner.ceiling.current()
    }

    /// Run one batch. Returns one result per frame, ordered by sequence
    /// number. Frame buffers are released as each model call returns.
    pub async fn invoke(&self, batch: Batch) -> Vec<FrameDetections> {
        let size = batch.len();
        let mut results = Vec::with_capacity(size);

        let (malformed, frames): (Vec<FrameTask>, Vec<FrameTask>) =
            batch.into_tasks().into_iter().partition(FrameTask::is_malformed);

        for task in malformed {
            let message = task.malformed.clone().unwrap_or_default();
            results.push(self.failed(&task, FailureKind::Malformed, message));
        }

        let mut frames: Vec<Arc<FrameTask>> = frames.into_iter().map(Arc::new).collect();
        let mut pending: Vec<Vec<Arc<FrameTask>>> = Vec::new();
        let ceiling = self.inner.ceiling.current();
        while frames.len() > ceiling {
            let rest = frames.split_off(ceiling);
            pending.push(frames);
            frames = rest;
        }
        if !frames.is_empty() {
            pending.push(frames);
        }
        // Process chunks front to back.
        pending.reverse();

        while let Some(chunk) = pending.pop() {
            let chunk_len = chunk.len();
            match self.call_model(&chunk).await {
                Ok(raw) => {
                    self.inner.ceiling.success();
                    results.extend(self.convert(&chunk, &raw));
                }
                Err(CallFailure::Failed(message)) => {
                    for task in &chunk {
                        results.push(self.failed(task, FailureKind::Model, message.clone()));
                    }
                }
                Err(failure) => {
                    let (kind, message) = match failure {
                        CallFailure::Exhausted(message) => (FailureKind::ResourceExhausted, message),
                        _ => (
                            FailureKind::Timeout,
                            format!(
                                "inference exceeded {:?}",
                                self.inner.settings.inference_timeout
                            ),
                        ),
                    };
                    self.inner.ceiling.failure(chunk_len);

                    if chunk_len == 1 {
                        results.push(self.failed(&chunk[0], kind, message));
                    } else {
                        metrics::record_batch_split();
                        self.inner.logger.log_warning(&format!(
                            "Splitting batch of {} frames after {}: {}",
                            chunk_len, kind, message
                        ));
                        let mut first = chunk;
                        let second = first.split_off(chunk_len / 2);
                        pending.push(second);
                        pending.push(first);
                    }
                }
            }
        }

        results.sort_by_key(|r| r.sequence_number);
        results
    }

    async fn call_model(&self, chunk: &[Arc<FrameTask>]) -> Result<Vec<Vec<RawDetection>>, CallFailure> {
        let model = Arc::clone(&self.inner.model);
        let frames: Vec<Arc<FrameTask>> = chunk.to_vec();
        let expected = frames.len();
        let started = Instant::now();

        // The blocking call owns its own references; if it is abandoned on
        // timeout, the buffers return when it finishes.
        let call = tokio::task::spawn_blocking(move || {
            let views: Vec<FrameView<'_>> = frames
                .iter()
                .map(|task| FrameView {
                    sequence_number: task.sequence_number,
                    shape: task.buffer.shape(),
                    data: task.buffer.as_slice(),
                })
                .collect();
            model.predict_batch(&views)
        });

        let result = match tokio::time::timeout(self.inner.settings.inference_timeout, call).await {
            Err(_) => Err(CallFailure::Timeout),
            Ok(Err(join_error)) => Err(CallFailure::Failed(format!(
                "model call aborted: {}",
                join_error
            ))),
            Ok(Ok(Err(ModelError::ResourceExhausted(message)))) => {
                Err(CallFailure::Exhausted(message))
            }
            Ok(Ok(Err(ModelError::Failed(message)))) => Err(CallFailure::Failed(message)),
            Ok(Ok(Ok(raw))) if raw.len() != expected => Err(CallFailure::Failed(format!(
                "model returned {} results for {} frames",
                raw.len(),
                expected
            ))),
            Ok(Ok(Ok(raw))) => Ok(raw),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(CallFailure::Exhausted(_)) => "resource_exhausted",
            Err(CallFailure::Timeout) => "timeout",
            Err(CallFailure::Failed(_)) => "failed",
        };
        metrics::record_inference(expected, started.elapsed().as_secs_f64(), outcome);

        result
    }

    fn convert(&self, chunk: &[Arc<FrameTask>], raw: &[Vec<RawDetection>]) -> Vec<FrameDetections> {
        let labels = self.inner.model.class_labels();
        chunk
            .iter()
            .zip(raw)
            .map(|(task, detections)| {
                let records = self.inner.settings.filter.to_records(
                    task.sequence_number,
                    task.timestamp_seconds,
                    detections,
                    labels,
                );
                FrameDetections::ok(
                    task.sequence_number,
                    task.source_frame_index,
                    task.timestamp_seconds,
                    records,
                )
            })
            .collect()
    }

    fn failed(&self, task: &FrameTask, kind: FailureKind, message: String) -> FrameDetections {
        metrics::record_frame_failed(kind.as_str());
        self.inner.logger.log_warning(&format!(
            "Frame {} ({}) yields no detections: {}",
            task.sequence_number, kind, message
        ));
        FrameDetections::failed(
            task.sequence_number,
            task.source_frame_index,
            task.timestamp_seconds,
            FrameFailure::new(kind, message),
        )
    }
}

/// Dispatcher stage: pulls batches and runs up to `worker_count` at once.
pub struct InferenceDispatcher {
    invoker: BatchInvoker,
    input: mpsc::Receiver<Batch>,
    output: mpsc::Sender<BatchOutcome>,
    worker_count: usize,
    control: StageControl,
    logger: JobLogger,
}

impl InferenceDispatcher {
    pub fn new(
        invoker: BatchInvoker,
        input: mpsc::Receiver<Batch>,
        output: mpsc::Sender<BatchOutcome>,
        worker_count: usize,
        control: StageControl,
        logger: JobLogger,
    ) -> Self {
        Self {
            invoker,
            input,
            output,
            worker_count: worker_count.max(1),
            control,
            logger,
        }
    }

    /// Dispatch until the input closes or the job is cancelled, then wait
    /// for in-flight batches. Returns the number of batches dispatched.
    pub async fn run(mut self) -> u64 {
        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut in_flight = JoinSet::new();
        let mut dispatched = 0u64;

        self.logger.log_start(&format!(
            "{} workers, model {}",
            self.worker_count,
            self.invoker.inner.model.name()
        ));

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                self.log_join(joined);
            }

            let permit = tokio::select! {
                biased;
                _ = self.control.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let batch = tokio::select! {
                biased;
                _ = self.control.cancelled() => break,
                batch = self.input.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            let invoker = self.invoker.clone();
            let output = self.output.clone();
            in_flight.spawn(async move {
                let first_sequence = batch.first_sequence();
                let frames = invoker.invoke(batch).await;
                // The permit is held until the streamer takes the outcome, so a
                // stalled consumer stops new batches from being dispatched. A
                // closed channel only happens when the job is being torn down.
                let _ = output.send(BatchOutcome { first_sequence, frames }).await;
                drop(permit);
            });
            dispatched += 1;
        }

        // Batches still queued are dropped unprocessed on cancellation.
        self.input.close();
        while let Some(joined) = in_flight.join_next().await {
            self.log_join(joined);
        }

        self.logger.log_completion(&format!(
            "{} batches dispatched, ceiling {}",
            dispatched,
            self.invoker.ceiling()
        ));
        dispatched
    }

    fn log_join(&self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            self.logger
                .log_error(&format!("Batch task ended abnormally: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::{BufferPool, FrameShape};
    use crate::synthetic::ScriptedModel;
    use vannot_models::JobId;

    fn batch(pool: &BufferPool, sequences: std::ops::Range<u64>) -> Batch {
        let tasks = sequences
            .map(|seq| FrameTask {
                sequence_number: seq,
                source_frame_index: seq * 2,
                timestamp_seconds: seq as f64 / 15.0,
                buffer: pool.acquire().unwrap(),
                malformed: None,
            })
            .collect();
        Batch::new(tasks).unwrap()
    }

    fn invoker(model: Arc<ScriptedModel>, timeout: Duration) -> BatchInvoker {
        BatchInvoker::new(
            model,
            InvokerSettings {
                batch_size: 8,
                inference_timeout: timeout,
                recovery_successes: 4,
                filter: RecordFilter::new(0.25, None),
            },
            JobLogger::new(&JobId::new(), "dispatcher"),
        )
    }

    #[tokio::test]
    async fn test_invoke_splits_until_model_accepts() {
        let pool = BufferPool::new(FrameShape::new(2, 2, 3), 16, 1.0);
        let model = Arc::new(ScriptedModel::new().exhausted_above(2));
        let invoker = invoker(Arc::clone(&model), Duration::from_secs(5));

        let results = invoker.invoke(batch(&pool, 0..8)).await;

        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| !r.is_failed()));
        assert_eq!(
            results.iter().map(|r| r.sequence_number).collect::<Vec<_>>(),
            (0..8).collect::<Vec<_>>()
        );
        assert_eq!(results[3].detections.len(), 1);
        assert_eq!(results[3].source_frame_index, 6);
        assert_eq!(invoker.ceiling(), 2);
        assert_eq!(model.calls(), 7);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_single_frame_exhaustion_is_flagged() {
        let pool = BufferPool::new(FrameShape::new(2, 2, 3), 8, 1.0);
        let model = Arc::new(ScriptedModel::new().exhausted_above(0));
        let invoker = invoker(model, Duration::from_secs(5));

        let results = invoker.invoke(batch(&pool, 0..4)).await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| {
            r.detections.is_empty()
                && r.failure.as_ref().map(|f| f.kind) == Some(FailureKind::ResourceExhausted)
        }));
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_model_error_flags_whole_chunk() {
        let pool = BufferPool::new(FrameShape::new(2, 2, 3), 8, 1.0);
        let model = Arc::new(ScriptedModel::new().failing_on(2));
        let invoker = invoker(Arc::clone(&model), Duration::from_secs(5));

        let results = invoker.invoke(batch(&pool, 0..4)).await;
        assert_eq!(results.len(), 4);
        assert!(results
            .iter()
            .all(|r| r.failure.as_ref().map(|f| f.kind) == Some(FailureKind::Model)));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frames_skip_the_model() {
        let pool = BufferPool::new(FrameShape::new(2, 2, 3), 8, 1.0);
        let model = Arc::new(ScriptedModel::new());
        let invoker = invoker(Arc::clone(&model), Duration::from_secs(5));

        let mut tasks = batch(&pool, 0..4).into_tasks();
        tasks[1].malformed = Some("corrupt slice".to_string());
        let results = invoker.invoke(Batch::new(tasks).unwrap()).await;

        assert_eq!(results.len(), 4);
        assert_eq!(
            results[1].failure.as_ref().map(|f| f.kind),
            Some(FailureKind::Malformed)
        );
        assert!(!results[0].is_failed());
        assert_eq!(model.frames_seen(), 3);
    }

    #[tokio::test]
    async fn test_timeout_splits_and_abandoned_call_releases_buffers() {
        let pool = BufferPool::new(FrameShape::new(2, 2, 3), 8, 1.0);
        let model = Arc::new(ScriptedModel::new().slow_above(1, Duration::from_millis(300)));
        let invoker = invoker(model, Duration::from_millis(100));

        let results = invoker.invoke(batch(&pool, 0..2)).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.is_failed()));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_ceiling_degrades_and_recovers() {
        let ceiling = BatchCeiling::new(8, 2);
        assert_eq!(ceiling.current(), 8);

        ceiling.failure(8);
        assert_eq!(ceiling.current(), 4);
        ceiling.failure(2);
        assert_eq!(ceiling.current(), 1);

        ceiling.success();
        assert_eq!(ceiling.current(), 1);
        ceiling.success();
        assert_eq!(ceiling.current(), 2);

        ceiling.success();
        ceiling.success();
        assert_eq!(ceiling.current(), 4);
        ceiling.success();
        ceiling.success();
        ceiling.success();
        ceiling.success();
        assert_eq!(ceiling.current(), 8);
    }

    #[test]
    fn test_ceiling_never_below_one() {
        let ceiling = BatchCeiling::new(8, 4);
        ceiling.failure(1);
        assert_eq!(ceiling.current(), 1);
    }

    #[test]
    fn test_failure_resets_recovery_progress() {
        let ceiling = BatchCeiling::new(8, 2);
        ceiling.failure(8);
        ceiling.success();
        ceiling.failure(8);
        ceiling.success();
        assert_eq!(ceiling.current(), 4);
    }
}
