//! Pipeline controller.
//!
//! Wires the stages for one job, supervises them, and exposes the job's
//! lifecycle through a [`JobHandle`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use vannot_models::{JobId, JobStatus, PipelineEvent, PipelineJob};

use crate::assembler::BatchAssembler;
use crate::buffer_pool::{BufferPool, PoolStats};
use crate::config::PipelineConfig;
use crate::control::StageControl;
use crate::dispatcher::{BatchInvoker, InferenceDispatcher, InvokerSettings};
use crate::error::{PipelineError, PipelineResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::model::DetectionModel;
use crate::pressure::{MemoryProbe, PressureMonitor, PressureSignals, ProcessMemoryProbe};
use crate::records::RecordFilter;
use crate::source::{FrameSource, SourceReport, SourceSettings};
use crate::streamer::{JobOutcome, ResultStreamer, StreamerReport, StreamerSettings};
use crate::video::VideoSource;

/// Job state shared by the handle and the supervisor.
#[derive(Debug)]
struct JobShared {
    job: Mutex<PipelineJob>,
    frames_processed: Arc<AtomicU64>,
}

impl JobShared {
    fn new(job_id: JobId) -> Self {
        Self {
            job: Mutex::new(PipelineJob::new(job_id)),
            frames_processed: Arc::new(AtomicU64::new(0)),
        }
    }

    fn with_job<T>(&self, f: impl FnOnce(&mut PipelineJob) -> T) -> T {
        let mut job = self.job.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut job)
    }

    fn status(&self) -> JobStatus {
        self.with_job(|job| job.status)
    }

    /// Apply a lifecycle transition if it is allowed.
    fn transition(&self, to: JobStatus) -> bool {
        self.with_job(|job| {
            if job.status.can_transition_to(to) {
                job.status = to;
                true
            } else {
                false
            }
        })
    }

    fn finish(&self, outcome: &JobOutcome) {
        let frames = self.frames_processed.load(Ordering::Acquire);
        self.with_job(|job| {
            job.status = outcome.status;
            job.frames_processed = frames;
            job.last_error = outcome.error.clone();
            job.finished_at = Some(Utc::now());
        });
    }

    fn snapshot(&self) -> PipelineJob {
        let frames = self.frames_processed.load(Ordering::Acquire);
        self.with_job(|job| PipelineJob {
            frames_processed: frames,
            ..job.clone()
        })
    }
}

/// Starts pipeline jobs against an injected detection model.
#[derive(Clone)]
pub struct PipelineController {
    model: Arc<dyn DetectionModel>,
    probe: Arc<dyn MemoryProbe>,
}

impl PipelineController {
    pub fn new(model: Arc<dyn DetectionModel>) -> Self {
        Self {
            model,
            probe: Arc::new(ProcessMemoryProbe),
        }
    }

    /// Replace the memory probe used by the pressure monitor.
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Start a job with a generated ID.
    pub async fn start(
        &self,
        video: Box<dyn VideoSource>,
        config: PipelineConfig,
    ) -> PipelineResult<JobHandle> {
        self.start_with_id(JobId::new(), video, config).await
    }

    /// Start a job.
    ///
    /// Only an invalid configuration is returned as an error. A video that
    /// cannot be opened yields a handle whose job has already failed, with
    /// the terminal event queued.
    pub async fn start_with_id(
        &self,
        job_id: JobId,
        mut video: Box<dyn VideoSource>,
        config: PipelineConfig,
    ) -> PipelineResult<JobHandle> {
        config.validate()?;

        let logger = JobLogger::new(&job_id, "controller");
        let shared = Arc::new(JobShared::new(job_id.clone()));
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_depth);
        let (pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let info = match video.open().await {
            Ok(info) => info,
            Err(e) => {
                let error = PipelineError::VideoOpen(e);
                logger.log_error(&error.to_string());
                let outcome = JobOutcome::failed(error.to_string());
                shared.finish(&outcome);
                metrics::record_job_finished(JobStatus::Failed.as_str(), 0.0);
                // The channel is empty, so this cannot be full.
                let _ = event_tx.try_send(PipelineEvent::Finished {
                    status: outcome.status,
                    frames_processed: 0,
                    error: outcome.error,
                });
                return Ok(JobHandle {
                    job_id,
                    shared,
                    pause: pause_tx,
                    cancel,
                    events: Some(event_rx),
                    supervisor: None,
                    pool: None,
                });
            }
        };

        let total_estimate = info
            .estimated_frame_count
            .map(|frames| config.sampling_policy.sampled_count(frames));
        shared.with_job(|job| job.total_frames_estimate = total_estimate);

        let worker_count = config.worker_count();
        let pool = BufferPool::new(
            info.shape,
            config.buffer_pool_capacity(),
            config.overflow_factor,
        );
        let signals = Arc::new(PressureSignals::new());
        let control = StageControl::new(cancel.clone(), pause_rx);

        let (frame_tx, frame_rx) = mpsc::channel(config.frame_queue_depth());
        let (batch_tx, batch_rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = mpsc::channel(config.reorder_window());
        let (finish_tx, finish_rx) = oneshot::channel();

        logger.log_start(&format!(
            "{}x{} frames, ~{:?} sampled, batch {}, {} workers, pool {}",
            info.shape.width,
            info.shape.height,
            total_estimate,
            config.batch_size,
            worker_count,
            config.buffer_pool_capacity()
        ));

        let source = FrameSource::new(
            video,
            pool.clone(),
            frame_tx,
            control.clone(),
            Arc::clone(&signals),
            SourceSettings {
                policy: config.sampling_policy,
                fps: info.fps,
                acquire_backoff: config.acquire_backoff,
                throttle_backoff: config.throttle_backoff,
            },
            logger.for_stage("source"),
        );
        let assembler = BatchAssembler::new(
            frame_rx,
            batch_tx,
            config.batch_size,
            control.clone(),
            logger.for_stage("assembler"),
        );
        let invoker = BatchInvoker::new(
            Arc::clone(&self.model),
            InvokerSettings {
                batch_size: config.batch_size,
                inference_timeout: config.inference_timeout,
                recovery_successes: config.recovery_successes,
                filter: RecordFilter::new(config.confidence_threshold, config.nms_threshold),
            },
            logger.for_stage("dispatcher"),
        );
        let dispatcher = InferenceDispatcher::new(
            invoker,
            batch_rx,
            outcome_tx,
            worker_count,
            control,
            logger.for_stage("dispatcher"),
        );
        let streamer = ResultStreamer::new(
            outcome_rx,
            event_tx,
            finish_rx,
            Arc::clone(&shared.frames_processed),
            StreamerSettings {
                reorder_window: config.reorder_window(),
                reorder_timeout: config.reorder_timeout(),
                progress_interval_frames: config.progress_interval_frames,
                total_estimate,
            },
            logger.for_stage("streamer"),
        );
        let monitor = PressureMonitor::new(
            Arc::clone(&self.probe),
            config.memory_thresholds,
            config.pressure.clone(),
            pool.clone(),
            Arc::clone(&signals),
            cancel.clone(),
            logger.for_stage("pressure"),
        );

        shared.transition(JobStatus::Running);
        let monitor_stop = CancellationToken::new();

        let stages = Stages {
            source: spawn_stage(source.run(), &logger.for_stage("source")),
            assembler: spawn_stage(assembler.run(), &logger.for_stage("assembler")),
            dispatcher: spawn_stage(dispatcher.run(), &logger.for_stage("dispatcher")),
            streamer: spawn_stage(streamer.run(), &logger.for_stage("streamer")),
            monitor: spawn_stage(
                monitor.run(monitor_stop.clone()),
                &logger.for_stage("pressure"),
            ),
        };

        let supervisor = Supervisor {
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
            monitor_stop,
            signals,
            drain_timeout: config.drain_timeout,
            finish: finish_tx,
            logger,
        };
        let supervisor = tokio::spawn(supervisor.run(stages));

        Ok(JobHandle {
            job_id,
            shared,
            pause: pause_tx,
            cancel,
            events: Some(event_rx),
            supervisor: Some(supervisor),
            pool: Some(pool),
        })
    }
}

fn spawn_stage<F>(future: F, logger: &JobLogger) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future.instrument(logger.create_span()))
}

struct Stages {
    source: JoinHandle<PipelineResult<SourceReport>>,
    assembler: JoinHandle<u64>,
    dispatcher: JoinHandle<u64>,
    streamer: JoinHandle<StreamerReport>,
    monitor: JoinHandle<()>,
}

struct Supervisor {
    shared: Arc<JobShared>,
    cancel: CancellationToken,
    monitor_stop: CancellationToken,
    signals: Arc<PressureSignals>,
    drain_timeout: std::time::Duration,
    finish: oneshot::Sender<JobOutcome>,
    logger: JobLogger,
}

impl Supervisor {
    async fn run(self, stages: Stages) {
        let started = Instant::now();
        let Stages {
            source,
            assembler,
            dispatcher,
            streamer,
            monitor,
        } = stages;

        let work = async { tokio::join!(source, assembler, dispatcher) };
        tokio::pin!(work);

        let joined = tokio::select! {
            joined = &mut work => Some(joined),
            _ = self.cancel.cancelled() => {
                // Covers cancellation by the memory monitor as well as the host.
                self.shared.transition(JobStatus::Cancelling);
                self.logger.log_progress(&format!(
                    "Cancellation requested, draining for up to {:?}",
                    self.drain_timeout
                ));
                tokio::time::timeout(self.drain_timeout, &mut work).await.ok()
            }
        };

        self.monitor_stop.cancel();
        let _ = monitor.await;

        let outcome = match joined {
            None => {
                let error = PipelineError::DrainTimeout(self.drain_timeout);
                self.logger.log_error(&error.to_string());
                JobOutcome::failed(error.to_string())
            }
            Some((source, assembler, dispatcher)) => {
                self.outcome_from(source, assembler.is_err() || dispatcher.is_err())
            }
        };

        // Status is terminal before the terminal event goes out.
        self.shared.finish(&outcome);
        let _ = self.finish.send(outcome.clone());

        match streamer.await {
            Ok(report) => self.logger.log_completion(&format!(
                "status {}, {} frames emitted, {} out of order",
                outcome.status.as_str(),
                report.frames_emitted,
                report.out_of_order
            )),
            Err(e) => self
                .logger
                .log_error(&format!("Result streamer ended abnormally: {}", e)),
        }

        metrics::record_job_finished(outcome.status.as_str(), started.elapsed().as_secs_f64());
    }

    fn outcome_from(
        &self,
        source: Result<PipelineResult<SourceReport>, tokio::task::JoinError>,
        stage_panicked: bool,
    ) -> JobOutcome {
        if let Some(usage_percent) = self.signals.emergency() {
            return JobOutcome::failed(
                PipelineError::MemoryEmergency { usage_percent }.to_string(),
            );
        }
        if stage_panicked {
            return JobOutcome::failed(
                PipelineError::stage_failed("batch assembler or dispatcher panicked").to_string(),
            );
        }

        match source {
            Ok(Ok(report)) => {
                self.logger.log_progress(&format!(
                    "{} frames decoded, {} sampled",
                    report.frames_decoded, report.frames_sampled
                ));
                JobOutcome::completed()
            }
            Ok(Err(error)) => {
                self.logger.log_error(&error.to_string());
                JobOutcome::failed(error.to_string())
            }
            Err(join_error) => JobOutcome::failed(
                PipelineError::stage_failed(format!("frame source: {}", join_error)).to_string(),
            ),
        }
    }
}

/// Host-side handle to a running job.
pub struct JobHandle {
    job_id: JobId,
    shared: Arc<JobShared>,
    pause: watch::Sender<bool>,
    cancel: CancellationToken,
    events: Option<mpsc::Receiver<PipelineEvent>>,
    supervisor: Option<JoinHandle<()>>,
    pool: Option<BufferPool>,
}

impl JobHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.shared.status()
    }

    /// Current job record.
    pub fn snapshot(&self) -> PipelineJob {
        self.shared.snapshot()
    }

    /// Buffer pool counters. Empty if the video never opened.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.as_ref().map(BufferPool::stats).unwrap_or_default()
    }

    /// Suspend frame reading. In-flight batches keep draining.
    pub fn pause(&self) {
        if self.shared.transition(JobStatus::Paused) {
            self.pause.send_replace(true);
        }
    }

    pub fn resume(&self) {
        if self.shared.status() == JobStatus::Paused && self.shared.transition(JobStatus::Running)
        {
            self.pause.send_replace(false);
        }
    }

    /// Request cancellation. In-flight batches finish within the drain
    /// timeout. No-op once the job is terminal.
    pub fn cancel(&self) {
        if self.shared.transition(JobStatus::Cancelling) {
            self.cancel.cancel();
        }
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<PipelineEvent>> {
        self.events.take()
    }

    /// Wait for the job to reach a terminal state.
    ///
    /// Events not taken by then are discarded so the job cannot stall on a
    /// full event channel.
    pub async fn wait(&mut self) -> PipelineJob {
        self.events = None;
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                let outcome = JobOutcome::failed(
                    PipelineError::stage_failed(format!("supervisor: {}", e)).to_string(),
                );
                self.shared.finish(&outcome);
            }
        }
        self.shared.snapshot()
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        // A dropped handle cannot observe the job any more.
        if !self.shared.status().is_terminal() {
            self.cancel();
        }
    }
}
