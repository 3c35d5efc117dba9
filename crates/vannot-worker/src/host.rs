//! Runs one pipeline job and relays its events.
//!
//! The host owns the only receiver of the job's event stream. Every event is
//! logged with the job's fields and, with [`EventOutput::Json`], written to
//! stdout as one JSON document per line.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vannot_models::{JobStatus, PipelineEvent};
use vannot_pipeline::{DetectionModel, JobLogger, MemoryProbe, PipelineController, VideoSource};

use crate::config::{EventOutput, WorkerConfig};
use crate::error::{WorkerError, WorkerResult};

/// What a finished job produced.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub frames_processed: u64,
    pub detections: u64,
    pub failed_frames: u64,
    pub out_of_order_frames: u64,
    pub progress_updates: u64,
    /// The host cancelled the job on shutdown
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct EventTally {
    detections: u64,
    failed_frames: u64,
    out_of_order_frames: u64,
    progress_updates: u64,
}

impl EventTally {
    fn record(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Detections(frame) => {
                self.detections += frame.detections.len() as u64;
                if frame.is_failed() {
                    self.failed_frames += 1;
                }
                if frame.out_of_order {
                    self.out_of_order_frames += 1;
                }
            }
            PipelineEvent::Progress { .. } => self.progress_updates += 1,
            PipelineEvent::Finished { .. } => {}
        }
    }
}

/// Starts jobs on a shared controller and drives them to completion.
pub struct JobHost {
    controller: PipelineController,
    config: WorkerConfig,
}

impl JobHost {
    pub fn new(model: Arc<dyn DetectionModel>, config: WorkerConfig) -> Self {
        Self {
            controller: PipelineController::new(model),
            config,
        }
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.controller = self.controller.with_memory_probe(probe);
        self
    }

    /// Run one job until its terminal event.
    ///
    /// Cancelling `shutdown` cancels the job, which still drains and reports
    /// a summary. A job that outlives `job_timeout` is cancelled and reported
    /// as [`WorkerError::JobTimeout`].
    pub async fn run(
        &self,
        video: Box<dyn VideoSource>,
        shutdown: CancellationToken,
    ) -> WorkerResult<JobSummary> {
        let mut handle = self
            .controller
            .start(video, self.config.pipeline.clone())
            .await?;
        let logger = JobLogger::new(handle.job_id(), "host");
        logger.log_start("Relaying job events");

        let mut events = handle
            .take_events()
            .ok_or_else(|| WorkerError::job_failed("event stream already taken"))?;

        let deadline = tokio::time::sleep(self.config.job_timeout);
        tokio::pin!(deadline);

        let mut tally = EventTally::default();
        let mut cancelled = false;
        let mut timed_out = false;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.relay(&logger, &event)?;
                        tally.record(&event);
                        if event.is_terminal() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown.cancelled(), if !cancelled => {
                    logger.log_warning("Shutdown requested, cancelling job");
                    handle.cancel();
                    cancelled = true;
                }
                _ = &mut deadline, if !timed_out => {
                    logger.log_warning(&format!(
                        "Job exceeded {:?}, cancelling",
                        self.config.job_timeout
                    ));
                    handle.cancel();
                    timed_out = true;
                }
            }
        }

        let job = handle.wait().await;
        if timed_out {
            return Err(WorkerError::JobTimeout(self.config.job_timeout));
        }

        Ok(JobSummary {
            job_id: job.job_id.to_string(),
            status: job.status,
            frames_processed: job.frames_processed,
            detections: tally.detections,
            failed_frames: tally.failed_frames,
            out_of_order_frames: tally.out_of_order_frames,
            progress_updates: tally.progress_updates,
            cancelled,
            error: job.last_error,
        })
    }

    fn relay(&self, logger: &JobLogger, event: &PipelineEvent) -> WorkerResult<()> {
        match event {
            PipelineEvent::Detections(frame) => match &frame.failure {
                Some(failure) => warn!(
                    job_id = %logger.job_id(),
                    sequence_number = frame.sequence_number,
                    kind = %failure.kind,
                    "Frame failed: {}",
                    failure.message
                ),
                None => debug!(
                    job_id = %logger.job_id(),
                    sequence_number = frame.sequence_number,
                    detections = frame.detections.len(),
                    out_of_order = frame.out_of_order,
                    "Frame detections"
                ),
            },
            PipelineEvent::Progress {
                frames_processed,
                total_estimate,
            } => info!(
                job_id = %logger.job_id(),
                frames_processed = *frames_processed,
                total_estimate = ?total_estimate,
                "Job progress"
            ),
            PipelineEvent::Finished {
                status,
                frames_processed,
                error,
            } => match error {
                Some(error) => logger.log_error(&format!(
                    "Job {} after {} frames: {}",
                    status, frames_processed, error
                )),
                None => logger.log_completion(&format!(
                    "Job {} after {} frames",
                    status, frames_processed
                )),
            },
        }

        if self.config.event_output == EventOutput::Json {
            println!("{}", serde_json::to_string(event)?);
        }
        Ok(())
    }
}
