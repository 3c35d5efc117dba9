//! Structured logging for pipeline stages.
//!
//! Every line a stage logs carries the job ID and the stage name so that
//! interleaved output from concurrent jobs can be filtered.

use tracing::{debug, error, info, warn, Span};
use vannot_models::JobId;

/// Logger bound to one job and one stage.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    stage: &'static str,
}

impl JobLogger {
    pub fn new(job_id: &JobId, stage: &'static str) -> Self {
        Self {
            job_id: job_id.to_string(),
            stage,
        }
    }

    /// Same job, different stage.
    pub fn for_stage(&self, stage: &'static str) -> Self {
        Self {
            job_id: self.job_id.clone(),
            stage,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            stage = self.stage,
            "Stage started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        debug!(
            job_id = %self.job_id,
            stage = self.stage,
            "Stage progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            stage = self.stage,
            "Stage warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            stage = self.stage,
            "Stage error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            stage = self.stage,
            "Stage finished: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// Span to instrument the stage task with.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("pipeline_stage", job_id = %self.job_id, stage = self.stage)
    }
}
