//! Pipeline job identity and lifecycle.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a pipeline job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a pipeline job.
///
/// ```text
/// Idle -> Running -> {Paused, Cancelling, Completed, Failed}
/// Paused -> {Running, Cancelling, Failed}
/// Cancelling -> {Completed, Failed}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job created, stages not wired yet
    #[default]
    Idle,
    /// Frames are being read and dispatched
    Running,
    /// Frame reading suspended; in-flight batches keep draining
    Paused,
    /// Cancellation requested; draining in-flight batches
    Cancelling,
    /// Job finished (end of stream or successful drain)
    Completed,
    /// Job hit a fatal error
    Failed,
}

impl JobStatus {
    /// Get string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Check if this is a terminal state (no more transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Failed)
                | (Running, Paused)
                | (Running, Cancelling)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Cancelling)
                | (Paused, Failed)
                | (Cancelling, Completed)
                | (Cancelling, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of a pipeline job as seen by the job host.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineJob {
    /// Unique job identifier
    pub job_id: JobId,
    /// Current lifecycle state
    pub status: JobStatus,
    /// Estimated number of sampled frames, if the source knows its length
    pub total_frames_estimate: Option<u64>,
    /// Frames whose results have been emitted
    pub frames_processed: u64,
    /// Last fatal error, if any
    pub last_error: Option<String>,
    /// When the job was created
    pub started_at: DateTime<Utc>,
    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineJob {
    /// Create a new job record in the `Idle` state.
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            status: JobStatus::Idle,
            total_frames_estimate: None,
            frames_processed: 0,
            last_error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_uniqueness() {
        assert_ne!(JobId::new(), JobId::new());
        assert_eq!(JobId::from_string("job-1").as_str(), "job-1");
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Idle.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Paused));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Cancelling.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Cancelling));
        assert!(!JobStatus::Cancelling.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Idle.can_transition_to(JobStatus::Paused));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Cancelling.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&JobStatus::Cancelling).unwrap();
        assert_eq!(json, "\"cancelling\"");
        assert_eq!(JobStatus::Paused.to_string(), "paused");
    }

    #[test]
    fn test_new_job_is_idle() {
        let job = PipelineJob::new(JobId::new());
        assert_eq!(job.status, JobStatus::Idle);
        assert_eq!(job.frames_processed, 0);
        assert!(!job.is_terminal());
    }
}
