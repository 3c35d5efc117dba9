//! Events streamed from a running pipeline job to its host.
//!
//! The host relays these over its own transport; this crate only fixes the
//! shape of each event.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::detection::FrameDetections;
use crate::job::JobStatus;

/// Event emitted by the result streamer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Detections for one sampled frame
    Detections(FrameDetections),

    /// Periodic progress update
    Progress {
        frames_processed: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_estimate: Option<u64>,
    },

    /// Terminal event, emitted exactly once per job
    Finished {
        status: JobStatus,
        frames_processed: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl PipelineEvent {
    /// Check if this is the terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineEvent::Finished { .. })
    }

    /// Short name for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::Detections(_) => "detections",
            PipelineEvent::Progress { .. } => "progress",
            PipelineEvent::Finished { .. } => "finished",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = PipelineEvent::Progress {
            frames_processed: 16,
            total_estimate: Some(24),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["frames_processed"], 16);
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_finished_is_terminal() {
        let event = PipelineEvent::Finished {
            status: JobStatus::Completed,
            frames_processed: 24,
            error: None,
        };
        assert!(event.is_terminal());
        assert_eq!(event.kind(), "finished");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "completed");
        assert!(json.get("error").is_none());
    }
}
