//! Detection records produced by the inference stage.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Axis-aligned bounding box in normalized coordinates [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Get the center point.
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Get area (normalized).
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Clamp the box so it lies entirely inside the unit square.
    pub fn clamped(&self) -> Self {
        let x = self.x.clamp(0.0, 1.0);
        let y = self.y.clamp(0.0, 1.0);
        Self {
            x,
            y,
            width: self.width.max(0.0).min(1.0 - x),
            height: self.height.max(0.0).min(1.0 - y),
        }
    }

    /// Intersection over Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A single detected object on a sampled frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DetectionRecord {
    pub sequence_number: u64,
    pub timestamp_seconds: f64,
    /// Class index in the model's label table
    pub class_id: usize,
    pub class_label: String,
    /// Detection confidence [0, 1]
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Why a frame produced no detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The model ran out of memory even at batch size 1
    ResourceExhausted,
    /// The inference call exceeded its timeout even at batch size 1
    Timeout,
    /// The frame did not decode to the expected shape
    Malformed,
    /// Any other model error
    Model,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::Timeout => "timeout",
            FailureKind::Malformed => "malformed",
            FailureKind::Model => "model",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error flag attached to a frame whose inference failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FrameFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl FrameFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Detection results for one sampled frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FrameDetections {
    pub sequence_number: u64,
    /// Index of the frame in the source video (before sampling)
    pub source_frame_index: u64,
    pub timestamp_seconds: f64,
    pub detections: Vec<DetectionRecord>,
    /// Set when inference failed for this frame; `detections` is then empty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FrameFailure>,
    /// Set when the frame was emitted after later sequence numbers
    #[serde(default)]
    pub out_of_order: bool,
}

impl FrameDetections {
    /// Build a successful result.
    pub fn ok(
        sequence_number: u64,
        source_frame_index: u64,
        timestamp_seconds: f64,
        detections: Vec<DetectionRecord>,
    ) -> Self {
        Self {
            sequence_number,
            source_frame_index,
            timestamp_seconds,
            detections,
            failure: None,
            out_of_order: false,
        }
    }

    /// Build a zero-detection result flagged with a failure.
    pub fn failed(
        sequence_number: u64,
        source_frame_index: u64,
        timestamp_seconds: f64,
        failure: FrameFailure,
    ) -> Self {
        Self {
            sequence_number,
            source_frame_index,
            timestamp_seconds,
            detections: Vec::new(),
            failure: Some(failure),
            out_of_order: false,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_geometry() {
        let b = BoundingBox::new(0.1, 0.2, 0.3, 0.4);
        let (cx, cy) = b.center();
        assert!((cx - 0.25).abs() < 1e-6);
        assert!((cy - 0.4).abs() < 1e-6);
        assert!((b.area() - 0.12).abs() < 1e-6);
    }

    #[test]
    fn test_bbox_clamped() {
        let b = BoundingBox::new(-0.2, 0.9, 0.5, 0.5).clamped();
        assert_eq!(b.x, 0.0);
        assert!((b.y - 0.9).abs() < 1e-6);
        assert!((b.height - 0.1).abs() < 1e-6);
        assert!((b.width - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_bbox_iou() {
        let a = BoundingBox::new(0.1, 0.1, 0.2, 0.2);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);

        let far = BoundingBox::new(0.7, 0.7, 0.2, 0.2);
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn test_failed_frame_has_no_detections() {
        let frame = FrameDetections::failed(
            3,
            15,
            0.5,
            FrameFailure::new(FailureKind::Timeout, "inference timed out"),
        );
        assert!(frame.is_failed());
        assert!(frame.detections.is_empty());
        assert!(!frame.out_of_order);
    }

    #[test]
    fn test_failure_serialization() {
        let frame = FrameDetections::failed(
            0,
            0,
            0.0,
            FrameFailure::new(FailureKind::ResourceExhausted, "oom"),
        );
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["failure"]["kind"], "resource_exhausted");

        let ok = FrameDetections::ok(1, 5, 0.2, Vec::new());
        let json = serde_json::to_value(&ok).unwrap();
        assert!(json.get("failure").is_none());
    }
}
