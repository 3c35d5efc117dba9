//! Detection model seam.
//!
//! The pipeline never loads a model itself. The host builds one (ONNX
//! Runtime session, TensorRT engine, remote client) and injects it as an
//! `Arc<dyn DetectionModel>`.

use crate::buffer_pool::FrameShape;
use crate::error::ModelError;

/// COCO class names (80 classes).
pub const COCO_CLASSES: &[&str] = &[
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck",
    "boat", "traffic light", "fire hydrant", "stop sign", "parking meter", "bench",
    "bird", "cat", "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra",
    "giraffe", "backpack", "umbrella", "handbag", "tie", "suitcase", "frisbee",
    "skis", "snowboard", "sports ball", "kite", "baseball bat", "baseball glove",
    "skateboard", "surfboard", "tennis racket", "bottle", "wine glass", "cup",
    "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink",
    "refrigerator", "book", "clock", "vase", "scissors", "teddy bear", "hair drier",
    "toothbrush",
];

/// Borrowed view of one frame handed to the model.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub sequence_number: u64,
    pub shape: FrameShape,
    /// Packed pixels, `shape.byte_len()` bytes
    pub data: &'a [u8],
}

/// Detection as reported by the model, before filtering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    /// Bounding box in normalized coordinates [0, 1]
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl RawDetection {
    pub fn new(class_id: usize, confidence: f32, x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            class_id,
            confidence,
            x,
            y,
            width,
            height,
        }
    }
}

/// Batch object detector.
///
/// Calls are blocking and may take a long time; the dispatcher runs them on
/// the blocking thread pool. Implementations must be safe to call from
/// several threads at once.
pub trait DetectionModel: Send + Sync {
    /// Run detection on a batch. Must return exactly one entry per frame,
    /// in input order.
    fn predict_batch(&self, frames: &[FrameView<'_>]) -> Result<Vec<Vec<RawDetection>>, ModelError>;

    /// Label table indexed by class ID.
    fn class_labels(&self) -> &[&'static str] {
        COCO_CLASSES
    }

    /// Name used in logs.
    fn name(&self) -> &str {
        "detector"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coco_classes() {
        assert_eq!(COCO_CLASSES.len(), 80);
        assert_eq!(COCO_CLASSES[0], "person");
        assert_eq!(COCO_CLASSES[2], "car");
    }

    struct Empty;

    impl DetectionModel for Empty {
        fn predict_batch(
            &self,
            frames: &[FrameView<'_>],
        ) -> Result<Vec<Vec<RawDetection>>, ModelError> {
            Ok(vec![Vec::new(); frames.len()])
        }
    }

    #[test]
    fn test_default_labels_and_name() {
        let model = Empty;
        assert_eq!(model.class_labels().len(), 80);
        assert_eq!(model.name(), "detector");

        let data = [0u8; 12];
        let frame = FrameView {
            sequence_number: 0,
            shape: FrameShape::new(2, 2, 3),
            data: &data,
        };
        assert_eq!(model.predict_batch(&[frame, frame]).unwrap().len(), 2);
    }
}
