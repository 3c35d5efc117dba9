//! Conversion of raw model output into detection records.

use vannot_models::{BoundingBox, DetectionRecord};

use crate::model::RawDetection;

/// Filters and normalizes raw detections.
#[derive(Debug, Clone, Copy)]
pub struct RecordFilter {
    confidence_threshold: f32,
    nms_threshold: Option<f32>,
}

impl RecordFilter {
    pub fn new(confidence_threshold: f32, nms_threshold: Option<f32>) -> Self {
        Self {
            confidence_threshold,
            nms_threshold,
        }
    }

    /// Build the records for one frame.
    ///
    /// Detections with non-finite values or a confidence below the
    /// threshold are dropped. Boxes are clamped to the frame.
    pub fn to_records(
        &self,
        sequence_number: u64,
        timestamp_seconds: f64,
        raw: &[RawDetection],
        labels: &[&'static str],
    ) -> Vec<DetectionRecord> {
        let mut records: Vec<DetectionRecord> = raw
            .iter()
            .filter(|d| {
                d.confidence.is_finite()
                    && d.x.is_finite()
                    && d.y.is_finite()
                    && d.width.is_finite()
                    && d.height.is_finite()
            })
            .filter_map(|d| {
                let confidence = d.confidence.clamp(0.0, 1.0);
                if confidence < self.confidence_threshold {
                    return None;
                }
                Some(DetectionRecord {
                    sequence_number,
                    timestamp_seconds,
                    class_id: d.class_id,
                    class_label: label_for(labels, d.class_id),
                    confidence,
                    bbox: BoundingBox::new(d.x, d.y, d.width, d.height).clamped(),
                })
            })
            .collect();

        if let Some(threshold) = self.nms_threshold {
            records = non_maximum_suppression(records, threshold);
        }
        records
    }
}

fn label_for(labels: &[&'static str], class_id: usize) -> String {
    labels
        .get(class_id)
        .map(|label| label.to_string())
        .unwrap_or_else(|| format!("class_{}", class_id))
}

/// Class-wise NMS, highest confidence first.
fn non_maximum_suppression(mut records: Vec<DetectionRecord>, threshold: f32) -> Vec<DetectionRecord> {
    records.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut suppressed = vec![false; records.len()];
    for i in 0..records.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..records.len() {
            if suppressed[j] || records[i].class_id != records[j].class_id {
                continue;
            }
            if records[i].bbox.iou(&records[j].bbox) > threshold {
                suppressed[j] = true;
            }
        }
    }

    records
        .into_iter()
        .zip(suppressed)
        .filter_map(|(record, suppressed)| (!suppressed).then_some(record))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::COCO_CLASSES;

    #[test]
    fn test_threshold_and_labels() {
        let filter = RecordFilter::new(0.25, None);
        let raw = [
            RawDetection::new(0, 0.9, 0.1, 0.1, 0.2, 0.2),
            RawDetection::new(2, 0.1, 0.5, 0.5, 0.1, 0.1),
            RawDetection::new(500, 0.5, 0.3, 0.3, 0.1, 0.1),
        ];

        let records = filter.to_records(7, 1.4, &raw, COCO_CLASSES);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].class_label, "person");
        assert_eq!(records[0].sequence_number, 7);
        assert_eq!(records[1].class_label, "class_500");
    }

    #[test]
    fn test_invalid_values_are_dropped_or_clamped() {
        let filter = RecordFilter::new(0.25, None);
        let raw = [
            RawDetection::new(0, f32::NAN, 0.1, 0.1, 0.2, 0.2),
            RawDetection::new(0, 0.8, f32::INFINITY, 0.1, 0.2, 0.2),
            RawDetection::new(1, 1.7, 0.9, -0.1, 0.5, 0.5),
        ];

        let records = filter.to_records(0, 0.0, &raw, COCO_CLASSES);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.confidence, 1.0);
        assert_eq!(record.bbox.y, 0.0);
        assert!(record.bbox.x + record.bbox.width <= 1.0 + 1e-6);
    }

    #[test]
    fn test_nms_suppresses_same_class_only() {
        let filter = RecordFilter::new(0.25, Some(0.45));
        let raw = [
            RawDetection::new(0, 0.6, 0.10, 0.10, 0.30, 0.30),
            RawDetection::new(0, 0.9, 0.11, 0.11, 0.30, 0.30),
            RawDetection::new(2, 0.7, 0.11, 0.11, 0.30, 0.30),
        ];

        let records = filter.to_records(0, 0.0, &raw, COCO_CLASSES);
        assert_eq!(records.len(), 2);
        assert!((records[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(records[1].class_id, 2);
    }
}
