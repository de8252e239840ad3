use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Which detector family produced a detection.
///
/// `label` carries the specific class ("person", "car", ...) for objects and
/// is always `"motion"` for motion regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionCategory {
    Motion,
    Object,
}

/// Pixel-space box with `x1 < x2` and `y1 < y2`. Serialized as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(into = "[i32; 4]")]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    /// Returns `None` for empty or inverted boxes.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Option<Self> {
        (x1 < x2 && y1 < y2).then_some(Self { x1, y1, x2, y2 })
    }

    pub fn width(&self) -> u32 {
        (self.x2 - self.x1) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1) as u32
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Intersect with the `width` x `height` image; `None` if nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Self> {
        let w = width.min(i32::MAX as u32) as i32;
        let h = height.min(i32::MAX as u32) as i32;
        Self::new(
            self.x1.clamp(0, w),
            self.y1.clamp(0, h),
            self.x2.clamp(0, w),
            self.y2.clamp(0, h),
        )
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = match BoundingBox::new(ix1, iy1, ix2, iy2) {
            Some(b) => b.area() as f32,
            None => return 0.0,
        };
        let union = self.area() as f32 + other.area() as f32 - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub label: String,
    pub category: DetectionCategory,
}

impl Detection {
    pub fn motion(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            confidence: 1.0,
            label: "motion".to_string(),
            category: DetectionCategory::Motion,
        }
    }

    pub fn object(bbox: BoundingBox, label: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            confidence,
            label: label.into(),
            category: DetectionCategory::Object,
        }
    }

    /// Caption drawn next to the box, e.g. `person 0.87`.
    pub fn caption(&self) -> String {
        format!("{} {:.2}", self.label, self.confidence)
    }
}

/// Output of one analysis cycle.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisResult {
    /// Seconds since the Unix epoch when analysis finished.
    pub timestamp: f64,
    /// Sequence number of the analysed frame.
    pub sequence: u64,
    /// Motion detections first, then object detections.
    pub detections: Vec<Detection>,
    #[serde(skip)]
    pub annotated: Option<RgbImage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_boxes() {
        assert!(BoundingBox::new(0, 0, 10, 10).is_some());
        assert!(BoundingBox::new(10, 0, 10, 10).is_none());
        assert!(BoundingBox::new(0, 5, 10, 2).is_none());
    }

    #[test]
    fn clamp_trims_to_image_bounds() {
        let b = BoundingBox::new(-5, -5, 700, 100).unwrap();
        assert_eq!(b.clamp_to(640, 480), BoundingBox::new(0, 0, 640, 100));
        let outside = BoundingBox::new(650, 10, 700, 20).unwrap();
        assert_eq!(outside.clamp_to(640, 480), None);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0, 0, 10, 10).unwrap();
        let b = BoundingBox::new(20, 20, 30, 30).unwrap();
        assert_eq!(a.iou(&a), 1.0);
        assert_eq!(a.iou(&b), 0.0);
        let half = BoundingBox::new(5, 0, 15, 10).unwrap();
        assert!((a.iou(&half) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn serializes_with_array_bbox_and_lowercase_category() {
        let det = Detection::object(BoundingBox::new(1, 2, 3, 4).unwrap(), "person", 0.5);
        let value = serde_json::to_value(&det).unwrap();
        assert_eq!(value["bbox"], serde_json::json!([1, 2, 3, 4]));
        assert_eq!(value["category"], "object");
        assert_eq!(value["label"], "person");
        assert_eq!(det.caption(), "person 0.50");
    }

    #[test]
    fn analysis_result_never_serializes_the_frame() {
        let result = AnalysisResult {
            timestamp: 1.5,
            sequence: 3,
            detections: vec![Detection::motion(BoundingBox::new(0, 0, 8, 8).unwrap())],
            annotated: Some(RgbImage::new(2, 2)),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("annotated").is_none());
        assert_eq!(value["detections"][0]["label"], "motion");
        assert_eq!(value["sequence"], 3);
    }
}
