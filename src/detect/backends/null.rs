use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::Detector;
use crate::detect::result::{Detection, DetectionCategory};

/// Detector that never reports anything.
///
/// Stands in for a real backend that is disabled or failed to initialise, so
/// the analysis worker never has to special-case a missing detector.
pub struct NullDetector {
    category: DetectionCategory,
}

impl NullDetector {
    pub fn new(category: DetectionCategory) -> Self {
        Self { category }
    }
}

impl Default for NullDetector {
    fn default() -> Self {
        Self::new(DetectionCategory::Object)
    }
}

impl Detector for NullDetector {
    fn name(&self) -> &'static str {
        "null"
    }

    fn category(&self) -> DetectionCategory {
        self.category
    }

    fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_detector_reports_nothing() {
        let mut detector = NullDetector::new(DetectionCategory::Motion);
        assert_eq!(detector.category(), DetectionCategory::Motion);
        let frame = RgbImage::from_pixel(32, 32, image::Rgb([255, 255, 255]));
        assert!(detector.detect(&frame).unwrap().is_empty());
    }
}
