use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;

use crate::config::{AnalysisSettings, DetectionSettings};
use crate::detect::backend::Detector;
use crate::detect::backends::{MotionDetector, NullDetector};
use crate::detect::result::{Detection, DetectionCategory};

/// Per-call budget after which a detector is reported as slow.
const SLOW_DETECTOR: Duration = Duration::from_millis(500);

/// Builds the detectors for one pipeline from the current shared settings.
pub type DetectorFactory = Arc<dyn Fn(&AnalysisSettings) -> DetectorStack + Send + Sync>;

/// The motion and object detector slots of one pipeline.
///
/// Every pipeline owns its own stack: motion detection is stateful (it keeps a
/// background model) and must not mix frames from different streams.
pub struct DetectorStack {
    motion: Box<dyn Detector>,
    object: Box<dyn Detector>,
}

#[derive(Debug, Default)]
pub struct StackOutput {
    /// Motion detections first, then object detections.
    pub detections: Vec<Detection>,
    /// Names of detectors that failed this cycle.
    pub failures: Vec<&'static str>,
}

impl DetectorStack {
    pub fn new(motion: Box<dyn Detector>, object: Box<dyn Detector>) -> Self {
        Self { motion, object }
    }

    /// Stack with no real detectors.
    pub fn null() -> Self {
        Self::new(
            Box::new(NullDetector::new(DetectionCategory::Motion)),
            Box::new(NullDetector::new(DetectionCategory::Object)),
        )
    }

    /// Motion detector plus the configured object detector, falling back to
    /// `NullDetector` when the model cannot be loaded.
    pub fn from_settings(settings: &AnalysisSettings) -> Self {
        Self::new(
            Box::new(MotionDetector::new(&settings.motion)),
            load_object_detector(&settings.detection),
        )
    }

    /// Give each detector its warm-up call. A detector that fails to warm up
    /// stays in place; its errors will surface per frame instead.
    pub fn warm_up(&mut self) -> Vec<&'static str> {
        let mut failures = Vec::new();
        for detector in [&mut self.motion, &mut self.object] {
            let outcome = catch_unwind(AssertUnwindSafe(|| detector.warm_up()));
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(_) => "panicked".to_string(),
            };
            log::warn!("detector {} failed to warm up: {}", detector.name(), reason);
            failures.push(detector.name());
        }
        failures
    }

    pub fn detector_names(&self) -> (&'static str, &'static str) {
        (self.motion.name(), self.object.name())
    }

    /// Run every enabled detector on `frame`.
    ///
    /// A detector that errors or panics contributes nothing this cycle; the
    /// failure is logged and reported in `failures` but never propagated.
    pub fn run(&mut self, frame: &RgbImage, settings: &AnalysisSettings) -> StackOutput {
        let mut output = StackOutput::default();
        let slots = [
            (settings.motion.enabled, &mut self.motion),
            (settings.detection.enabled, &mut self.object),
        ];
        for (enabled, detector) in slots {
            if !enabled {
                continue;
            }
            match run_guarded(detector.as_mut(), frame, settings) {
                Ok(found) => output.detections.extend(found),
                Err(reason) => {
                    log::warn!("detector {} failed: {}", detector.name(), reason);
                    output.failures.push(detector.name());
                }
            }
        }
        output
    }
}

fn run_guarded(
    detector: &mut dyn Detector,
    frame: &RgbImage,
    settings: &AnalysisSettings,
) -> Result<Vec<Detection>, String> {
    let category = detector.category();
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        detector.tune(settings);
        detector.detect(frame)
    }));
    let elapsed = started.elapsed();
    if elapsed > SLOW_DETECTOR {
        log::warn!("detector {} took {:?}", detector.name(), elapsed);
    }

    let found = match outcome {
        Ok(Ok(found)) => found,
        Ok(Err(err)) => return Err(format!("{err:#}")),
        Err(_) => return Err("panicked".to_string()),
    };

    let (width, height) = frame.dimensions();
    Ok(found
        .into_iter()
        .filter_map(|mut det| {
            det.bbox = det.bbox.clamp_to(width, height)?;
            det.confidence = det.confidence.clamp(0.0, 1.0);
            det.category = category;
            Some(det)
        })
        .collect())
}

#[cfg(feature = "backend-tract")]
fn load_object_detector(settings: &DetectionSettings) -> Box<dyn Detector> {
    match crate::detect::backends::OnnxDetector::from_settings(settings) {
        Ok(detector) => {
            log::info!("object detector loaded from {}", settings.model_path);
            Box::new(detector)
        }
        Err(err) => {
            log::warn!("object detector unavailable ({:#}); using null detector", err);
            Box::new(NullDetector::new(DetectionCategory::Object))
        }
    }
}

#[cfg(not(feature = "backend-tract"))]
fn load_object_detector(settings: &DetectionSettings) -> Box<dyn Detector> {
    if settings.enabled {
        log::warn!(
            "object detection requires the backend-tract feature; {} ignored, using null detector",
            settings.model_path
        );
    }
    Box::new(NullDetector::new(DetectionCategory::Object))
}

/// Factory used by the daemon: `DetectorStack::from_settings` per pipeline.
pub fn default_factory() -> DetectorFactory {
    Arc::new(DetectorStack::from_settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;
    use anyhow::anyhow;

    struct Fixed(Vec<Detection>, DetectionCategory);

    impl Detector for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn category(&self) -> DetectionCategory {
            self.1
        }
        fn detect(&mut self, _frame: &RgbImage) -> anyhow::Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl Detector for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn category(&self) -> DetectionCategory {
            DetectionCategory::Object
        }
        fn detect(&mut self, _frame: &RgbImage) -> anyhow::Result<Vec<Detection>> {
            Err(anyhow!("model exploded"))
        }
    }

    struct Panicking;

    impl Detector for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }
        fn category(&self) -> DetectionCategory {
            DetectionCategory::Motion
        }
        fn detect(&mut self, _frame: &RgbImage) -> anyhow::Result<Vec<Detection>> {
            panic!("index out of bounds")
        }
    }

    fn bbox(x1: i32, y1: i32, x2: i32, y2: i32) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2).unwrap()
    }

    #[test]
    fn motion_results_come_before_object_results() {
        let motion = Fixed(vec![Detection::motion(bbox(0, 0, 4, 4))], DetectionCategory::Motion);
        let object = Fixed(
            vec![Detection::object(bbox(1, 1, 5, 5), "person", 0.8)],
            DetectionCategory::Object,
        );
        let mut stack = DetectorStack::new(Box::new(motion), Box::new(object));
        let out = stack.run(&RgbImage::new(16, 16), &AnalysisSettings::default());
        let labels: Vec<_> = out.detections.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["motion", "person"]);
        assert!(out.failures.is_empty());
    }

    #[test]
    fn disabled_slots_are_skipped() {
        let motion = Fixed(vec![Detection::motion(bbox(0, 0, 4, 4))], DetectionCategory::Motion);
        let mut stack = DetectorStack::new(Box::new(motion), Box::new(Failing));
        let mut settings = AnalysisSettings::default();
        settings.motion.enabled = false;
        settings.detection.enabled = false;
        let out = stack.run(&RgbImage::new(16, 16), &settings);
        assert!(out.detections.is_empty());
        assert!(out.failures.is_empty());
    }

    #[test]
    fn failing_detectors_degrade_to_empty() {
        let mut stack = DetectorStack::new(Box::new(Panicking), Box::new(Failing));
        let out = stack.run(&RgbImage::new(16, 16), &AnalysisSettings::default());
        assert!(out.detections.is_empty());
        assert_eq!(out.failures, vec!["panicking", "failing"]);
    }

    #[test]
    fn results_are_tagged_and_clamped() {
        // Backend mislabels its category and reports out-of-range values.
        let mut wrong = Detection::object(bbox(-3, 2, 40, 8), "car", 1.7);
        wrong.category = DetectionCategory::Motion;
        let outside = Detection::object(bbox(100, 100, 120, 120), "car", 0.5);
        let object = Fixed(vec![wrong, outside], DetectionCategory::Object);
        let mut stack = DetectorStack::new(
            Box::new(NullDetector::new(DetectionCategory::Motion)),
            Box::new(object),
        );
        let out = stack.run(&RgbImage::new(16, 16), &AnalysisSettings::default());
        assert_eq!(out.detections.len(), 1);
        let det = &out.detections[0];
        assert_eq!(det.category, DetectionCategory::Object);
        assert_eq!(det.bbox, bbox(0, 2, 16, 8));
        assert_eq!(det.confidence, 1.0);
    }

    struct Cold {
        warmed: bool,
    }

    impl Detector for Cold {
        fn name(&self) -> &'static str {
            "cold"
        }
        fn category(&self) -> DetectionCategory {
            DetectionCategory::Object
        }
        fn warm_up(&mut self) -> anyhow::Result<()> {
            self.warmed = true;
            Err(anyhow!("weights not cached"))
        }
        fn detect(&mut self, _frame: &RgbImage) -> anyhow::Result<Vec<Detection>> {
            if !self.warmed {
                return Err(anyhow!("used before warm-up"));
            }
            Ok(Vec::new())
        }
    }

    #[test]
    fn warm_up_reports_failures_and_keeps_detectors() {
        let mut stack = DetectorStack::new(
            Box::new(NullDetector::new(DetectionCategory::Motion)),
            Box::new(Cold { warmed: false }),
        );
        assert_eq!(stack.warm_up(), vec!["cold"]);
        let out = stack.run(&RgbImage::new(8, 8), &AnalysisSettings::default());
        assert!(out.failures.is_empty());
        assert_eq!(stack.detector_names(), ("null", "cold"));
    }

    #[test]
    fn null_stack_has_null_slots() {
        assert_eq!(DetectorStack::null().detector_names(), ("null", "null"));
    }
}
