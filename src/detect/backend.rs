use anyhow::Result;
use image::RgbImage;

use crate::config::AnalysisSettings;
use crate::detect::result::{Detection, DetectionCategory};

/// Detector capability consumed by the analysis worker.
///
/// # Contract
///
/// - `detect` must return in bounded time; the analysis worker has no way to
///   preempt it.
/// - Errors and panics are caught by `DetectorStack` and degrade to an empty
///   detection list for that frame. Implementations should still prefer
///   returning `Err` over panicking.
/// - The frame is borrowed for the duration of the call only.
pub trait Detector: Send {
    /// Backend identifier used in logs.
    fn name(&self) -> &'static str;

    /// Category every detection from this backend is tagged with.
    fn category(&self) -> DetectionCategory;

    /// Run detection on one RGB frame.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>>;

    /// Pick up the latest shared settings. Called before every `detect`.
    fn tune(&mut self, _settings: &AnalysisSettings) {}

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
