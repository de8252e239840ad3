use std::sync::{Arc, PoisonError, RwLock};

use image::RgbImage;

use crate::detect::AnalysisResult;
use crate::frame::{placeholder_image, Frame};

/// Most recent raw frame and analysis result of one pipeline.
///
/// Writers replace a slot; readers get a cheap `Arc` clone and never remove
/// anything, so any number of HTTP readers can poll without disturbing the
/// workers or each other.
#[derive(Default)]
pub struct LatestState {
    frame: RwLock<Option<Arc<Frame>>>,
    result: RwLock<Option<Arc<AnalysisResult>>>,
}

impl LatestState {
    pub fn publish_frame(&self, frame: Arc<Frame>) {
        *self.frame.write().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    pub fn publish_result(&self, result: Arc<AnalysisResult>) {
        *self.result.write().unwrap_or_else(PoisonError::into_inner) = Some(result);
    }

    pub fn frame(&self) -> Option<Arc<Frame>> {
        self.frame
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn result(&self) -> Option<Arc<AnalysisResult>> {
        self.result
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest raw image, or the blank placeholder before the first frame.
    pub fn image_or_placeholder(&self) -> RgbImage {
        match self.frame() {
            Some(frame) => frame.image.clone(),
            None => placeholder_image(),
        }
    }

    pub fn clear(&self) {
        *self.frame.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.result.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PLACEHOLDER_HEIGHT, PLACEHOLDER_WIDTH};

    #[test]
    fn empty_state_serves_placeholder() {
        let latest = LatestState::default();
        assert!(latest.frame().is_none());
        assert!(latest.result().is_none());
        assert_eq!(
            latest.image_or_placeholder().dimensions(),
            (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT)
        );
    }

    #[test]
    fn reads_return_last_publish_and_do_not_consume() {
        let latest = LatestState::default();
        for seq in 1..=5 {
            latest.publish_frame(Arc::new(Frame::new(RgbImage::new(8, 8), seq)));
        }
        for _ in 0..3 {
            assert_eq!(latest.frame().map(|f| f.sequence), Some(5));
        }
        assert_eq!(latest.image_or_placeholder().dimensions(), (8, 8));
    }

    #[test]
    fn result_slot_is_independent() {
        let latest = LatestState::default();
        latest.publish_result(Arc::new(AnalysisResult {
            timestamp: 1.0,
            sequence: 9,
            detections: Vec::new(),
            annotated: None,
        }));
        assert_eq!(latest.result().map(|r| r.sequence), Some(9));
        assert!(latest.frame().is_none());
        latest.clear();
        assert!(latest.result().is_none());
    }
}
