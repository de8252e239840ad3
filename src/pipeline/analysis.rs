//! Analysis worker: frame queue in, annotated results out.

use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime};

use crate::annotate::annotate;
use crate::config::{AnalysisSettings, SharedSettings};
use crate::detect::{AnalysisResult, DetectorFactory};
use crate::frame::{epoch_secs, Frame};
use crate::queue::{BoundedQueue, PushOutcome};

use super::{CancelToken, Counters};

pub(crate) struct AnalysisWorker {
    pub(crate) stream_id: String,
    pub(crate) factory: DetectorFactory,
    pub(crate) settings: SharedSettings,
    pub(crate) counters: Arc<Counters>,
    pub(crate) frames: Arc<BoundedQueue<Frame>>,
    pub(crate) results: Arc<BoundedQueue<Arc<AnalysisResult>>>,
    pub(crate) cancel: Arc<CancelToken>,
    pub(crate) idle_poll: Duration,
}

impl AnalysisWorker {
    pub(crate) fn run(self) {
        // Built on this thread: loading a model can take a while and must not
        // hold up `Pipeline::start`.
        let initial = self.current_settings();
        let mut stack = (self.factory)(&initial);
        let cold = stack.warm_up();
        if !cold.is_empty() {
            self.counters
                .detector_failures
                .fetch_add(cold.len() as u64, Ordering::Relaxed);
        }
        let (motion, object) = stack.detector_names();
        log::info!(
            "stream {}: analysis running (motion: {}, object: {})",
            self.stream_id,
            motion,
            object
        );

        while !self.cancel.is_cancelled() {
            let Some(frame) = self.frames.pop_timeout(self.idle_poll) else {
                continue;
            };
            let settings = self.current_settings();
            let output = stack.run(&frame.image, &settings);
            if !output.failures.is_empty() {
                self.counters
                    .detector_failures
                    .fetch_add(output.failures.len() as u64, Ordering::Relaxed);
            }

            let annotated = annotate(&frame.image, &output.detections);
            let result = Arc::new(AnalysisResult {
                timestamp: epoch_secs(SystemTime::now()),
                sequence: frame.sequence,
                detections: output.detections,
                annotated: Some(annotated),
            });

            if let PushOutcome::Evicted(_) = self.results.push(Arc::clone(&result)) {
                self.counters.results_evicted.fetch_add(1, Ordering::Relaxed);
            }
            self.counters.latest.publish_result(result);
        }
        log::debug!("stream {}: analysis stopped", self.stream_id);
    }

    fn current_settings(&self) -> AnalysisSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
