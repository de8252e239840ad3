//! Capture worker: owns the source handle and feeds the frame queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::frame::Frame;
use crate::ingest::{SourceOpener, StreamSource, VideoSource};
use crate::queue::BoundedQueue;

use super::{CancelToken, Counters};

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Frames-per-second over windows of at least one second.
///
/// The first tick only opens a window; each later tick counts one frame.
/// Once a window spans `FPS_WINDOW` the rate is recomputed and a new window
/// starts at that tick.
#[derive(Debug, Default)]
pub(crate) struct FpsMeter {
    window_start: Option<Instant>,
    frames: u32,
}

impl FpsMeter {
    pub(crate) fn tick_at(&mut self, now: Instant) -> Option<f64> {
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return None;
        };
        self.frames += 1;
        let elapsed = now.saturating_duration_since(start);
        if elapsed < FPS_WINDOW {
            return None;
        }
        let fps = f64::from(self.frames) / elapsed.as_secs_f64();
        self.window_start = Some(now);
        self.frames = 0;
        Some(fps)
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Deadline schedule for file playback at the native frame rate.
#[derive(Debug)]
pub(crate) struct Pacer {
    fps: Option<f64>,
    origin: Instant,
}

impl Pacer {
    pub(crate) fn new(fps: Option<f64>, origin: Instant) -> Self {
        Self {
            fps: fps.filter(|fps| fps.is_finite() && *fps > 0.0),
            origin,
        }
    }

    /// When frame `index` (frames read since the last loop-back) is due.
    /// A deadline too far out to represent leaves the frame unpaced.
    pub(crate) fn due(&self, index: u64) -> Option<Instant> {
        let fps = self.fps?;
        let offset = Duration::try_from_secs_f64(index as f64 / fps).ok()?;
        self.origin.checked_add(offset)
    }

    pub(crate) fn rebase(&mut self, origin: Instant) {
        self.origin = origin;
    }
}

pub(crate) struct CaptureWorker {
    pub(crate) source: StreamSource,
    pub(crate) handle: Option<Box<dyn VideoSource>>,
    pub(crate) opener: Arc<dyn SourceOpener>,
    pub(crate) config: PipelineConfig,
    pub(crate) counters: Arc<Counters>,
    pub(crate) frames: Arc<BoundedQueue<Frame>>,
    pub(crate) cancel: Arc<CancelToken>,
}

impl CaptureWorker {
    /// Runs until cancelled and returns the handle it still holds, so the
    /// caller can release it.
    pub(crate) fn run(mut self) -> Option<Box<dyn VideoSource>> {
        let is_file = self.source.is_file();
        let mut pacer = Pacer::new(self.paced_fps(), Instant::now());
        let mut fps = FpsMeter::default();
        // Frames read since the last loop-back (or reconnect).
        let mut index: u64 = 0;

        while !self.cancel.is_cancelled() {
            if self.handle.is_none() {
                if self.reconnect() {
                    index = 0;
                    self.counters.current_frame.store(0, Ordering::Relaxed);
                    fps.reset();
                    pacer = Pacer::new(self.paced_fps(), Instant::now());
                }
                continue;
            }

            if let Some(due) = pacer.due(index) {
                if !self.cancel.sleep_until(due) {
                    break;
                }
            }

            let Some(handle) = self.handle.as_mut() else {
                continue;
            };
            match handle.read_frame() {
                Ok(Some(image)) => {
                    index += 1;
                    self.publish(Frame::new(image, index), &mut fps);
                }
                Ok(None) if is_file => {
                    let empty_pass = index == 0;
                    self.loop_back(&mut index);
                    if empty_pass && !self.cancel.sleep(self.config.reconnect_backoff) {
                        break;
                    }
                    pacer.rebase(Instant::now());
                }
                Ok(None) => {
                    log::warn!("stream {}: live source ended, reconnecting", self.source.id);
                    self.release_and_back_off();
                }
                Err(err) if is_file => {
                    log::warn!(
                        "stream {}: read failed ({:#}), restarting playback",
                        self.source.id,
                        err
                    );
                    let empty_pass = index == 0;
                    self.loop_back(&mut index);
                    if empty_pass && !self.cancel.sleep(self.config.reconnect_backoff) {
                        break;
                    }
                    pacer.rebase(Instant::now());
                }
                Err(err) => {
                    log::warn!(
                        "stream {}: read failed ({:#}), reconnecting in {:?}",
                        self.source.id,
                        err,
                        self.config.reconnect_backoff
                    );
                    self.counters.record_error(format!("read failed: {err:#}"));
                    self.release_and_back_off();
                }
            }
        }

        self.counters.set_fps(0.0);
        self.handle
    }

    fn paced_fps(&self) -> Option<f64> {
        if !self.source.is_file() {
            return None;
        }
        self.handle.as_ref().and_then(|h| h.properties().fps)
    }

    fn publish(&self, frame: Frame, fps: &mut FpsMeter) {
        let counters = &self.counters;
        counters.frames_captured.fetch_add(1, Ordering::Relaxed);
        counters.current_frame.store(frame.sequence, Ordering::Relaxed);
        if let Some(rate) = fps.tick_at(Instant::now()) {
            counters.set_fps(rate);
            log::debug!(
                "stream {}: {:.1} fps, {} captured, {} dropped",
                self.source.id,
                rate,
                counters.frames_captured.load(Ordering::Relaxed),
                counters.frames_dropped.load(Ordering::Relaxed)
            );
        }

        counters.latest.publish_frame(Arc::new(frame.clone()));
        if !self.frames.push(frame).is_accepted() {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Seek to the first frame; a handle that cannot rewind is released and
    /// reopened on the next iteration.
    fn loop_back(&mut self, index: &mut u64) {
        log::debug!(
            "stream {}: end of file after {} frames, looping",
            self.source.id,
            index
        );
        *index = 0;
        self.counters.current_frame.store(0, Ordering::Relaxed);
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        if let Err(err) = handle.rewind() {
            log::warn!(
                "stream {}: rewind failed ({:#}), reopening",
                self.source.id,
                err
            );
            self.handle = None;
        }
    }

    fn release_and_back_off(&mut self) {
        self.handle = None;
        self.cancel.sleep(self.config.reconnect_backoff);
    }

    /// One reopen attempt; on failure waits the backoff before returning.
    fn reconnect(&mut self) -> bool {
        match self.opener.open(&self.source) {
            Ok(handle) => {
                let props = handle.properties();
                if let Some(total) = props.total_frames {
                    self.counters.total_frames.store(total, Ordering::Relaxed);
                }
                self.handle = Some(handle);
                log::info!("stream {}: reconnected to {}", self.source.id, self.source.origin);
                true
            }
            Err(err) => {
                log::warn!(
                    "stream {}: reconnect to {} failed ({:#}), retrying in {:?}",
                    self.source.id,
                    self.source.origin,
                    err,
                    self.config.reconnect_backoff
                );
                self.counters.record_error(format!("reconnect failed: {err:#}"));
                self.cancel.sleep(self.config.reconnect_backoff);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_recomputes_after_one_second() {
        let start = Instant::now();
        let mut meter = FpsMeter::default();
        assert_eq!(meter.tick_at(start), None);
        for i in 1..20 {
            assert_eq!(meter.tick_at(start + Duration::from_millis(50 * i)), None);
        }
        let fps = meter.tick_at(start + Duration::from_secs(1)).expect("window closed");
        assert!((fps - 20.0).abs() < 0.01, "fps was {fps}");
    }

    #[test]
    fn fps_window_restarts_after_report() {
        let start = Instant::now();
        let mut meter = FpsMeter::default();
        meter.tick_at(start);
        meter.tick_at(start + Duration::from_secs(1));
        // Five frames over the next two seconds.
        for i in 1..5 {
            assert_eq!(meter.tick_at(start + Duration::from_millis(1000 + 400 * i)), None);
        }
        let fps = meter.tick_at(start + Duration::from_secs(3)).expect("window closed");
        assert!((fps - 2.5).abs() < 0.01, "fps was {fps}");
    }

    #[test]
    fn pacer_schedules_from_origin() {
        let origin = Instant::now();
        let pacer = Pacer::new(Some(4.0), origin);
        assert_eq!(pacer.due(0), Some(origin));
        assert_eq!(pacer.due(6), Some(origin + Duration::from_millis(1500)));
    }

    #[test]
    fn pacer_rebase_moves_schedule() {
        let origin = Instant::now();
        let mut pacer = Pacer::new(Some(2.0), origin);
        let later = origin + Duration::from_secs(7);
        pacer.rebase(later);
        assert_eq!(pacer.due(1), Some(later + Duration::from_millis(500)));
    }

    #[test]
    fn pacer_ignores_unknown_rates() {
        let origin = Instant::now();
        assert_eq!(Pacer::new(None, origin).due(4), None);
        assert_eq!(Pacer::new(Some(0.0), origin).due(4), None);
        assert_eq!(Pacer::new(Some(f64::NAN), origin).due(4), None);
    }

    #[test]
    fn pacer_treats_unrepresentable_deadline_as_unpaced() {
        let origin = Instant::now();
        let pacer = Pacer::new(Some(1e-30), origin);
        assert_eq!(pacer.due(0), Some(origin));
        assert_eq!(pacer.due(1), None);
        assert_eq!(pacer.due(u64::MAX), None);
    }
}
