//! Per-stream pipeline.
//!
//! ```text
//! source ─► capture ─► frame queue (reject new) ─► analysis ─► result queue (evict oldest)
//!             │                                       │
//!             └────────────► latest state ◄───────────┘
//! ```
//!
//! Each running pipeline owns two OS threads. They share nothing but the two
//! bounded queues, the latest-state cache and a set of atomic counters, so
//! `status()` never waits on either worker.
//!
//! The capture worker owns the source handle. `stop()` cancels both workers,
//! waits a bounded time for each, and only then drops the handle it gets back.
//! A worker that outlives the timeout drops the handle itself when it exits.

mod analysis;
mod capture;
mod latest;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::config::{PipelineConfig, SharedSettings};
use crate::detect::{AnalysisResult, DetectorFactory};
use crate::error::StreamError;
use crate::frame::Frame;
use crate::ingest::{SourceOpener, StreamSource, VideoSource};
use crate::queue::{BoundedQueue, OverflowPolicy};

use analysis::AnalysisWorker;
use capture::CaptureWorker;
pub use latest::LatestState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
        }
    }
}

/// Snapshot of one pipeline, as served by the status endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineStatus {
    pub id: String,
    pub url: String,
    pub name: String,
    pub state: PipelineState,
    pub running: bool,
    pub fps: f64,
    pub detection_enabled: bool,
    pub motion_enabled: bool,
    pub is_local_file: bool,
    /// File sources only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_frame: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub results_evicted: u64,
    pub detector_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Playback progress in percent; 0 when the total is unknown.
pub fn playback_progress(current: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (current as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Cancellation flag with a condition variable, so sleeping workers wake as
/// soon as `cancel` is called instead of at the end of their sleep.
#[derive(Default)]
pub(crate) struct CancelToken {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl CancelToken {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_all();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `false` if cancelled before `deadline`.
    pub(crate) fn sleep_until(&self, deadline: Instant) -> bool {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            guard = self
                .wake
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration)
    }
}

/// State both workers write and `status()` reads.
#[derive(Default)]
pub(crate) struct Counters {
    state: AtomicU8,
    pub(crate) frames_captured: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) results_evicted: AtomicU64,
    pub(crate) detector_failures: AtomicU64,
    pub(crate) current_frame: AtomicU64,
    pub(crate) total_frames: AtomicU64,
    fps_bits: AtomicU64,
    last_error: Mutex<Option<String>>,
    pub(crate) latest: LatestState,
}

impl Counters {
    fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: PipelineState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A worker thread whose output is handed back over a channel, so the join
/// can be bounded.
struct Worker<T> {
    name: &'static str,
    thread: JoinHandle<()>,
    done: Receiver<T>,
}

impl<T: Send + 'static> Worker<T> {
    fn spawn(
        name: &'static str,
        stream_id: &str,
        body: impl FnOnce() -> T + Send + 'static,
    ) -> Result<Self> {
        let (tx, done) = mpsc::sync_channel(1);
        let thread = std::thread::Builder::new()
            .name(format!("{name}-{stream_id}"))
            .spawn(move || {
                // If `join` already gave up, the receiver is gone and the
                // output (e.g. the source handle) is dropped right here.
                let _ = tx.send(body());
            })
            .map_err(|e| anyhow!("spawn {} worker: {}", name, e))?;
        Ok(Self { name, thread, done })
    }

    fn join(self, timeout: Duration) -> Option<T> {
        match self.done.recv_timeout(timeout) {
            Ok(output) => {
                let _ = self.thread.join();
                Some(output)
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "{} worker did not exit within {:?}; detaching",
                    self.name,
                    timeout
                );
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                if self.thread.join().is_err() {
                    log::error!("{} worker panicked", self.name);
                }
                None
            }
        }
    }
}

struct Run {
    cancel: Arc<CancelToken>,
    capture: Worker<Option<Box<dyn VideoSource>>>,
    analysis: Worker<()>,
}

/// One source bound to its capture and analysis workers.
pub struct Pipeline {
    source: StreamSource,
    config: PipelineConfig,
    opener: Arc<dyn SourceOpener>,
    factory: DetectorFactory,
    settings: SharedSettings,
    counters: Arc<Counters>,
    frames: Arc<BoundedQueue<Frame>>,
    results: Arc<BoundedQueue<Arc<AnalysisResult>>>,
    run: Mutex<Option<Run>>,
}

impl Pipeline {
    pub fn new(
        source: StreamSource,
        config: PipelineConfig,
        opener: Arc<dyn SourceOpener>,
        factory: DetectorFactory,
        settings: SharedSettings,
    ) -> Self {
        let frames = Arc::new(BoundedQueue::new(
            config.frame_queue_capacity,
            OverflowPolicy::RejectNew,
        ));
        let results = Arc::new(BoundedQueue::new(
            config.result_queue_capacity,
            OverflowPolicy::EvictOldest,
        ));
        Self {
            source,
            config,
            opener,
            factory,
            settings,
            counters: Arc::new(Counters::default()),
            frames,
            results,
            run: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.source.id
    }

    pub fn source(&self) -> &StreamSource {
        &self.source
    }

    pub fn state(&self) -> PipelineState {
        self.counters.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// Open the source and spawn both workers. No-op when already running.
    ///
    /// On failure the pipeline stays `Stopped` with the error recorded, and
    /// nothing is left behind.
    pub fn start(&self) -> Result<(), StreamError> {
        let mut run = self.lock_run();
        if run.is_some() {
            return Ok(());
        }
        self.counters.set_state(PipelineState::Starting);

        let handle = match self.opener.open(&self.source) {
            Ok(handle) => handle,
            Err(err) => return Err(self.fail_start(err)),
        };
        let properties = handle.properties();
        self.counters
            .total_frames
            .store(properties.total_frames.unwrap_or(0), Ordering::Relaxed);
        self.counters.current_frame.store(0, Ordering::Relaxed);
        self.counters.set_fps(0.0);
        self.frames.clear();
        self.frames.reopen();

        match self.spawn_workers(handle) {
            Ok(started) => {
                *run = Some(started);
                self.counters.set_state(PipelineState::Running);
                log::info!(
                    "stream {} started: {} ({})",
                    self.source.id,
                    self.source.name,
                    if self.source.is_file() { "file" } else { "live" }
                );
                Ok(())
            }
            Err(err) => Err(self.fail_start(err)),
        }
    }

    fn fail_start(&self, err: anyhow::Error) -> StreamError {
        log::error!(
            "stream {}: failed to open {}: {:#}",
            self.source.id,
            self.source.origin,
            err
        );
        self.counters.record_error(format!("{err:#}"));
        self.counters.set_state(PipelineState::Stopped);
        StreamError::source_unavailable(&self.source.origin, &err)
    }

    fn spawn_workers(&self, handle: Box<dyn VideoSource>) -> Result<Run> {
        let cancel = Arc::new(CancelToken::default());

        let capture = CaptureWorker {
            source: self.source.clone(),
            handle: Some(handle),
            opener: Arc::clone(&self.opener),
            config: self.config.clone(),
            counters: Arc::clone(&self.counters),
            frames: Arc::clone(&self.frames),
            cancel: Arc::clone(&cancel),
        };
        let capture = Worker::spawn("capture", &self.source.id, move || capture.run())?;

        let analysis = AnalysisWorker {
            stream_id: self.source.id.clone(),
            factory: Arc::clone(&self.factory),
            settings: Arc::clone(&self.settings),
            counters: Arc::clone(&self.counters),
            frames: Arc::clone(&self.frames),
            results: Arc::clone(&self.results),
            cancel: Arc::clone(&cancel),
            idle_poll: self.config.idle_poll,
        };
        let analysis = match Worker::spawn("analysis", &self.source.id, move || analysis.run()) {
            Ok(worker) => worker,
            Err(err) => {
                cancel.cancel();
                drop(capture.join(self.config.stop_timeout));
                return Err(err);
            }
        };

        Ok(Run {
            cancel,
            capture,
            analysis,
        })
    }

    /// Cancel both workers, join each with a bounded wait, then release the
    /// source handle. Idempotent.
    pub fn stop(&self) {
        let mut run = self.lock_run();
        let Some(active) = run.take() else {
            return;
        };
        self.counters.set_state(PipelineState::Stopping);

        active.cancel.cancel();
        self.frames.close();
        let handle = active.capture.join(self.config.stop_timeout).flatten();
        active.analysis.join(self.config.stop_timeout);
        drop(handle);

        self.frames.clear();
        self.counters.set_fps(0.0);
        self.counters.set_state(PipelineState::Stopped);
        log::info!("stream {} stopped", self.source.id);
    }

    pub fn status(&self) -> PipelineStatus {
        let counters = &self.counters;
        let state = counters.state();
        let (detection_enabled, motion_enabled) = {
            let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
            (settings.detection.enabled, settings.motion.enabled)
        };

        let (total_frames, current_frame, progress) = if self.source.is_file() {
            let total = counters.total_frames.load(Ordering::Relaxed);
            let current = counters.current_frame.load(Ordering::Relaxed);
            (
                Some(total),
                Some(current),
                Some(playback_progress(current, total)),
            )
        } else {
            (None, None, None)
        };

        PipelineStatus {
            id: self.source.id.clone(),
            url: self.source.origin.clone(),
            name: self.source.name.clone(),
            state,
            running: state == PipelineState::Running,
            fps: counters.fps(),
            detection_enabled,
            motion_enabled,
            is_local_file: self.source.is_file(),
            total_frames,
            current_frame,
            progress,
            frames_captured: counters.frames_captured.load(Ordering::Relaxed),
            frames_dropped: counters.frames_dropped.load(Ordering::Relaxed),
            results_evicted: counters.results_evicted.load(Ordering::Relaxed),
            detector_failures: counters.detector_failures.load(Ordering::Relaxed),
            last_error: counters.last_error(),
        }
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.counters.latest.frame()
    }

    /// Latest raw image, or a blank 640x480 placeholder before the first frame.
    pub fn latest_image(&self) -> RgbImage {
        self.counters.latest.image_or_placeholder()
    }

    pub fn latest_result(&self) -> Option<Arc<AnalysisResult>> {
        self.counters.latest.result()
    }

    /// Take the oldest queued result, waiting up to `timeout`.
    pub fn next_result(&self, timeout: Duration) -> Option<Arc<AnalysisResult>> {
        self.results.pop_timeout(timeout)
    }

    pub fn queued_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn queued_results(&self) -> usize {
        self.results.len()
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<Run>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
