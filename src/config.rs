use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::queue::{DEFAULT_FRAME_QUEUE_CAPACITY, DEFAULT_RESULT_QUEUE_CAPACITY};

const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_MODEL_PATH: &str = "models/yolov5s.onnx";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_MOTION_THRESHOLD: u32 = 25;
const DEFAULT_CONTOUR_AREA: u32 = 500;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1_000;
const MIN_RECONNECT_BACKOFF_MS: u64 = 1_000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 1_000;
/// Slowest accepted playback rate for files without a container rate.
const MIN_FILE_FPS: f64 = 0.01;
/// The synthetic source sleeps one frame interval per read without watching
/// cancellation, so the interval has to stay well below the stop timeout.
const MIN_SYNTHETIC_FPS: u32 = 2;
const DEFAULT_IDLE_POLL_MS: u64 = 10;
const DEFAULT_SYNTHETIC_WIDTH: u32 = 640;
const DEFAULT_SYNTHETIC_HEIGHT: u32 = 480;
const DEFAULT_SYNTHETIC_FPS: u32 = 10;

// -------------------- Analysis settings (shared, runtime-mutable) --------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionSettings {
    pub enabled: bool,
    pub model_path: String,
    pub confidence: f32,
    /// Square model input side in pixels.
    pub input_size: u32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            model_path: DEFAULT_MODEL_PATH.to_string(),
            confidence: DEFAULT_CONFIDENCE,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionSettings {
    pub enabled: bool,
    /// Luminance difference (0-255) above which a pixel counts as changed.
    pub threshold: u32,
    /// Minimum changed-pixel count for a motion region.
    pub contour_area: u32,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_MOTION_THRESHOLD,
            contour_area: DEFAULT_CONTOUR_AREA,
        }
    }
}

/// Detection configuration shared by every pipeline.
///
/// Analysis workers read it once per frame without a snapshot across the
/// whole loop, so an update lands on each pipeline's next frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub detection: DetectionSettings,
    pub motion: MotionSettings,
}

pub type SharedSettings = Arc<RwLock<AnalysisSettings>>;

#[derive(Debug, Default, Deserialize)]
pub struct DetectionPatch {
    pub enabled: Option<bool>,
    pub model_path: Option<String>,
    pub confidence: Option<f32>,
    pub input_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MotionPatch {
    pub enabled: Option<bool>,
    pub threshold: Option<u32>,
    pub contour_area: Option<u32>,
}

/// Partial update accepted by `POST /api/config` and the config file.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsPatch {
    pub detection: Option<DetectionPatch>,
    pub motion: Option<MotionPatch>,
}

impl AnalysisSettings {
    /// Merge `patch` into a copy, validate, then commit. On error `self` is
    /// left untouched.
    pub fn apply(&mut self, patch: SettingsPatch) -> Result<()> {
        let mut next = self.clone();
        if let Some(d) = patch.detection {
            if let Some(enabled) = d.enabled {
                next.detection.enabled = enabled;
            }
            if let Some(model_path) = d.model_path {
                next.detection.model_path = model_path;
            }
            if let Some(confidence) = d.confidence {
                next.detection.confidence = confidence;
            }
            if let Some(input_size) = d.input_size {
                next.detection.input_size = input_size;
            }
        }
        if let Some(m) = patch.motion {
            if let Some(enabled) = m.enabled {
                next.motion.enabled = enabled;
            }
            if let Some(threshold) = m.threshold {
                next.motion.threshold = threshold;
            }
            if let Some(contour_area) = m.contour_area {
                next.motion.contour_area = contour_area;
            }
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.detection.confidence) {
            return Err(anyhow!("detection.confidence must be within [0, 1]"));
        }
        if self.detection.input_size == 0 {
            return Err(anyhow!("detection.input_size must be greater than zero"));
        }
        if self.motion.threshold > 255 {
            return Err(anyhow!("motion.threshold must be within [0, 255]"));
        }
        Ok(())
    }
}

// -------------------- Pipeline tuning (fixed per process) --------------------

#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_SYNTHETIC_WIDTH,
            height: DEFAULT_SYNTHETIC_HEIGHT,
            fps: DEFAULT_SYNTHETIC_FPS,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub frame_queue_capacity: usize,
    pub result_queue_capacity: usize,
    /// Wait between releasing a failed live source and reopening it.
    pub reconnect_backoff: Duration,
    /// Bounded join per worker in `Pipeline::stop`. Must exceed `idle_poll`
    /// and one synthetic frame interval.
    pub stop_timeout: Duration,
    /// Longest the analysis worker waits on an empty frame queue before
    /// re-checking cancellation.
    pub idle_poll: Duration,
    /// Playback rate for files whose container carries none (raw MJPEG).
    /// Zero disables pacing for such files.
    pub fallback_file_fps: f64,
    pub synthetic: SyntheticSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            result_queue_capacity: DEFAULT_RESULT_QUEUE_CAPACITY,
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            idle_poll: Duration::from_millis(DEFAULT_IDLE_POLL_MS),
            fallback_file_fps: 0.0,
            synthetic: SyntheticSettings::default(),
        }
    }
}

// -------------------- Daemon configuration --------------------

#[derive(Debug, Deserialize, Default)]
struct VmsConfigFile {
    api: Option<ApiConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    synthetic: Option<SyntheticConfigFile>,
    detection: Option<DetectionPatch>,
    motion: Option<MotionPatch>,
    streams: Option<Vec<StreamEntry>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    frame_queue_capacity: Option<usize>,
    result_queue_capacity: Option<usize>,
    reconnect_backoff_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
    idle_poll_ms: Option<u64>,
    fallback_file_fps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SyntheticConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

/// A stream created at startup.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct StreamEntry {
    pub id: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct VmsConfig {
    pub api_addr: String,
    pub pipeline: PipelineConfig,
    pub analysis: AnalysisSettings,
    pub streams: Vec<StreamEntry>,
}

impl VmsConfig {
    /// Load from the file named by `VMS_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VMS_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => VmsConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VmsConfigFile) -> Result<Self> {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let defaults = PipelineConfig::default();
        let p = file.pipeline.unwrap_or_default();
        let s = file.synthetic.unwrap_or_default();
        let pipeline = PipelineConfig {
            frame_queue_capacity: p
                .frame_queue_capacity
                .unwrap_or(defaults.frame_queue_capacity),
            result_queue_capacity: p
                .result_queue_capacity
                .unwrap_or(defaults.result_queue_capacity),
            reconnect_backoff: p
                .reconnect_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_backoff),
            stop_timeout: p
                .stop_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_timeout),
            idle_poll: p
                .idle_poll_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_poll),
            fallback_file_fps: p.fallback_file_fps.unwrap_or(defaults.fallback_file_fps),
            synthetic: SyntheticSettings {
                width: s.width.unwrap_or(defaults.synthetic.width),
                height: s.height.unwrap_or(defaults.synthetic.height),
                fps: s.fps.unwrap_or(defaults.synthetic.fps),
            },
        };

        let mut analysis = AnalysisSettings::default();
        analysis.apply(SettingsPatch {
            detection: file.detection,
            motion: file.motion,
        })?;

        Ok(Self {
            api_addr,
            pipeline,
            analysis,
            streams: file.streams.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("VMS_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("VMS_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.analysis.detection.model_path = path;
            }
        }
        if let Ok(streams) = std::env::var("VMS_STREAMS") {
            let parsed = parse_stream_list(&streams);
            if !parsed.is_empty() {
                self.streams = parsed;
            }
        }
        if let Ok(backoff) = std::env::var("VMS_RECONNECT_BACKOFF_MS") {
            let millis: u64 = backoff.parse().map_err(|_| {
                anyhow!("VMS_RECONNECT_BACKOFF_MS must be an integer number of milliseconds")
            })?;
            self.pipeline.reconnect_backoff = Duration::from_millis(millis);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.frame_queue_capacity == 0 || p.result_queue_capacity == 0 {
            return Err(anyhow!("queue capacities must be greater than zero"));
        }
        if p.reconnect_backoff < Duration::from_millis(MIN_RECONNECT_BACKOFF_MS) {
            return Err(anyhow!(
                "reconnect backoff must be at least {} ms",
                MIN_RECONNECT_BACKOFF_MS
            ));
        }
        if p.stop_timeout.is_zero() {
            return Err(anyhow!("stop timeout must be greater than zero"));
        }
        if p.idle_poll.is_zero() || p.idle_poll >= p.stop_timeout {
            return Err(anyhow!(
                "idle_poll_ms must be greater than zero and below stop_timeout_ms ({} ms)",
                p.stop_timeout.as_millis()
            ));
        }
        let fps = p.fallback_file_fps;
        if !fps.is_finite() || fps < 0.0 || (fps > 0.0 && fps < MIN_FILE_FPS) {
            return Err(anyhow!(
                "fallback_file_fps must be 0 (unpaced) or at least {}",
                MIN_FILE_FPS
            ));
        }
        if p.synthetic.width == 0 || p.synthetic.height == 0 {
            return Err(anyhow!("synthetic source dimensions must be non-zero"));
        }
        let synthetic_interval = Duration::from_secs(1) / p.synthetic.fps.max(1);
        if p.synthetic.fps < MIN_SYNTHETIC_FPS || synthetic_interval >= p.stop_timeout {
            return Err(anyhow!(
                "synthetic fps must be at least {} and one frame must fit in stop_timeout_ms",
                MIN_SYNTHETIC_FPS
            ));
        }
        self.analysis.validate()
    }
}

fn read_config_file(path: &Path) -> Result<VmsConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

/// Parse `id=url,url2,...`; entries without `id=` get a generated id.
fn parse_stream_list(value: &str) -> Vec<StreamEntry> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((id, url)) if !id.contains("://") && !id.contains('/') => StreamEntry {
                id: Some(id.trim().to_string()),
                url: url.trim().to_string(),
            },
            _ => StreamEntry {
                id: None,
                url: entry.to_string(),
            },
        })
        .collect()
}
