//! Video Monitoring Service (VMS)
//!
//! Multi-stream video ingestion and analysis. Each stream gets its own
//! pipeline: a capture worker reads frames from a live camera or a looping
//! local file, an analysis worker runs motion and object detection on them,
//! and the most recent raw and annotated frames are kept for HTTP readers.
//!
//! # Architecture
//!
//! - Capture and analysis run on separate OS threads per stream and talk only
//!   through two bounded queues: frames are dropped when analysis falls
//!   behind, old results are evicted when nobody drains them. Freshness wins
//!   over completeness.
//! - Readers never touch the queues. They peek the latest-state cache, so any
//!   number of snapshot or video-feed clients cost the workers nothing.
//! - File sources play at their native frame rate and loop forever; live
//!   sources reconnect with a fixed backoff.
//! - Detectors sit behind the `Detector` trait. A detector that errors or
//!   panics yields no detections for that frame and the pipeline carries on.
//!
//! # Module Structure
//!
//! - `registry`: `StreamRegistry`, create/delete/list of pipelines
//! - `pipeline`: lifecycle, capture and analysis workers, latest-state cache
//! - `queue`: bounded queues with reject-new / evict-oldest overflow
//! - `ingest`: video sources (synthetic, MJPEG, FFmpeg, GStreamer)
//! - `detect`: detection types, motion detector, optional ONNX detector
//! - `annotate` / `delivery`: drawn boxes, JPEG snapshots, MJPEG feed parts
//! - `api`: HTTP surface
//! - `config`: daemon configuration and shared analysis settings

pub mod annotate;
pub mod api;
pub mod config;
pub mod delivery;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod queue;
pub mod registry;

pub use config::{AnalysisSettings, PipelineConfig, SettingsPatch, SharedSettings, VmsConfig};
pub use detect::{
    AnalysisResult, BoundingBox, Detection, DetectionCategory, Detector, DetectorFactory,
    DetectorStack, MotionDetector, NullDetector,
};
pub use error::StreamError;
pub use frame::Frame;
pub use ingest::{
    MediaOpener, SourceKind, SourceOpener, SourceProperties, StreamSource, VideoSource,
};
pub use pipeline::{Pipeline, PipelineState, PipelineStatus};
pub use queue::{BoundedQueue, OverflowPolicy, PushOutcome};
pub use registry::{RegistryStats, StreamRegistry};
