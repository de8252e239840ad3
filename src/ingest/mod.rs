//! Frame ingestion sources.
//!
//! This module provides the sources a pipeline can capture from:
//! - Synthetic live camera (`stub://name`, testing and demos)
//! - Raw MJPEG files (`.mjpeg` / `.mjpg`, always available)
//! - Other local video files (feature: ingest-file-ffmpeg)
//! - RTSP / HTTP network streams (feature: rtsp-gstreamer)
//!
//! Sources hand out decoded RGB images; sequence numbers, timestamps, pacing
//! and reconnection are the capture worker's job, not the source's.
//!
//! `SourceOpener` is the seam the registry opens sources through, so tests and
//! embedders can substitute their own.

#[cfg(feature = "ingest-file-ffmpeg")]
mod file_ffmpeg;
pub mod mjpeg;
#[cfg(feature = "rtsp-gstreamer")]
mod network;
pub mod synthetic;

use anyhow::{bail, Result};
use image::RgbImage;
use serde::Serialize;
use std::path::Path;

use crate::config::{PipelineConfig, SyntheticSettings};

pub use mjpeg::MjpegFileSource;
pub use synthetic::SyntheticSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Live,
    File,
}

/// What a pipeline captures from. Immutable once the pipeline exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSource {
    pub id: String,
    /// Network URI or local path, exactly as given.
    pub origin: String,
    pub kind: SourceKind,
    /// File name for local files, the origin otherwise.
    pub name: String,
}

impl StreamSource {
    /// The kind is `File` exactly when `origin` names an existing regular file.
    pub fn new(id: impl Into<String>, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        let path = Path::new(&origin);
        let (kind, name) = if path.is_file() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| origin.clone());
            (SourceKind::File, name)
        } else {
            (SourceKind::Live, origin.clone())
        };
        Self {
            id: id.into(),
            origin,
            kind,
            name,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == SourceKind::File
    }
}

/// Static facts a source knows about itself after opening.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SourceProperties {
    /// Native frame rate, when the container carries one.
    pub fps: Option<f64>,
    /// Frame count for finite sources.
    pub total_frames: Option<u64>,
}

/// An open source handle. Dropping it releases the underlying resource.
pub trait VideoSource: Send {
    /// Decode the next frame. `Ok(None)` means end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>>;

    /// Seek back to the first frame.
    fn rewind(&mut self) -> Result<()> {
        bail!("source cannot rewind")
    }

    fn properties(&self) -> SourceProperties;
}

pub trait SourceOpener: Send + Sync {
    fn open(&self, source: &StreamSource) -> Result<Box<dyn VideoSource>>;
}

/// Default opener: dispatches on the origin's kind, scheme and extension.
#[derive(Clone, Debug)]
pub struct MediaOpener {
    synthetic: SyntheticSettings,
    fallback_file_fps: f64,
}

impl MediaOpener {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            synthetic: config.synthetic.clone(),
            fallback_file_fps: config.fallback_file_fps,
        }
    }
}

impl SourceOpener for MediaOpener {
    fn open(&self, source: &StreamSource) -> Result<Box<dyn VideoSource>> {
        match source.kind {
            SourceKind::File => open_file(&source.origin, self.fallback_file_fps),
            SourceKind::Live => {
                if source.origin.starts_with("stub://") {
                    return Ok(Box::new(SyntheticSource::new(
                        &source.origin,
                        self.synthetic.clone(),
                    )));
                }
                if is_network_uri(&source.origin) {
                    return open_network(&source.origin);
                }
                bail!("'{}' is neither an existing file nor a network URI", source.origin)
            }
        }
    }
}

fn open_file(path: &str, fallback_fps: f64) -> Result<Box<dyn VideoSource>> {
    if mjpeg::is_mjpeg_path(path) {
        return Ok(Box::new(MjpegFileSource::open(path, fallback_fps)?));
    }
    #[cfg(feature = "ingest-file-ffmpeg")]
    {
        Ok(Box::new(file_ffmpeg::FfmpegFileSource::open(path)?))
    }
    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    {
        bail!("decoding '{}' requires the ingest-file-ffmpeg feature", path)
    }
}

fn open_network(uri: &str) -> Result<Box<dyn VideoSource>> {
    #[cfg(feature = "rtsp-gstreamer")]
    {
        Ok(Box::new(network::GstreamerSource::open(uri)?))
    }
    #[cfg(not(feature = "rtsp-gstreamer"))]
    {
        bail!("network source '{}' requires the rtsp-gstreamer feature", uri)
    }
}

fn is_network_uri(origin: &str) -> bool {
    ["rtsp://", "rtsps://", "http://", "https://", "rtmp://", "udp://"]
        .iter()
        .any(|scheme| origin.starts_with(scheme))
}
