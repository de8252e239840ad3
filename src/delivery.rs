//! Frame delivery to HTTP readers: JPEG encoding and MJPEG part framing.
//!
//! Everything here reads from the latest-state cache only, so a slow client
//! never holds up capture or analysis.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::time::Duration;

use crate::pipeline::Pipeline;

pub const JPEG_QUALITY: u8 = 80;
/// Multipart boundary used by the video feed.
pub const FEED_BOUNDARY: &str = "frame";
/// Delay between parts of the video feed.
pub const FEED_INTERVAL: Duration = Duration::from_millis(100);

pub fn feed_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={FEED_BOUNDARY}")
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .context("encode jpeg")?;
    Ok(buffer)
}

/// The image a reader should see now: the latest annotated frame, else the
/// latest raw frame, else the blank placeholder.
pub fn current_view(pipeline: &Pipeline) -> RgbImage {
    if let Some(annotated) = pipeline
        .latest_result()
        .and_then(|result| result.annotated.clone())
    {
        return annotated;
    }
    pipeline.latest_image()
}

pub fn snapshot_jpeg(pipeline: &Pipeline) -> Result<Vec<u8>> {
    encode_jpeg(&current_view(pipeline), JPEG_QUALITY)
}

/// One `multipart/x-mixed-replace` part carrying a JPEG.
pub fn feed_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{FEED_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}
