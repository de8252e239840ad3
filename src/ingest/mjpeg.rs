//! Raw MJPEG file source (`.mjpeg` / `.mjpg`): concatenated JPEG images.
//!
//! The file is indexed once on open so the frame count is known up front;
//! frames are then read from disk one at a time through the open handle.

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbImage};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::{SourceProperties, VideoSource};

const SCAN_CHUNK: usize = 64 * 1024;

pub fn is_mjpeg_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("mjpeg") || ext.eq_ignore_ascii_case("mjpg"))
        .unwrap_or(false)
}

pub struct MjpegFileSource {
    path: String,
    file: File,
    /// (offset, length) of each JPEG image in the file.
    frames: Vec<(u64, u64)>,
    next: usize,
    fps: Option<f64>,
}

impl MjpegFileSource {
    /// `fps` is the playback rate to report; MJPEG carries no timing of its
    /// own. Zero or less reports none.
    pub fn open(path: &str, fps: f64) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open mjpeg file '{}'", path))?;
        let frames = index_frames(BufReader::new(&file))
            .with_context(|| format!("index mjpeg file '{}'", path))?;
        if frames.is_empty() {
            return Err(anyhow!("'{}' contains no JPEG frames", path));
        }
        log::info!("MjpegFileSource: opened {} ({} frames)", path, frames.len());
        Ok(Self {
            path: path.to_string(),
            file,
            frames,
            next: 0,
            fps: (fps > 0.0).then_some(fps),
        })
    }
}

impl VideoSource for MjpegFileSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(&(offset, len)) = self.frames.get(self.next) else {
            return Ok(None);
        };
        self.file
            .seek(SeekFrom::Start(offset))
            .with_context(|| format!("seek in '{}'", self.path))?;
        let mut bytes = vec![0u8; len as usize];
        self.file
            .read_exact(&mut bytes)
            .with_context(|| format!("read frame {} of '{}'", self.next, self.path))?;
        self.next += 1;
        Ok(Some(decode_jpeg(&bytes)?))
    }

    fn rewind(&mut self) -> Result<()> {
        self.next = 0;
        Ok(())
    }

    fn properties(&self) -> SourceProperties {
        SourceProperties {
            fps: self.fps,
            total_frames: Some(self.frames.len() as u64),
        }
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    let image =
        image::load_from_memory_with_format(bytes, ImageFormat::Jpeg).context("decode jpeg")?;
    Ok(image.into_rgb8())
}

/// Locate every top-level SOI..EOI span.
///
/// Markers are tracked by nesting depth so an embedded thumbnail does not
/// end its parent image early. Entropy-coded data byte-stuffs 0xFF, so
/// SOI/EOI cannot appear there.
fn index_frames(mut reader: impl Read) -> Result<Vec<(u64, u64)>> {
    let mut frames = Vec::new();
    let mut chunk = vec![0u8; SCAN_CHUNK];
    let mut pos: u64 = 0;
    let mut prev_ff = false;
    let mut depth = 0u32;
    let mut start = 0u64;

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        for &byte in &chunk[..n] {
            if prev_ff {
                match byte {
                    0xD8 => {
                        if depth == 0 {
                            start = pos - 1;
                        }
                        depth += 1;
                    }
                    0xD9 if depth > 0 => {
                        depth -= 1;
                        if depth == 0 {
                            frames.push((start, pos + 1 - start));
                        }
                    }
                    _ => {}
                }
            }
            prev_ff = byte == 0xFF;
            pos += 1;
        }
    }
    Ok(frames)
}
