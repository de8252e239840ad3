//! Decoded frames.
//!
//! - `Frame`: an RGB image plus capture time and per-pipeline sequence number.
//! - `placeholder_image`: what readers get before the first frame arrives.
//!
//! Frames are cloned, never shared, when they cross from the capture worker to
//! the analysis worker, so neither side can observe the other's mutations.

use image::RgbImage;
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the blank image served before a stream has produced anything.
pub const PLACEHOLDER_WIDTH: u32 = 640;
pub const PLACEHOLDER_HEIGHT: u32 = 480;

#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: SystemTime,
    /// Strictly increasing while running; restarts at 1 after a file loop-back.
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            captured_at: SystemTime::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn timestamp_secs(&self) -> f64 {
        epoch_secs(self.captured_at)
    }
}

/// Black 640x480 image.
pub fn placeholder_image() -> RgbImage {
    RgbImage::new(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT)
}

/// Seconds since the Unix epoch with sub-second precision. Clocks set before
/// 1970 report 0.
pub fn epoch_secs(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_blank_vga() {
        let img = placeholder_image();
        assert_eq!(img.dimensions(), (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT));
        assert!(img.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn cloned_frame_is_independent() {
        let original = Frame::new(RgbImage::new(4, 4), 7);
        let mut copy = original.clone();
        copy.image.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        assert_eq!(original.image.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(copy.sequence, 7);
        assert!(original.timestamp_secs() > 0.0);
    }
}
