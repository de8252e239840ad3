//! Synthetic live camera for `stub://` origins.
//!
//! Produces a static grey scene with a bright block sweeping across it, so
//! motion detection has something to find. Frames are delivered at the
//! configured rate: `read_frame` blocks until the next frame is due, like a
//! real camera would.

use anyhow::Result;
use image::{Rgb, RgbImage};
use std::time::{Duration, Instant};

use super::{SourceProperties, VideoSource};
use crate::config::SyntheticSettings;

const BACKGROUND: Rgb<u8> = Rgb([64, 64, 64]);
const BLOCK: Rgb<u8> = Rgb([230, 230, 230]);
const BLOCK_SIDE: u32 = 48;
/// Horizontal travel per frame, in pixels.
const BLOCK_STEP: u32 = 8;

pub struct SyntheticSource {
    origin: String,
    settings: SyntheticSettings,
    frame_count: u64,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(origin: &str, settings: SyntheticSettings) -> Self {
        log::info!(
            "SyntheticSource: connected to {} ({}x{} @ {} fps)",
            origin,
            settings.width,
            settings.height,
            settings.fps
        );
        Self {
            origin: origin.to_string(),
            settings,
            frame_count: 0,
            next_due: None,
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.settings.fps.max(1)))
    }

    fn render(&self) -> RgbImage {
        let (width, height) = (self.settings.width, self.settings.height);
        let mut image = RgbImage::from_pixel(width, height, BACKGROUND);

        let side = BLOCK_SIDE.min(width).min(height);
        let travel = (width - side).max(1);
        let step = self.frame_count.wrapping_mul(u64::from(BLOCK_STEP));
        let offset = (step % u64::from(travel)) as u32;
        let top = (height - side) / 2;
        for y in top..top + side {
            for x in offset..offset + side {
                image.put_pixel(x, y, BLOCK);
            }
        }
        image
    }
}

impl VideoSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let now = Instant::now();
        match self.next_due {
            Some(due) if due > now => std::thread::sleep(due - now),
            _ => {}
        }
        let interval = self.frame_interval();
        self.next_due = Some(self.next_due.map_or(now, |due| due.max(now)) + interval);

        let image = self.render();
        self.frame_count += 1;
        Ok(Some(image))
    }

    fn properties(&self) -> SourceProperties {
        SourceProperties {
            fps: Some(f64::from(self.settings.fps)),
            total_frames: None,
        }
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        log::debug!(
            "SyntheticSource: released {} after {} frames",
            self.origin,
            self.frame_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SyntheticSettings {
        SyntheticSettings {
            width: 160,
            height: 120,
            fps: 50,
        }
    }

    #[test]
    fn frames_have_configured_dimensions() -> Result<()> {
        let mut source = SyntheticSource::new("stub://test", small());
        let frame = source.read_frame()?.expect("live source never ends");
        assert_eq!(frame.dimensions(), (160, 120));
        Ok(())
    }

    #[test]
    fn block_moves_between_frames() -> Result<()> {
        let mut source = SyntheticSource::new("stub://test", small());
        let first = source.read_frame()?.expect("frame");
        let second = source.read_frame()?.expect("frame");
        assert_ne!(first.as_raw(), second.as_raw());
        Ok(())
    }

    #[test]
    fn delivery_is_paced_to_fps() -> Result<()> {
        let mut source = SyntheticSource::new("stub://test", small());
        let started = Instant::now();
        for _ in 0..6 {
            source.read_frame()?;
        }
        // Five intervals of 20ms after the first immediate frame.
        assert!(started.elapsed() >= Duration::from_millis(95));
        Ok(())
    }

    #[test]
    fn cannot_rewind() {
        let mut source = SyntheticSource::new("stub://test", small());
        assert!(source.rewind().is_err());
    }
}
