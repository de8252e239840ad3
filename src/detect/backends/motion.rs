use anyhow::Result;
use image::RgbImage;

use crate::config::{AnalysisSettings, MotionSettings};
use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, Detection, DetectionCategory};

/// Side of the square cells changed pixels are grouped into.
const BLOCK: u32 = 8;
/// Frames for the running-average background to forget a scene change.
const HISTORY: f32 = 100.0;
/// A cell counts as moving when at least 1/4 of its pixels changed.
const ACTIVE_CELL_DIVISOR: u32 = 4;

/// CPU motion detector.
///
/// Keeps a running-average grayscale background. Pixels whose luminance
/// differs from the background by more than `threshold` are marked changed,
/// changed pixels are pooled into 8x8 cells, and 4-connected groups of active
/// cells become motion regions when their changed-pixel count exceeds
/// `min_area`. The first frame (and any frame whose size differs from the
/// background) only seeds the background.
pub struct MotionDetector {
    threshold: f32,
    min_area: u32,
    background: Option<Background>,
}

struct Background {
    width: u32,
    height: u32,
    luma: Vec<f32>,
}

impl MotionDetector {
    pub fn new(settings: &MotionSettings) -> Self {
        Self {
            threshold: settings.threshold as f32,
            min_area: settings.contour_area,
            background: None,
        }
    }
}

impl Default for MotionDetector {
    fn default() -> Self {
        Self::new(&MotionSettings::default())
    }
}

fn luma(p: &image::Rgb<u8>) -> f32 {
    0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32
}

impl Detector for MotionDetector {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn category(&self) -> DetectionCategory {
        DetectionCategory::Motion
    }

    fn tune(&mut self, settings: &AnalysisSettings) {
        self.threshold = settings.motion.threshold as f32;
        self.min_area = settings.motion.contour_area;
    }

    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let (width, height) = frame.dimensions();
        let seeded = matches!(
            &self.background,
            Some(bg) if bg.width == width && bg.height == height
        );
        if !seeded {
            self.background = Some(Background {
                width,
                height,
                luma: frame.pixels().map(luma).collect(),
            });
            return Ok(Vec::new());
        }
        let Some(background) = self.background.as_mut() else {
            return Ok(Vec::new());
        };

        let cols = width.div_ceil(BLOCK);
        let rows = height.div_ceil(BLOCK);
        let mut changed = vec![0u32; (cols * rows) as usize];
        let rate = 1.0 / HISTORY;

        for (idx, pixel) in frame.pixels().enumerate() {
            let value = luma(pixel);
            let bg = &mut background.luma[idx];
            if (value - *bg).abs() > self.threshold {
                let x = idx as u32 % width;
                let y = idx as u32 / width;
                changed[((y / BLOCK) * cols + x / BLOCK) as usize] += 1;
            }
            *bg += rate * (value - *bg);
        }

        let cell_pixels = |col: u32, row: u32| {
            let w = BLOCK.min(width - col * BLOCK);
            let h = BLOCK.min(height - row * BLOCK);
            w * h
        };
        let active: Vec<bool> = (0..rows)
            .flat_map(|row| (0..cols).map(move |col| (col, row)))
            .map(|(col, row)| {
                let count = changed[(row * cols + col) as usize];
                count > 0 && count * ACTIVE_CELL_DIVISOR >= cell_pixels(col, row)
            })
            .collect();

        let mut visited = vec![false; active.len()];
        let mut regions = Vec::new();
        let mut stack = Vec::new();
        for start in 0..active.len() {
            if !active[start] || visited[start] {
                continue;
            }
            visited[start] = true;
            stack.push(start);
            let (mut min_c, mut min_r, mut max_c, mut max_r) = (cols, rows, 0, 0);
            let mut area = 0u32;
            while let Some(cell) = stack.pop() {
                let col = cell as u32 % cols;
                let row = cell as u32 / cols;
                min_c = min_c.min(col);
                min_r = min_r.min(row);
                max_c = max_c.max(col);
                max_r = max_r.max(row);
                area += changed[cell];

                let mut neighbours = Vec::with_capacity(4);
                if col > 0 {
                    neighbours.push(cell - 1);
                }
                if col + 1 < cols {
                    neighbours.push(cell + 1);
                }
                if row > 0 {
                    neighbours.push(cell - cols as usize);
                }
                if row + 1 < rows {
                    neighbours.push(cell + cols as usize);
                }
                for next in neighbours {
                    if active[next] && !visited[next] {
                        visited[next] = true;
                        stack.push(next);
                    }
                }
            }

            if area <= self.min_area {
                continue;
            }
            let bbox = BoundingBox::new(
                (min_c * BLOCK) as i32,
                (min_r * BLOCK) as i32,
                ((max_c + 1) * BLOCK).min(width) as i32,
                ((max_r + 1) * BLOCK).min(height) as i32,
            );
            if let Some(bbox) = bbox {
                regions.push(Detection::motion(bbox));
            }
        }

        Ok(regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn frame_with_square(x: u32, y: u32, side: u32) -> RgbImage {
        let mut img = RgbImage::new(128, 96);
        for py in y..y + side {
            for px in x..x + side {
                img.put_pixel(px, py, Rgb([255, 255, 255]));
            }
        }
        img
    }

    #[test]
    fn first_frame_only_seeds_background() {
        let mut detector = MotionDetector::default();
        let out = detector.detect(&frame_with_square(16, 16, 40)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn reports_block_aligned_region_for_new_object() {
        let mut detector = MotionDetector::default();
        detector.detect(&RgbImage::new(128, 96)).unwrap();

        let out = detector.detect(&frame_with_square(16, 16, 40)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bbox, BoundingBox::new(16, 16, 56, 56).unwrap());
        assert_eq!(out[0].category, DetectionCategory::Motion);
        assert_eq!(out[0].label, "motion");
        assert_eq!(out[0].confidence, 1.0);
    }

    #[test]
    fn small_changes_are_filtered_by_area() {
        let mut detector = MotionDetector::default();
        detector.detect(&RgbImage::new(128, 96)).unwrap();
        // 16x16 = 256 changed pixels, below the default area of 500.
        let out = detector.detect(&frame_with_square(32, 32, 16)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn tune_applies_new_thresholds() {
        let mut detector = MotionDetector::default();
        let mut settings = AnalysisSettings::default();
        settings.motion.contour_area = 100;
        detector.tune(&settings);
        detector.detect(&RgbImage::new(128, 96)).unwrap();
        let out = detector.detect(&frame_with_square(32, 32, 16)).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn resized_stream_reseeds_background() {
        let mut detector = MotionDetector::default();
        detector.detect(&RgbImage::new(128, 96)).unwrap();
        let out = detector.detect(&RgbImage::new(64, 48)).unwrap();
        assert!(out.is_empty());
    }
}
