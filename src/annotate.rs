//! Annotated frames: detection boxes with `label 0.87` captions.
//!
//! Captions use a built-in 5x7 bitmap font so no font file has to ship with
//! the binary. Lowercase letters render as uppercase; characters outside the
//! font leave a blank cell.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::{Detection, DetectionCategory};

pub const OBJECT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const MOTION_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

const BOX_THICKNESS: u32 = 2;
const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = GLYPH_WIDTH + 1;
const CAPTION_PADDING: i32 = 1;

pub fn category_color(category: DetectionCategory) -> Rgb<u8> {
    match category {
        DetectionCategory::Object => OBJECT_COLOR,
        DetectionCategory::Motion => MOTION_COLOR,
    }
}

/// Copy of `frame` with every detection drawn on it.
pub fn annotate(frame: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut out = frame.clone();
    for det in detections {
        draw_detection(&mut out, det);
    }
    out
}

fn draw_detection(image: &mut RgbImage, det: &Detection) {
    let color = category_color(det.category);
    let b = det.bbox;
    for inset in 0..BOX_THICKNESS {
        let inset_i = inset as i32;
        let width = b.width().saturating_sub(2 * inset);
        let height = b.height().saturating_sub(2 * inset);
        if width == 0 || height == 0 {
            break;
        }
        draw_hollow_rect_mut(
            image,
            Rect::at(b.x1 + inset_i, b.y1 + inset_i).of_size(width, height),
            color,
        );
    }

    let caption = det.caption();
    let strip_height = GLYPH_HEIGHT + 2 * CAPTION_PADDING;
    let strip_width = caption.chars().count() as i32 * GLYPH_ADVANCE + CAPTION_PADDING;
    // Above the box when there is room, otherwise inside its top edge.
    let top = if b.y1 >= strip_height {
        b.y1 - strip_height
    } else {
        b.y1
    };
    draw_filled_rect_mut(
        image,
        Rect::at(b.x1, top).of_size(strip_width as u32, strip_height as u32),
        color,
    );
    draw_text(
        image,
        b.x1 + CAPTION_PADDING,
        top + CAPTION_PADDING,
        &caption,
        TEXT_COLOR,
    );
}

/// Draw `text` with its top-left corner at (`x`, `y`), clipped to the image.
pub fn draw_text(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(rows) = glyph(ch) {
            for (row, bits) in rows.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..GLYPH_WIDTH {
                    if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    let px = x + col;
                    if px >= 0 && px < width {
                        image.put_pixel(px as u32, py as u32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

/// Row bitmaps, top to bottom, most significant of the low five bits on the left.
fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '.' => [0, 0, 0, 0, 0, 0b01100, 0b01100],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn bbox(x1: i32, y1: i32, x2: i32, y2: i32) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2).unwrap()
    }

    #[test]
    fn source_frame_is_not_modified() {
        let frame = RgbImage::new(64, 64);
        let out = annotate(&frame, &[Detection::motion(bbox(10, 20, 40, 50))]);
        assert!(frame.pixels().all(|p| p.0 == [0, 0, 0]));
        assert_ne!(out.as_raw(), frame.as_raw());
    }

    #[test]
    fn boxes_use_category_colors() {
        let frame = RgbImage::new(100, 100);
        let out = annotate(
            &frame,
            &[
                Detection::motion(bbox(10, 30, 40, 60)),
                Detection::object(bbox(50, 30, 90, 70), "person", 0.9),
            ],
        );
        // Left edges, well below the caption strips.
        assert_eq!(*out.get_pixel(10, 50), MOTION_COLOR);
        assert_eq!(*out.get_pixel(11, 50), MOTION_COLOR);
        assert_eq!(*out.get_pixel(50, 50), OBJECT_COLOR);
        // Box interior untouched.
        assert_eq!(out.get_pixel(25, 50).0, [0, 0, 0]);
    }

    #[test]
    fn caption_sits_above_box_when_there_is_room() {
        let frame = RgbImage::new(100, 100);
        let out = annotate(&frame, &[Detection::object(bbox(20, 40, 60, 80), "car", 0.5)]);
        // Caption strip covers the 9 rows above y1.
        assert_eq!(*out.get_pixel(20, 31), OBJECT_COLOR);
        assert_eq!(out.get_pixel(20, 29).0, [0, 0, 0]);
    }

    #[test]
    fn text_clips_at_image_edges() {
        let mut image = RgbImage::new(8, 4);
        draw_text(&mut image, -3, -2, "motion 1.00", MOTION_COLOR);
        draw_text(&mut image, 6, 2, "W", MOTION_COLOR);
    }

    #[test]
    fn font_covers_captions() {
        for ch in "abcdefghijklmnopqrstuvwxyz0123456789.-_:".chars() {
            let upper = ch.to_ascii_uppercase();
            assert!(glyph(upper).is_some(), "missing glyph for {ch:?}");
        }
        assert!(glyph('?').is_none());
    }
}
