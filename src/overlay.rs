use chrono::{DateTime, Local};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{Rgb, RgbImage};

pub const TEXT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const GLYPH_SIZE: u32 = 8;
const TEXT_SCALE: u32 = 2;
const MARGIN: u32 = 10;

/// Draw `text` with its top-left corner at (`x`, `y`) using the 8x8 bitmap
/// font, each font pixel blown up to `scale`×`scale`. Anything outside the
/// image is clipped.
pub fn draw_text(img: &mut RgbImage, x: u32, y: u32, text: &str, scale: u32, color: Rgb<u8>) {
    let scale = scale.max(1);
    let (width, height) = img.dimensions();

    for (index, ch) in text.chars().enumerate() {
        let glyph = match BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) {
            Some(glyph) => glyph,
            None => continue,
        };
        let origin_x = x + index as u32 * GLYPH_SIZE * scale;
        if origin_x >= width {
            break;
        }

        for (row, bits) in glyph.iter().copied().enumerate() {
            for col in 0..GLYPH_SIZE {
                if bits & (1u8 << col) == 0 {
                    continue;
                }
                let px = origin_x + col * scale;
                let py = y + row as u32 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        let (cx, cy) = (px + dx, py + dy);
                        if cx < width && cy < height {
                            img.put_pixel(cx, cy, color);
                        }
                    }
                }
            }
        }
    }
}

pub fn timestamp_text(now: DateTime<Local>) -> String {
    now.format("%A %d %B %Y %I:%M:%S%p").to_string()
}

/// Status line in the top-left corner, wall-clock time along the bottom.
pub fn annotate(img: &mut RgbImage, status: &str, now: DateTime<Local>) {
    let line_height = GLYPH_SIZE * TEXT_SCALE;
    draw_text(img, MARGIN, MARGIN, status, TEXT_SCALE, TEXT_COLOR);

    let bottom = img.height().saturating_sub(MARGIN + line_height);
    draw_text(img, MARGIN, bottom, &timestamp_text(now), TEXT_SCALE, TEXT_COLOR);
}
