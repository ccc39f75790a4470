//! Approximate token counts. Estimates are padded by callers with
//! [`crate::TOKEN_ESTIMATE_PADDING_PCT`] before comparing against model limits.

use crate::types::ImageDetail;

const CHARS_PER_TOKEN: usize = 4;
const IMAGE_BYTES_PER_TOKEN: usize = 750;

const IMAGE_BOX: f64 = 2048.0;
const IMAGE_SHORT_SIDE: f64 = 768.0;
const IMAGE_TILE: f64 = 512.0;
const IMAGE_BASE_TOKENS: usize = 85;
const IMAGE_TILE_TOKENS: usize = 170;

pub fn estimate_text_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

pub fn estimate_byte_tokens(len: usize) -> usize {
    len.div_ceil(CHARS_PER_TOKEN)
}

pub fn with_padding(tokens: usize) -> usize {
    tokens + (tokens * crate::TOKEN_ESTIMATE_PADDING_PCT).div_ceil(100)
}

/// Token cost of an image given its pixel dimensions.
pub fn estimate_image_tokens(width: u32, height: u32, detail: ImageDetail) -> usize {
    if detail == ImageDetail::Low {
        return IMAGE_BASE_TOKENS;
    }
    let mut w = f64::from(width.max(1));
    let mut h = f64::from(height.max(1));
    if w > IMAGE_BOX || h > IMAGE_BOX {
        let scale = (IMAGE_BOX / w).min(IMAGE_BOX / h);
        w *= scale;
        h *= scale;
    }
    let short = w.min(h);
    if short > IMAGE_SHORT_SIDE {
        let scale = IMAGE_SHORT_SIDE / short;
        w *= scale;
        h *= scale;
    }
    let tiles_w = (w / IMAGE_TILE).ceil() as usize;
    let tiles_h = (h / IMAGE_TILE).ceil() as usize;
    IMAGE_BASE_TOKENS + IMAGE_TILE_TOKENS * tiles_w * tiles_h
}

/// Reads dimensions from the image header without decoding pixels.
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Image estimate from raw bytes; unreadable headers fall back to a size heuristic.
pub fn estimate_image_bytes_tokens(bytes: &[u8], detail: ImageDetail) -> usize {
    match image_dimensions(bytes) {
        Some((w, h)) => estimate_image_tokens(w, h, detail),
        None => bytes.len().div_ceil(IMAGE_BYTES_PER_TOKEN).max(IMAGE_BASE_TOKENS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_estimate_rounds_up() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abc"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
    }

    #[test]
    fn low_detail_is_flat() {
        assert_eq!(estimate_image_tokens(4000, 4000, ImageDetail::Low), 85);
    }

    #[test]
    fn high_detail_scales_into_box_then_short_side() {
        // 4096x2048 -> 2048x1024 -> 1536x768 -> 3x2 tiles
        assert_eq!(
            estimate_image_tokens(4096, 2048, ImageDetail::High),
            85 + 170 * 6
        );
        // 1024x1024 -> 768x768 -> 2x2 tiles
        assert_eq!(
            estimate_image_tokens(1024, 1024, ImageDetail::High),
            85 + 170 * 4
        );
        // small images are not upscaled
        assert_eq!(estimate_image_tokens(100, 100, ImageDetail::High), 85 + 170);
    }

    #[test]
    fn reads_png_header_dimensions() {
        let mut png = Vec::new();
        let img = image::RgbImage::new(3, 2);
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .expect("encode png");
        assert_eq!(image_dimensions(&png), Some((3, 2)));
        assert_eq!(estimate_image_bytes_tokens(&png, ImageDetail::High), 255);
    }

    #[test]
    fn garbage_bytes_fall_back_to_size() {
        let bytes = vec![0_u8; 7500 * 20];
        assert_eq!(estimate_image_bytes_tokens(&bytes, ImageDetail::High), 200);
    }

    #[test]
    fn padding_adds_ten_percent() {
        assert_eq!(with_padding(100), 110);
    }
}
