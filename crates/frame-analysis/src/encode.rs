//! In-memory image encoding for HTTP transport
//!
//! JPEG goes through mozjpeg (SIMD-optimized, smaller output at the same
//! quality); PNG uses the `image` crate.

use image::{ImageFormat, RgbImage};
use std::io::Cursor;

/// Default quality for transported frames
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Encode an RGB image as JPEG bytes
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> std::io::Result<Vec<u8>> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Cannot encode an empty image",
        ));
    }

    let mut comp = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
    comp.set_size(width as usize, height as usize);
    comp.set_quality(f32::from(quality.clamp(1, 100)));

    let capacity = (width as usize * height as usize) / 4;
    let mut comp_started = comp.start_compress(Vec::with_capacity(capacity))?;
    comp_started.write_scanlines(image.as_raw())?;
    comp_started.finish()
}

/// Encode an RGB image as PNG bytes
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}
