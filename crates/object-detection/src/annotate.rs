//! Draw detection boxes onto a copy of an image

use crate::Detection;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

const BOX_THICKNESS: u32 = 2;

/// Per-class box colours, cycled by class id
const PALETTE: &[[u8; 3]] = &[
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
    [44, 153, 168],
    [0, 194, 255],
];

/// Colour used for a class id
#[must_use]
pub fn class_color(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

/// Return a copy of `image` with every detection outlined
#[must_use]
pub fn annotate(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut canvas = image.clone();
    for detection in detections {
        let color = class_color(detection.class_id);
        for inset in 0..BOX_THICKNESS {
            if let Some(rect) = inset_rect(detection, inset) {
                draw_hollow_rect_mut(&mut canvas, rect, color);
            }
        }
    }
    canvas
}

/// Box outline shrunk by `inset` pixels, or `None` once it collapses
fn inset_rect(detection: &Detection, inset: u32) -> Option<Rect> {
    let x = detection.bbox.x1.round() as i32 + inset as i32;
    let y = detection.bbox.y1.round() as i32 + inset as i32;
    let width = detection.bbox.width().round() as i64 - 2 * i64::from(inset);
    let height = detection.bbox.height().round() as i64 - 2 * i64::from(inset);
    if width <= 0 || height <= 0 {
        return None;
    }
    Some(Rect::at(x, y).of_size(width as u32, height as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    fn detection(bbox: BoundingBox) -> Detection {
        Detection {
            class_id: 0,
            class_name: "crack".to_string(),
            confidence: 0.9,
            bbox,
        }
    }

    #[test]
    fn test_annotate_draws_outline_only() {
        let img = RgbImage::from_pixel(50, 50, Rgb([0, 0, 0]));
        let out = annotate(&img, &[detection(BoundingBox::new(10.0, 10.0, 30.0, 30.0))]);

        assert_eq!(*out.get_pixel(10, 10), class_color(0));
        assert_eq!(*out.get_pixel(11, 20), class_color(0));
        assert_eq!(*out.get_pixel(20, 20), Rgb([0, 0, 0]));
        // Source image untouched
        assert_eq!(*img.get_pixel(10, 10), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_annotate_skips_degenerate_boxes() {
        let img = RgbImage::from_pixel(10, 10, Rgb([0, 0, 0]));
        let out = annotate(&img, &[detection(BoundingBox::new(5.0, 5.0, 5.2, 9.0))]);
        assert_eq!(out, img);
    }

    #[test]
    fn test_class_color_cycles() {
        assert_eq!(class_color(0), class_color(PALETTE.len() as u32));
        assert_ne!(class_color(0), class_color(1));
    }
}
