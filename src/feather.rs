//! Mask edge feathering
//!
//! Softens the near-binary segmentation matte with a box mean restricted to
//! the alpha channel, so composites do not show hard cutout edges. Color
//! channels pass through untouched, which keeps destination-in compositing
//! behavior intact downstream.

use crate::types::Mask;
use image::{Rgba, RgbaImage};

/// Feather a mask by `radius` pixels.
///
/// Each output alpha is the mean of all alpha values in a `(2r+1)x(2r+1)`
/// neighborhood, clipped at the image bounds (edge pixels average over fewer
/// samples; no wrapping or zero padding). Radius 0 is the identity.
///
/// Degrades to returning the original mask unchanged rather than failing the
/// frame when the blur cannot run (zero-sized mask).
#[must_use]
pub fn feather(mask: &Mask, radius: u32) -> Mask {
    if radius == 0 {
        return mask.clone();
    }
    match feather_alpha(mask, radius) {
        Some(feathered) => feathered,
        None => {
            log::warn!("feather failed, returning unfiltered mask");
            mask.clone()
        },
    }
}

fn feather_alpha(mask: &Mask, radius: u32) -> Option<Mask> {
    let width = mask.width();
    let height = mask.height();
    if width == 0 || height == 0 {
        return None;
    }

    let source = mask.image();
    let r = i64::from(radius);
    let mut output = RgbaImage::new(width, height);

    for y in 0..height {
        for x in 0..width {
            let mut sum: u32 = 0;
            let mut count: u32 = 0;

            let y0 = (i64::from(y) - r).max(0);
            let y1 = (i64::from(y) + r).min(i64::from(height) - 1);
            let x0 = (i64::from(x) - r).max(0);
            let x1 = (i64::from(x) + r).min(i64::from(width) - 1);

            for ny in y0..=y1 {
                for nx in x0..=x1 {
                    sum += u32::from(source.get_pixel(nx as u32, ny as u32)[3]);
                    count += 1;
                }
            }

            let src = source.get_pixel(x, y);
            let averaged = ((f64::from(sum) / f64::from(count)).round()) as u8;
            output.put_pixel(x, y, Rgba([src[0], src[1], src[2], averaged]));
        }
    }

    Some(Mask::from_image(output))
}
