//! Per-frame compositing orchestration
//!
//! For every admitted frame: downscale to the processing resolution, run the
//! segmentation engine, extract and scale the mask, feather it, apply it to
//! the foreground with destination-in semantics, then draw background plus
//! masked foreground in one synchronous step and present the finished
//! composite atomically.

use crate::{
    config::PipelineConfig,
    error::Result,
    feather::feather,
    inference::SegmentationEngine,
    mask::extract_mask,
    types::{Frame, Mask, OutputSurface},
};
use image::{imageops, Rgba, RgbaImage};
use instant::Instant;
use std::sync::Arc;
use tracing::debug_span;

/// Orchestrates inference, mask processing, and the layered draw for each
/// frame. Owns the output surface after transfer from the host.
pub struct FrameCompositor {
    processing_width: u32,
    processing_height: u32,
    output_width: u32,
    output_height: u32,
    feather_radius: u32,
    person_index: usize,
    surface: OutputSurface,
    /// Foreground scratch, reallocated only when the output resolution
    /// changes, not every frame
    foreground: RgbaImage,
    /// Monotonic clock for video-mode inference timestamps
    clock: Instant,
}

impl FrameCompositor {
    #[must_use]
    pub fn new(config: &PipelineConfig, surface: OutputSurface, person_index: usize) -> Self {
        let output_width = surface.width();
        let output_height = surface.height();
        Self {
            processing_width: config.processing_width,
            processing_height: config.processing_height,
            output_width,
            output_height,
            feather_radius: config.feather_radius,
            person_index,
            surface,
            foreground: RgbaImage::new(output_width, output_height),
            clock: Instant::now(),
        }
    }

    /// Output surface width
    #[must_use]
    pub fn output_width(&self) -> u32 {
        self.output_width
    }

    /// Output surface height
    #[must_use]
    pub fn output_height(&self) -> u32 {
        self.output_height
    }

    /// Milliseconds since the compositor was created; monotonic, as the
    /// video-mode inference contract requires
    #[must_use]
    pub fn timestamp_ms(&self) -> f64 {
        self.clock.elapsed().as_secs_f64() * 1000.0
    }

    /// Composite one frame against the active background into the output
    /// surface.
    ///
    /// The frame is consumed and released exactly once on every path. On
    /// failure the surface still receives a valid visible image (background
    /// or white plus the raw unmasked frame) and the error is returned for
    /// observability only.
    ///
    /// # Errors
    /// Inference or mask processing failures; the surface is never left
    /// blank or stale.
    pub fn composite(
        &mut self,
        frame: Frame,
        engine: &mut dyn SegmentationEngine,
        background: Option<&Arc<RgbaImage>>,
    ) -> Result<()> {
        let span = debug_span!("composite", width = frame.width(), height = frame.height());
        let _guard = span.enter();

        let timestamp_ms = self.timestamp_ms();
        match self.render(&frame, engine, background, timestamp_ms) {
            Ok(composite) => {
                self.surface.present(composite);
                Ok(())
            },
            Err(e) => {
                log::warn!("frame processing failed, drawing degraded fallback: {e}");
                let fallback = self.degraded_fallback(&frame, background);
                self.surface.present(fallback);
                Err(e)
            },
        }
        // frame drops here, releasing its handle on success and error alike
    }

    fn render(
        &mut self,
        frame: &Frame,
        engine: &mut dyn SegmentationEngine,
        background: Option<&Arc<RgbaImage>>,
        timestamp_ms: f64,
    ) -> Result<RgbaImage> {
        // Bound inference cost independent of camera resolution
        let processed = imageops::resize(
            frame.image(),
            self.processing_width,
            self.processing_height,
            imageops::FilterType::Triangle,
        );
        let result = engine.segment_for_video(&processed, timestamp_ms)?;

        let mask = extract_mask(
            result,
            self.person_index,
            self.output_width,
            self.output_height,
        );

        self.ensure_foreground_size();
        draw_scaled(frame.image(), &mut self.foreground);

        if let Some(mask) = mask {
            let scaled = mask.scaled(self.output_width, self.output_height);
            let feathered = feather(&scaled, self.feather_radius);
            apply_destination_in(&mut self.foreground, &feathered);
        }
        // No mask: keep the frame unmasked so the output stays visible

        // Base plus cutout drawn in one synchronous step before yielding
        let mut composite = self.base_layer(background);
        imageops::overlay(&mut composite, &self.foreground, 0, 0);
        Ok(composite)
    }

    /// Best-available background (or white) plus the raw unmasked frame
    fn degraded_fallback(
        &mut self,
        frame: &Frame,
        background: Option<&Arc<RgbaImage>>,
    ) -> RgbaImage {
        let mut composite = self.base_layer(background);
        self.ensure_foreground_size();
        draw_scaled(frame.image(), &mut self.foreground);
        imageops::overlay(&mut composite, &self.foreground, 0, 0);
        composite
    }

    fn base_layer(&self, background: Option<&Arc<RgbaImage>>) -> RgbaImage {
        match background {
            Some(bitmap)
                if bitmap.width() == self.output_width
                    && bitmap.height() == self.output_height =>
            {
                RgbaImage::clone(bitmap)
            },
            Some(bitmap) => imageops::resize(
                bitmap.as_ref(),
                self.output_width,
                self.output_height,
                imageops::FilterType::Triangle,
            ),
            None => RgbaImage::from_pixel(
                self.output_width,
                self.output_height,
                Rgba([255, 255, 255, 255]),
            ),
        }
    }

    fn ensure_foreground_size(&mut self) {
        if self.foreground.width() != self.output_width
            || self.foreground.height() != self.output_height
        {
            self.foreground = RgbaImage::new(self.output_width, self.output_height);
        }
    }
}

impl std::fmt::Debug for FrameCompositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCompositor")
            .field("processing", &(self.processing_width, self.processing_height))
            .field("output", &(self.output_width, self.output_height))
            .field("feather_radius", &self.feather_radius)
            .field("person_index", &self.person_index)
            .finish_non_exhaustive()
    }
}

/// Draw `src` into `dst` scaled to fill it (bilinear)
fn draw_scaled(src: &RgbaImage, dst: &mut RgbaImage) {
    if src.dimensions() == dst.dimensions() {
        dst.clone_from(src);
        return;
    }
    let (sw, sh) = src.dimensions();
    let (dw, dh) = dst.dimensions();
    if sw == 0 || sh == 0 {
        return;
    }
    for y in 0..dh {
        let fy = ((y as f32 + 0.5) * sh as f32 / dh as f32 - 0.5).clamp(0.0, sh as f32 - 1.0);
        let y0 = fy.floor() as u32;
        let y1 = (y0 + 1).min(sh - 1);
        let wy = fy - y0 as f32;
        for x in 0..dw {
            let fx = ((x as f32 + 0.5) * sw as f32 / dw as f32 - 0.5).clamp(0.0, sw as f32 - 1.0);
            let x0 = fx.floor() as u32;
            let x1 = (x0 + 1).min(sw - 1);
            let wx = fx - x0 as f32;

            let p00 = src.get_pixel(x0, y0);
            let p10 = src.get_pixel(x1, y0);
            let p01 = src.get_pixel(x0, y1);
            let p11 = src.get_pixel(x1, y1);

            let mut out = [0u8; 4];
            for c in 0..4 {
                let top = f32::from(p00[c]) * (1.0 - wx) + f32::from(p10[c]) * wx;
                let bottom = f32::from(p01[c]) * (1.0 - wx) + f32::from(p11[c]) * wx;
                out[c] = (top * (1.0 - wy) + bottom * wy).round() as u8;
            }
            dst.put_pixel(x, y, Rgba(out));
        }
    }
}

/// Destination-in: keep destination pixels only where the mask is opaque,
/// scaled by the mask alpha. Color channels are untouched.
fn apply_destination_in(surface: &mut RgbaImage, mask: &Mask) {
    debug_assert_eq!(surface.dimensions(), (mask.width(), mask.height()));
    for (pixel, (_, _, mask_pixel)) in surface
        .pixels_mut()
        .zip(mask.image().enumerate_pixels())
    {
        pixel[3] = ((u32::from(pixel[3]) * u32::from(mask_pixel[3]) + 127) / 255) as u8;
    }
}
