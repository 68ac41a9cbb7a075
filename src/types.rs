//! Core data types shared across the pipeline
//!
//! A [`Frame`] is an exclusively owned bitmap pulled from the live video
//! source. Frames carry an optional release hook that runs exactly once when
//! the frame is dropped, mirroring the explicit close the decode resource
//! requires on every exit path.

use crate::error::{BgSwapError, Result};
use image::{imageops, Rgba, RgbaImage};
use std::sync::{Arc, PoisonError, RwLock};

/// A single video frame, exclusively owned by whichever pipeline stage
/// currently holds it.
pub struct Frame {
    image: RgbaImage,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl Frame {
    /// Wrap a decoded bitmap into a frame
    #[must_use]
    pub fn new(image: RgbaImage) -> Self {
        Self {
            image,
            on_release: None,
        }
    }

    /// Wrap a decoded bitmap with a release hook invoked exactly once when
    /// the frame is dropped, on success and error paths alike.
    #[must_use]
    pub fn with_release_hook<F>(image: RgbaImage, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            image,
            on_release: Some(Box::new(hook)),
        }
    }

    /// Frame width in pixels
    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Frame height in pixels
    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Borrow the underlying bitmap
    #[must_use]
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish_non_exhaustive()
    }
}

/// Raw mask data produced by a segmentation engine for one frame.
///
/// The representation is fixed per backend at initialization time; the
/// extractor still matches per call so engines that vary their output shape
/// at runtime keep working.
#[derive(Debug, Clone)]
pub enum MaskData {
    /// Ready-made alpha bitmap, passed through unchanged
    Bitmap(RgbaImage),
    /// Per-pixel confidence scores for the person class, row-major
    Confidence {
        width: u32,
        height: u32,
        scores: Vec<f32>,
    },
    /// Per-pixel integer category labels, row-major
    Category {
        width: u32,
        height: u32,
        classes: Vec<u8>,
    },
    /// Category labels delivered as floats (some engines round-trip the
    /// class index through a float tensor)
    CategoryF32 {
        width: u32,
        height: u32,
        classes: Vec<f32>,
    },
}

/// Engine output for a single frame; consumed within one processing cycle.
#[derive(Debug, Clone)]
pub struct SegmentationResult {
    /// Mask data, if the engine produced any recognized shape
    pub mask: Option<MaskData>,
    /// Engine output width, used as a fallback when the mask data carries
    /// no dimensions of its own
    pub width: u32,
    /// Engine output height
    pub height: u32,
}

/// A single-channel alpha matte stored as an RGBA image.
///
/// RGB is opaque white; only the alpha channel carries the matte. 255 is
/// fully foreground. Masks are produced fresh each frame and never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    image: RgbaImage,
}

impl Mask {
    /// Build a mask from a row-major alpha buffer
    ///
    /// # Errors
    /// Returns [`BgSwapError::Processing`] if the buffer length does not
    /// match `width * height`.
    pub fn from_alpha(width: u32, height: u32, alpha: &[u8]) -> Result<Self> {
        if alpha.len() != (width as usize) * (height as usize) {
            return Err(BgSwapError::processing(format!(
                "alpha buffer length {} does not match {}x{}",
                alpha.len(),
                width,
                height
            )));
        }
        let mut image = RgbaImage::new(width, height);
        for (i, pixel) in image.pixels_mut().enumerate() {
            *pixel = Rgba([255, 255, 255, alpha[i]]);
        }
        Ok(Self { image })
    }

    /// Adopt an existing RGBA image as a mask (bitmap pass-through)
    #[must_use]
    pub fn from_image(image: RgbaImage) -> Self {
        Self { image }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Alpha sample at (x, y)
    #[must_use]
    pub fn alpha(&self, x: u32, y: u32) -> u8 {
        self.image.get_pixel(x, y)[3]
    }

    /// Borrow the underlying image
    #[must_use]
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Scale the mask to a new resolution (bilinear)
    #[must_use]
    pub fn scaled(&self, width: u32, height: u32) -> Self {
        if width == self.width() && height == self.height() {
            return self.clone();
        }
        Self {
            image: imageops::resize(&self.image, width, height, imageops::FilterType::Triangle),
        }
    }
}

/// Writable side of the shared output surface, owned by the processing
/// worker after transfer.
///
/// Composites are built in a private back buffer and swapped in with a
/// single [`present`](OutputSurface::present) call, so readers never observe
/// a half-drawn frame.
pub struct OutputSurface {
    width: u32,
    height: u32,
    slot: Arc<RwLock<RgbaImage>>,
}

/// Read-only handle the host keeps after transferring the surface into the
/// worker.
#[derive(Clone)]
pub struct SurfaceReader {
    slot: Arc<RwLock<RgbaImage>>,
}

impl OutputSurface {
    /// Create a surface and its paired reader. The surface starts blank
    /// (fully transparent) until the first composite is presented.
    #[must_use]
    pub fn new(width: u32, height: u32) -> (Self, SurfaceReader) {
        let slot = Arc::new(RwLock::new(RgbaImage::new(width, height)));
        let reader = SurfaceReader { slot: slot.clone() };
        (
            Self {
                width,
                height,
                slot,
            },
            reader,
        )
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Atomically replace the visible composite with a completed one.
    pub fn present(&mut self, composite: RgbaImage) {
        let mut slot = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = composite;
    }
}

impl std::fmt::Debug for OutputSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSurface")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl SurfaceReader {
    /// Clone the most recently presented composite
    #[must_use]
    pub fn snapshot(&self) -> RgbaImage {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_frame_release_hook_runs_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let frame = Frame::with_release_hook(RgbaImage::new(4, 4), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(frame);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mask_from_alpha_validates_length() {
        assert!(Mask::from_alpha(4, 4, &[255; 16]).is_ok());
        assert!(Mask::from_alpha(4, 4, &[255; 15]).is_err());
    }

    #[test]
    fn test_mask_rgb_is_opaque_white() {
        let mask = Mask::from_alpha(2, 2, &[0, 64, 128, 255]).unwrap();
        for (_, _, pixel) in mask.image().enumerate_pixels() {
            assert_eq!(&pixel.0[..3], &[255, 255, 255]);
        }
        assert_eq!(mask.alpha(0, 0), 0);
        assert_eq!(mask.alpha(1, 1), 255);
    }

    #[test]
    fn test_mask_scaled_same_size_is_identity() {
        let mask = Mask::from_alpha(4, 4, &[200; 16]).unwrap();
        assert_eq!(mask.scaled(4, 4), mask);
        let up = mask.scaled(8, 8);
        assert_eq!(up.width(), 8);
        assert_eq!(up.height(), 8);
    }

    #[test]
    fn test_surface_present_and_snapshot() {
        let (mut surface, reader) = OutputSurface::new(2, 2);
        let mut composite = RgbaImage::new(2, 2);
        composite.put_pixel(0, 0, Rgba([10, 20, 30, 255]));
        surface.present(composite.clone());
        assert_eq!(reader.snapshot(), composite);
    }
}
