//! Mask extraction from raw segmentation engine output
//!
//! Engines report masks in several shapes (ready-made bitmap, confidence
//! floats, category bytes). This module normalizes all of them into the
//! single [`Mask`] representation the compositor consumes.

use crate::types::{Mask, MaskData, SegmentationResult};

/// Class index used when no label matches a person-like name
pub const DEFAULT_PERSON_INDEX: usize = 1;

/// Resolve the person class index from the engine's label list.
///
/// Scans for the first label containing "person", "selfie", or "human"
/// (case-insensitive), defaulting to [`DEFAULT_PERSON_INDEX`]. Resolved once
/// per engine instance and stable for its lifetime.
#[must_use]
pub fn resolve_person_index(labels: &[String]) -> usize {
    labels
        .iter()
        .position(|label| {
            let label = label.to_lowercase();
            label.contains("person") || label.contains("selfie") || label.contains("human")
        })
        .unwrap_or(DEFAULT_PERSON_INDEX)
}

/// Convert a segmentation result into an alpha mask.
///
/// - Bitmap masks pass through unchanged.
/// - Confidence scores map to soft alpha: `round(clamp(score * 255, 0, 255))`.
/// - Category labels map to binary alpha: 255 where the class equals
///   `person_index`, 0 elsewhere.
///
/// Returns `None` when no mask data of a recognized shape is present; the
/// caller must still produce a visible frame.
#[must_use]
pub fn extract_mask(
    result: SegmentationResult,
    person_index: usize,
    fallback_width: u32,
    fallback_height: u32,
) -> Option<Mask> {
    let (result_w, result_h) = (result.width, result.height);
    let dims = |w: u32, h: u32| {
        if w > 0 && h > 0 {
            (w, h)
        } else if result_w > 0 && result_h > 0 {
            (result_w, result_h)
        } else {
            (fallback_width, fallback_height)
        }
    };

    match result.mask? {
        MaskData::Bitmap(image) => Some(Mask::from_image(image)),
        MaskData::Confidence {
            width,
            height,
            scores,
        } => {
            let (w, h) = dims(width, height);
            if scores.len() != (w as usize) * (h as usize) {
                return None;
            }
            let alpha: Vec<u8> = scores
                .iter()
                .map(|score| (score * 255.0).round().clamp(0.0, 255.0) as u8)
                .collect();
            Mask::from_alpha(w, h, &alpha).ok()
        },
        MaskData::Category {
            width,
            height,
            classes,
        } => {
            let (w, h) = dims(width, height);
            if classes.len() != (w as usize) * (h as usize) {
                return None;
            }
            let alpha: Vec<u8> = classes
                .iter()
                .map(|&class| if usize::from(class) == person_index { 255 } else { 0 })
                .collect();
            Mask::from_alpha(w, h, &alpha).ok()
        },
        MaskData::CategoryF32 {
            width,
            height,
            classes,
        } => {
            let (w, h) = dims(width, height);
            if classes.len() != (w as usize) * (h as usize) {
                return None;
            }
            let alpha: Vec<u8> = classes
                .iter()
                .map(|&class| {
                    if class.round() as i64 == person_index as i64 {
                        255
                    } else {
                        0
                    }
                })
                .collect();
            Mask::from_alpha(w, h, &alpha).ok()
        },
    }
}
