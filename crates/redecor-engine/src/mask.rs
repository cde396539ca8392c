use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use redecor_contracts::catalog::MaskRef;
use redecor_contracts::plan::EditOperation;
use tracing::warn;

use crate::backends::decode_image_base64;
use crate::error::{EngineError, EngineResult};

/// Every pixel selected.
pub fn full_mask(width: u32, height: u32) -> GrayImage {
    GrayImage::from_pixel(width, height, Luma([255]))
}

/// Selection mask for one operation at the given image size.
///
/// Anything that cannot be turned into pixels locally falls back to the whole
/// image, so a missing mask never stops an edit.
pub fn resolve_mask(operation: &EditOperation, (width, height): (u32, u32)) -> GrayImage {
    match &operation.resolved_mask {
        Some(MaskRef::Inline(data)) => match decode_image_base64(data) {
            Ok(decoded) => {
                let luma = decoded.to_luma8();
                if luma.dimensions() == (width, height) {
                    luma
                } else {
                    imageops::resize(&luma, width, height, FilterType::Lanczos3)
                }
            }
            Err(err) => {
                warn!(
                    target_label = %operation.target_label,
                    error = %format!("{err:#}"),
                    "mask could not be decoded, editing the whole image"
                );
                full_mask(width, height)
            }
        },
        Some(MaskRef::Stored(id)) => {
            warn!(
                target_label = %operation.target_label,
                mask_id = %id,
                "stored mask is not available locally, editing the whole image"
            );
            full_mask(width, height)
        }
        None => {
            warn!(
                target_label = %operation.target_label,
                "no mask for target, editing the whole image"
            );
            full_mask(width, height)
        }
    }
}

/// Union of masks, sized to the first one.
pub fn combine_masks(masks: &[GrayImage]) -> EngineResult<GrayImage> {
    let Some((first, rest)) = masks.split_first() else {
        return Err(EngineError::EmptyInput);
    };
    let (width, height) = first.dimensions();
    let mut combined = first.clone();
    for mask in rest {
        let resized;
        let mask = if mask.dimensions() == (width, height) {
            mask
        } else {
            resized = imageops::resize(mask, width, height, FilterType::Lanczos3);
            &resized
        };
        for (out, other) in combined.pixels_mut().zip(mask.pixels()) {
            out[0] = out[0].max(other[0]);
        }
    }
    Ok(combined)
}
