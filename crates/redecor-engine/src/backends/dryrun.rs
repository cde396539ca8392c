use anyhow::{bail, Result};
use async_trait::async_trait;
use image::{DynamicImage, Rgb};
use sha2::{Digest, Sha256};

use super::{GenerativeBackend, InpaintRequest};

/// Local stand-in for the inpainting service.
///
/// Masked pixels are blended toward a color derived from the prompt, weighted
/// by mask coverage and strength. Same request, same output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunBackend;

#[async_trait]
impl GenerativeBackend for DryrunBackend {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn inpaint(&self, request: &InpaintRequest) -> Result<DynamicImage> {
        let mut image = request.image.to_rgb8();
        if image.dimensions() != request.mask.dimensions() {
            bail!(
                "mask is {:?} but image is {:?}",
                request.mask.dimensions(),
                image.dimensions()
            );
        }

        let (r, g, b) = color_from_prompt(&request.prompt);
        let tint = [r, g, b];
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let coverage = f64::from(request.mask.get_pixel(x, y)[0]) / 255.0;
            let weight = coverage * request.strength;
            if weight <= 0.0 {
                continue;
            }
            let blended: [u8; 3] = std::array::from_fn(|idx| {
                let source = f64::from(pixel[idx]);
                let target = f64::from(tint[idx]);
                (source + (target - source) * weight).round().clamp(0.0, 255.0) as u8
            });
            *pixel = Rgb(blended);
        }
        Ok(DynamicImage::ImageRgb8(image))
    }
}

pub(crate) fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
