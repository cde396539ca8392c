mod dryrun;
mod fixture;
mod http;

use std::io::Cursor;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, GrayImage, ImageFormat};
use redecor_contracts::catalog::SceneAnalysis;

pub use dryrun::DryrunBackend;
pub use fixture::StaticDetector;
pub use http::{HttpDetector, HttpInpaintBackend};

pub const NEGATIVE_PROMPT: &str = "blurry, distorted, low quality, artifacts";
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
pub const DEFAULT_INFERENCE_STEPS: u32 = 50;

/// Finds labeled regions in a room photograph.
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;
    async fn analyze(&self, image: &[u8]) -> Result<SceneAnalysis>;
}

/// One mask-guided generation call. Retries re-send the identical request.
#[derive(Debug, Clone)]
pub struct InpaintRequest {
    pub image: DynamicImage,
    pub mask: GrayImage,
    pub prompt: String,
    pub negative_prompt: String,
    pub strength: f64,
}

impl InpaintRequest {
    pub fn new(image: DynamicImage, mask: GrayImage, prompt: impl Into<String>, strength: f64) -> Self {
        Self {
            image,
            mask,
            prompt: prompt.into(),
            negative_prompt: NEGATIVE_PROMPT.to_string(),
            strength: strength.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn inpaint(&self, request: &InpaintRequest) -> Result<DynamicImage>;
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(out.into_inner())
}

pub fn encode_png_base64(image: &DynamicImage) -> Result<String> {
    Ok(BASE64.encode(encode_png(image)?))
}

pub fn decode_image_base64(data: &str) -> Result<DynamicImage> {
    let payload = data
        .split_once(";base64,")
        .map(|(_, rest)| rest)
        .unwrap_or(data);
    let bytes = BASE64
        .decode(payload.trim())
        .context("image payload is not valid base64")?;
    image::load_from_memory(&bytes).context("image payload could not be decoded")
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, Rgb, RgbImage};

    use super::{decode_image_base64, encode_png_base64};

    #[test]
    fn base64_png_survives_data_url_prefix() -> anyhow::Result<()> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([10, 20, 30])));
        let encoded = encode_png_base64(&image)?;
        let decoded = decode_image_base64(&format!("data:image/png;base64,{encoded}"))?;
        assert_eq!(decoded.to_rgb8(), image.to_rgb8());
        Ok(())
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode_image_base64("not an image").is_err());
    }
}
