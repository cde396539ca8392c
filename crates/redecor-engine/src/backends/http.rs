use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::DynamicImage;
use redecor_contracts::catalog::SceneAnalysis;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    decode_image_base64, encode_png_base64, Detector, GenerativeBackend, InpaintRequest,
    DEFAULT_GUIDANCE_SCALE, DEFAULT_INFERENCE_STEPS,
};
use crate::error::truncate_text;
use crate::retry::HttpStatusError;

const DETECTOR_TASKS: [&str; 3] = ["object_detection", "segmentation", "room_classification"];

/// Remote scene analysis service.
pub struct HttpDetector {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl HttpDetector {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            http: HttpClient::new(),
        }
    }
}

#[async_trait]
impl Detector for HttpDetector {
    fn name(&self) -> &str {
        "detector"
    }

    async fn analyze(&self, image: &[u8]) -> Result<SceneAnalysis> {
        let endpoint = format!("{}/analyze", self.api_base);
        let format = image::guess_format(image)
            .ok()
            .and_then(|format| format.extensions_str().first().copied())
            .unwrap_or("jpeg");
        let payload = json!({
            "image": BASE64.encode(image),
            "format": format,
            "tasks": DETECTOR_TASKS,
        });

        let mut request = self.http.post(&endpoint).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.header(AUTHORIZATION, format!("Bearer {api_key}"));
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("detector request failed ({endpoint})"))?;
        let body = response_json_or_error("detector", response).await?;
        let analysis: SceneAnalysis =
            serde_json::from_value(body).context("detector returned an unexpected payload")?;
        info!(
            room_type = %analysis.room_type,
            objects = analysis.objects.len(),
            "scene analysis complete"
        );
        Ok(analysis)
    }
}

/// Remote diffusion inpainting service.
pub struct HttpInpaintBackend {
    api_base: String,
    http: HttpClient,
}

impl HttpInpaintBackend {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }
}

#[async_trait]
impl GenerativeBackend for HttpInpaintBackend {
    fn name(&self) -> &str {
        "inference"
    }

    async fn inpaint(&self, request: &InpaintRequest) -> Result<DynamicImage> {
        let endpoint = format!("{}/inpaint", self.api_base);
        let payload = json!({
            "image": encode_png_base64(&request.image)?,
            "mask": encode_png_base64(&DynamicImage::ImageLuma8(request.mask.clone()))?,
            "prompt": request.prompt,
            "negative_prompt": request.negative_prompt,
            "strength": request.strength,
            "guidance_scale": DEFAULT_GUIDANCE_SCALE,
            "num_inference_steps": DEFAULT_INFERENCE_STEPS,
        });
        debug!(endpoint = %endpoint, prompt = %request.prompt, "sending inpaint request");

        let response = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("inference request failed ({endpoint})"))?;
        let body = response_json_or_error("inference", response).await?;
        let image = body
            .get("image")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("inference response is missing an image"))?;
        decode_image_base64(image).context("inference returned an unreadable image")
    }
}

async fn response_json_or_error(service: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("{service} response body read failed"))?;
    if !status.is_success() {
        return Err(anyhow::Error::new(HttpStatusError {
            status: status.as_u16(),
            body: truncate_text(&body, 512),
        })
        .context(format!("{service} request was rejected")));
    }
    serde_json::from_str(&body).with_context(|| format!("{service} returned invalid JSON payload"))
}
