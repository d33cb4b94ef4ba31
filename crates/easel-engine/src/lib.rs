use std::collections::BTreeMap;
use std::env;
use std::io::Cursor;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub mod export;
pub mod proxy;
pub mod worker;

pub use worker::{QueueWorker, StartBlocked};

/// Opaque image payload returned by an adapter.
#[derive(Debug, Clone)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// Uniform blocking capability over one provider's wire protocol. Adapters
/// never orchestrate: one call, one image, errors reported as `Err` with a
/// provider-prefixed message.
pub trait ImageAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn requires_credential(&self) -> bool {
        true
    }

    fn generate(&self, prompt: &str, credential: &str, size: &str) -> Result<ImageBytes>;
}

/// Pure lookup table from provider id to adapter. Unknown ids surface as
/// `None` so callers can fail fast with an "unsupported provider" message.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Box<dyn ImageAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: ImageAdapter + 'static>(&mut self, adapter: A) {
        self.adapters
            .insert(adapter.name().to_string(), Box::new(adapter));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageAdapter> {
        self.adapters.get(name).map(|adapter| adapter.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

pub fn default_adapter_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(DryrunAdapter);
    registry.register(OpenAiAdapter::new());
    registry.register(StabilityAdapter::new());
    registry.register(FluxAdapter::new());
    registry
}

/// Offline adapter for tests and demos: a solid-color PNG whose color is a
/// SHA-256 of the prompt, so identical prompts render identically.
pub struct DryrunAdapter;

impl ImageAdapter for DryrunAdapter {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn requires_credential(&self) -> bool {
        false
    }

    fn generate(&self, prompt: &str, _credential: &str, size: &str) -> Result<ImageBytes> {
        let (width, height) = parse_dims(size);
        let (r, g, b) = color_from_prompt(prompt);
        let mut canvas = RgbImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Vec::new();
        canvas
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .context("dryrun PNG encode failed")?;
        Ok(ImageBytes {
            bytes,
            mime_type: Some("image/png".to_string()),
        })
    }
}

pub struct OpenAiAdapter {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env("OPENAI_API_BASE", "https://api.openai.com/v1"),
            model: env::var("OPENAI_IMAGE_MODEL")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "gpt-image-1".to_string()),
            http: HttpClient::new(),
        }
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(&self, prompt: &str, credential: &str, size: &str) -> Result<ImageBytes> {
        if credential.trim().is_empty() {
            bail!("OpenAI credential missing");
        }
        let endpoint = format!("{}/images/generations", self.api_base);
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "n": 1,
            "size": size,
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(credential.trim())
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let body = response_json_or_error("OpenAI", response)?;
        match openai_image_ref(&body)? {
            OpenAiImageRef::Inline(b64) => {
                let bytes = BASE64
                    .decode(b64.as_bytes())
                    .context("OpenAI image base64 decode failed")?;
                Ok(ImageBytes {
                    bytes,
                    mime_type: Some("image/png".to_string()),
                })
            }
            OpenAiImageRef::Url(url) => download_image(&self.http, "OpenAI", &url),
        }
    }
}

enum OpenAiImageRef {
    Inline(String),
    Url(String),
}

/// The single normalization point for OpenAI's image payload shape:
/// `data[0].b64_json` preferred, `data[0].url` accepted.
fn openai_image_ref(payload: &Value) -> Result<OpenAiImageRef> {
    let first = payload
        .get("data")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow::anyhow!("OpenAI response missing image data"))?;
    if let Some(b64) = first
        .get("b64_json")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return Ok(OpenAiImageRef::Inline(b64.to_string()));
    }
    if let Some(url) = first
        .get("url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return Ok(OpenAiImageRef::Url(url.to_string()));
    }
    bail!("OpenAI response missing both b64_json and url")
}

pub struct StabilityAdapter {
    api_base: String,
    http: HttpClient,
}

impl StabilityAdapter {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env("STABILITY_API_BASE", "https://api.stability.ai"),
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v2beta/stable-image/generate/core", self.api_base)
    }
}

impl Default for StabilityAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageAdapter for StabilityAdapter {
    fn name(&self) -> &str {
        "stability"
    }

    fn generate(&self, prompt: &str, credential: &str, size: &str) -> Result<ImageBytes> {
        if credential.trim().is_empty() {
            bail!("Stability credential missing");
        }
        let endpoint = self.endpoint();
        let form = reqwest::blocking::multipart::Form::new()
            .text("prompt", prompt.to_string())
            .text("output_format", "png".to_string())
            .text("aspect_ratio", aspect_ratio_from_size(size));
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(credential.trim())
            .header("Accept", "image/*")
            .multipart(form)
            .send()
            .with_context(|| format!("Stability request failed ({endpoint})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "Stability request failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        if content_type.starts_with("image/") {
            return Ok(ImageBytes {
                bytes: response
                    .bytes()
                    .context("failed reading Stability image bytes")?
                    .to_vec(),
                mime_type: Some(content_type),
            });
        }
        let payload: Value = response
            .json()
            .context("failed parsing Stability JSON response")?;
        stability_image_from_json(&payload)
    }
}

/// Stability's JSON fallback shape: base64 under `image` or
/// `artifacts[0].base64`.
fn stability_image_from_json(payload: &Value) -> Result<ImageBytes> {
    let image_b64 = payload
        .get("image")
        .or_else(|| {
            payload
                .get("artifacts")
                .and_then(Value::as_array)
                .and_then(|rows| rows.first())
                .and_then(Value::as_object)
                .and_then(|row| row.get("base64"))
        })
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Stability JSON response missing image bytes"))?;
    let bytes = BASE64
        .decode(image_b64.as_bytes())
        .context("Stability image base64 decode failed")?;
    Ok(ImageBytes {
        bytes,
        mime_type: Some("image/png".to_string()),
    })
}

pub struct FluxAdapter {
    api_base: String,
    model: String,
    http: HttpClient,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl FluxAdapter {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env("BFL_API_BASE", "https://api.bfl.ml/v1"),
            model: env::var("BFL_IMAGE_MODEL")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "flux-pro-1.1".to_string()),
            http: HttpClient::new(),
            poll_interval: Duration::from_millis(500),
            poll_timeout: Duration::from_secs(120),
        }
    }

    fn poll_result(&self, task_id: &str, credential: &str) -> Result<Value> {
        let endpoint = format!("{}/get_result", self.api_base);
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(&endpoint)
                .query(&[("id", task_id)])
                .header("x-key", credential)
                .send()
                .with_context(|| format!("Flux poll request failed ({endpoint})"))?;
            let payload = response_json_or_error("Flux poll", response)?;
            let status = payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match status {
                "Ready" => return Ok(payload),
                "Pending" | "Request Moderated" | "Queued" => {}
                other if other.is_empty() => bail!("Flux poll response missing status"),
                other => bail!("Flux generation failed with status '{other}'"),
            }
            if started.elapsed() >= self.poll_timeout {
                bail!(
                    "Flux polling timed out after {:.0}s",
                    self.poll_timeout.as_secs_f64()
                );
            }
            thread::sleep(self.poll_interval);
        }
    }
}

impl Default for FluxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageAdapter for FluxAdapter {
    fn name(&self) -> &str {
        "flux"
    }

    fn generate(&self, prompt: &str, credential: &str, size: &str) -> Result<ImageBytes> {
        let credential = credential.trim();
        if credential.is_empty() {
            bail!("Flux credential missing");
        }
        let (width, height) = parse_dims(size);
        let endpoint = format!("{}/{}", self.api_base, self.model);
        let response = self
            .http
            .post(&endpoint)
            .header("x-key", credential)
            .json(&json!({
                "prompt": prompt,
                "width": width,
                "height": height,
            }))
            .send()
            .with_context(|| format!("Flux request failed ({endpoint})"))?;
        let submitted = response_json_or_error("Flux", response)?;
        let task_id = submitted
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Flux response missing task id"))?;

        let result = self.poll_result(task_id, credential)?;
        let sample_url = flux_sample_url(&result)
            .ok_or_else(|| anyhow::anyhow!("Flux result missing sample URL"))?;
        download_image(&self.http, "Flux", &sample_url)
    }
}

fn flux_sample_url(payload: &Value) -> Option<String> {
    payload
        .get("result")
        .and_then(Value::as_object)
        .and_then(|result| result.get("sample"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| value.starts_with("http"))
        .map(str::to_string)
}

fn api_base_from_env(key: &str, fallback: &str) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn download_image(http: &HttpClient, provider: &str, url: &str) -> Result<ImageBytes> {
    let response = http
        .get(url)
        .send()
        .with_context(|| format!("failed downloading {provider} image ({url})"))?;
    if !response.status().is_success() {
        let code = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        bail!(
            "{provider} image download failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .with_context(|| format!("failed reading {provider} image bytes"))?
        .to_vec();
    Ok(ImageBytes { bytes, mime_type })
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body unreadable"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({}): {}",
            status.as_u16(),
            truncate_text(&body, 512)
        );
    }
    if body.trim().is_empty() {
        bail!("{provider} returned an empty response");
    }
    serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned non-JSON: {}", truncate_text(&body, 256)))
}

pub(crate) fn parse_dims(size: &str) -> (u32, u32) {
    let mut parts = size.trim().split(['x', 'X']);
    let width = parts.next().and_then(|value| value.trim().parse().ok());
    let height = parts.next().and_then(|value| value.trim().parse().ok());
    match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => (1024, 1024),
    }
}

fn aspect_ratio_from_size(size: &str) -> String {
    let (width, height) = parse_dims(size);
    let ratio = width as f64 / height as f64;
    let candidates = [
        ("1:1", 1.0),
        ("16:9", 16.0 / 9.0),
        ("9:16", 9.0 / 16.0),
        ("3:2", 3.0 / 2.0),
        ("2:3", 2.0 / 3.0),
        ("4:5", 4.0 / 5.0),
        ("5:4", 5.0 / 4.0),
    ];
    let mut best = "1:1";
    let mut best_delta = f64::MAX;
    for (name, value) in candidates {
        let delta = (ratio - value).abs();
        if delta < best_delta {
            best_delta = delta;
            best = name;
        }
    }
    best.to_string()
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let truncated: String = value.chars().take(max_chars).collect();
    format!("{truncated}…")
}
