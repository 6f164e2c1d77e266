//! # Image Synthesis Providers
//!
//! The [`ImageSynthesisProvider`] trait is the narrow contract the pipeline
//! submits prompts through. [`ReplicateProvider`] implements it against the
//! Replicate predictions API for both the primary (Flux) and the fallback
//! (SDXL) model, translating aspect ratios into each model's vocabulary and
//! mapping vendor payloads into typed [`ProviderError`]s.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::illustration_config::{FallbackModelConfig, PipelineConfig, PrimaryModelConfig};
use crate::illustration_errors::ProviderError;
use crate::illustration_model::{AspectRatio, ProviderKind};

/// What a provider is asked to synthesize
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    /// Identity reference, only set in premium mode for the primary provider
    pub reference_photo: Option<Vec<u8>>,
}

/// Upstream image synthesis backend
#[async_trait]
pub trait ImageSynthesisProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Human readable backend name used in logs
    fn name(&self) -> &str;

    /// Submit a prompt and return candidate image URLs in provider order
    async fn submit(&self, request: &SynthesisRequest) -> Result<Vec<String>, ProviderError>;
}

/// Replicate model a provider instance targets
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicateModel {
    Flux(PrimaryModelConfig),
    Sdxl(FallbackModelConfig),
}

impl ReplicateModel {
    /// Model input with the aspect ratio translated for this model
    pub fn input(&self, request: &SynthesisRequest) -> Value {
        match self {
            ReplicateModel::Flux(config) => {
                let mut input = json!({
                    "prompt": request.prompt,
                    "aspect_ratio": request.aspect_ratio.primary_label(),
                    "output_format": config.output_format,
                    "output_quality": config.output_quality,
                    "safety_tolerance": config.safety_tolerance,
                });
                if let Some(photo) = &request.reference_photo {
                    input["image_prompt"] = Value::String(photo_data_uri(photo));
                }
                input
            }
            ReplicateModel::Sdxl(config) => {
                let (width, height) = request.aspect_ratio.fallback_dimensions();
                json!({
                    "prompt": request.prompt,
                    "width": width,
                    "height": height,
                    "num_outputs": 1,
                    "scheduler": config.scheduler,
                    "num_inference_steps": config.num_inference_steps,
                    "guidance_scale": config.guidance_scale,
                })
            }
        }
    }

    fn endpoint(&self, api_base: &str) -> String {
        match self {
            ReplicateModel::Flux(config) => format!("{api_base}/models/{}/predictions", config.model),
            ReplicateModel::Sdxl(_) => format!("{api_base}/predictions"),
        }
    }

    fn body(&self, request: &SynthesisRequest) -> Value {
        match self {
            ReplicateModel::Flux(_) => json!({ "input": self.input(request) }),
            ReplicateModel::Sdxl(config) => json!({
                "version": config.version,
                "input": self.input(request),
            }),
        }
    }

    fn label(&self) -> &str {
        match self {
            ReplicateModel::Flux(config) => &config.model,
            ReplicateModel::Sdxl(_) => "stability-ai/sdxl",
        }
    }
}

/// Encode a reference photo as a data URI
fn photo_data_uri(photo: &[u8]) -> String {
    let mime = match image::guess_format(photo) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::WebP) => "image/webp",
        _ => "image/jpeg",
    };
    format!("data:{mime};base64,{}", BASE64.encode(photo))
}

/// Prediction resource returned by the Replicate API
#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    #[serde(default)]
    pub id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub urls: Option<PredictionUrls>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionUrls {
    #[serde(default)]
    pub get: Option<String>,
}

/// Where a prediction stands after a create or poll call
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionProgress {
    Completed(Vec<String>),
    /// Still running; poll the given URL
    Pending(Option<String>),
}

/// Safety filter wording used by the hosted models. Parameter names such as
/// `safety_tolerance` must not match.
fn is_content_policy_message(text: &str) -> bool {
    let lower = text.to_lowercase();
    [
        "nsfw",
        "content policy",
        "safety filter",
        "flagged",
        "sensitive content",
    ]
    .iter()
    .any(|marker| lower.contains(marker))
}

fn error_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map an HTTP response from the predictions API into a prediction or a
/// typed provider error
pub fn classify_response(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> Result<Prediction, ProviderError> {
    let detail = || {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|value| value.get("detail").or_else(|| value.get("error")).map(error_text))
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| truncate(body.trim(), 512))
    };

    match status {
        429 => Err(ProviderError::RateLimited {
            message: detail(),
            retry_after,
        }),
        200..=299 => serde_json::from_str::<Prediction>(body).map_err(|e| ProviderError::Api {
            status,
            message: format!("invalid prediction payload: {e}"),
        }),
        // Input validation replies name the offending parameter, never a filter verdict
        422 => Err(ProviderError::Api {
            status,
            message: detail(),
        }),
        _ => {
            let message = detail();
            if is_content_policy_message(&message) {
                Err(ProviderError::ContentPolicy(message))
            } else {
                Err(ProviderError::Api { status, message })
            }
        }
    }
}

/// Decide whether a prediction is finished, failed, or still running
pub fn resolve_prediction(prediction: &Prediction) -> Result<PredictionProgress, ProviderError> {
    match prediction.status.to_lowercase().as_str() {
        "succeeded" => {
            let urls = prediction
                .output
                .as_ref()
                .map(extract_output_urls)
                .unwrap_or_default();
            if urls.is_empty() {
                Err(ProviderError::EmptyOutput)
            } else {
                Ok(PredictionProgress::Completed(urls))
            }
        }
        status @ ("failed" | "canceled" | "aborted") => {
            let message = prediction
                .error
                .as_ref()
                .map(error_text)
                .filter(|text| !text.is_empty())
                .unwrap_or_else(|| format!("prediction {status}"));
            if is_content_policy_message(&message) {
                Err(ProviderError::ContentPolicy(message))
            } else {
                Err(ProviderError::PredictionFailed(message))
            }
        }
        _ => Ok(PredictionProgress::Pending(
            prediction.urls.as_ref().and_then(|urls| urls.get.clone()),
        )),
    }
}

/// Collect image URLs from a prediction output, which is either a single
/// URL or an ordered list of them
pub fn extract_output_urls(value: &Value) -> Vec<String> {
    let mut urls = Vec::new();
    collect_urls(value, &mut urls);
    urls
}

fn collect_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if trimmed.starts_with("http") && !out.iter().any(|existing| existing == trimmed) {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_urls(item, out);
            }
        }
        _ => {}
    }
}

/// Replicate-hosted image synthesis provider
pub struct ReplicateProvider {
    kind: ProviderKind,
    model: ReplicateModel,
    http: Client,
    api_base: String,
    api_token: String,
    poll_interval: Duration,
}

impl ReplicateProvider {
    pub fn new(kind: ProviderKind, model: ReplicateModel, config: &PipelineConfig) -> Result<Self> {
        let api_token = config
            .api_token
            .clone()
            .context("REPLICATE_API_TOKEN must be set to use the Replicate provider")?;
        let http = Client::builder()
            .build()
            .context("Failed to build HTTP client for Replicate")?;

        Ok(Self {
            kind,
            model,
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_token,
            poll_interval: config.poll_interval(),
        })
    }

    /// Flux provider used as the primary backend
    pub fn primary(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            ProviderKind::Primary,
            ReplicateModel::Flux(config.primary.clone()),
            config,
        )
    }

    /// SDXL provider used as the fallback backend
    pub fn fallback(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            ProviderKind::Fallback,
            ReplicateModel::Sdxl(config.fallback.clone()),
            config,
        )
    }

    async fn create_prediction(&self, request: &SynthesisRequest) -> Result<Prediction, ProviderError> {
        let endpoint = self.model.endpoint(&self.api_base);
        debug!(provider = %self.kind, endpoint = %endpoint, "Creating prediction");

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_token)
            .header("Prefer", "wait")
            .json(&self.model.body(request))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        classify_response(status, retry_after, &body)
    }

    async fn poll_prediction(&self, url: &str) -> Result<Prediction, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        classify_response(status, retry_after, &body)
    }

    /// Poll the prediction once, waiting out throttled status checks. The
    /// prediction keeps running upstream, so a throttled poll must not end
    /// the submission and trigger a second paid prediction.
    async fn poll_until_answered(&self, url: &str) -> Result<Prediction, ProviderError> {
        let mut wait = self.poll_interval;
        loop {
            tokio::time::sleep(wait).await;
            match self.poll_prediction(url).await {
                Err(ProviderError::RateLimited {
                    message,
                    retry_after,
                }) => {
                    wait = poll_backoff(retry_after, self.poll_interval);
                    warn!(
                        provider = %self.kind,
                        wait_ms = wait.as_millis() as u64,
                        error = %message,
                        "Prediction status poll throttled"
                    );
                }
                answered => return answered,
            }
        }
    }
}

/// Wait before re-polling after a throttled status check: the server's
/// `Retry-After` when given, never shorter than the regular poll interval
pub fn poll_backoff(retry_after: Option<Duration>, poll_interval: Duration) -> Duration {
    retry_after.map_or(poll_interval, |wait| wait.max(poll_interval))
}

#[async_trait]
impl ImageSynthesisProvider for ReplicateProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn name(&self) -> &str {
        self.model.label()
    }

    async fn submit(&self, request: &SynthesisRequest) -> Result<Vec<String>, ProviderError> {
        let mut prediction = self.create_prediction(request).await?;
        info!(
            provider = %self.kind,
            model = self.name(),
            prediction_id = prediction.id.as_deref().unwrap_or("-"),
            status = %prediction.status,
            "Prediction created"
        );

        loop {
            match resolve_prediction(&prediction)? {
                PredictionProgress::Completed(urls) => {
                    debug!(provider = %self.kind, candidates = urls.len(), "Prediction succeeded");
                    return Ok(urls);
                }
                PredictionProgress::Pending(Some(poll_url)) => {
                    prediction = self.poll_until_answered(&poll_url).await?;
                }
                PredictionProgress::Pending(None) => {
                    warn!(provider = %self.kind, status = %prediction.status, "Pending prediction has no poll URL");
                    return Err(ProviderError::PredictionFailed(format!(
                        "prediction stuck in '{}' without a poll URL",
                        prediction.status
                    )));
                }
            }
        }
    }
}
