//! # Illustration Configuration Module
//!
//! This module defines configuration structures for illustration generation,
//! including the retry policy, provider model parameters, timeouts and the
//! feature switches that select how a pipeline is assembled.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::illustration_model::AspectRatio;

// Constants for illustration configuration
pub const DEFAULT_REPLICATE_API_BASE: &str = "https://api.replicate.com/v1";
pub const DEFAULT_PRIMARY_MODEL: &str = "black-forest-labs/flux-1.1-pro";
pub const DEFAULT_FALLBACK_MODEL_VERSION: &str =
    "39ed52f2a78e934b3ba6e2a89f5b1c712de7dfea535525255b1aa35c5565e08b";
pub const DEFAULT_SUBMIT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Retry policy for primary provider submissions
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Content-policy rejections tolerated before switching to the fallback
    pub max_primary_attempts: u32,
    /// Rate-limited attempts tolerated before giving up
    pub max_retry_attempts: u32,
    /// Fixed pause before retrying a content-policy rejection
    pub content_policy_delay_ms: u64,
    /// Unit of the linear rate-limit backoff (`base * n`)
    pub base_delay_ms: u64,
    /// Upper bound of random jitter added to rate-limit waits, 0 disables it
    pub rate_limit_jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_primary_attempts: 3,
            max_retry_attempts: 5,
            content_policy_delay_ms: 2000, // 2 seconds
            base_delay_ms: 1000,           // 1 second
            rate_limit_jitter_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn content_policy_delay(&self) -> Duration {
        Duration::from_millis(self.content_policy_delay_ms)
    }

    /// Linear backoff after the `attempt`-th rate-limited submission
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Parameters sent to the primary (Flux) model
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryModelConfig {
    /// `owner/name` of the Replicate model
    pub model: String,
    pub output_format: String,
    pub output_quality: u8,
    pub safety_tolerance: u8,
}

impl Default for PrimaryModelConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_PRIMARY_MODEL.to_string(),
            output_format: "png".to_string(),
            output_quality: 100,
            safety_tolerance: 6,
        }
    }
}

/// Parameters sent to the fallback (SDXL) model
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackModelConfig {
    /// Pinned Replicate model version hash
    pub version: String,
    pub scheduler: String,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
}

impl Default for FallbackModelConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_FALLBACK_MODEL_VERSION.to_string(),
            scheduler: "K_EULER".to_string(),
            num_inference_steps: 30,
            guidance_scale: 7.5,
        }
    }
}

/// Which providers a pipeline is assembled from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderOrder {
    #[default]
    PrimaryThenFallback,
    PrimaryOnly,
    FallbackOnly,
}

impl ProviderOrder {
    pub fn uses_primary(self) -> bool {
        !matches!(self, ProviderOrder::FallbackOnly)
    }

    pub fn uses_fallback(self) -> bool {
        !matches!(self, ProviderOrder::PrimaryOnly)
    }
}

/// Configuration structure for the illustration pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub retry: RetryPolicy,
    /// Upper bound on a single provider submission, polling included
    pub submit_timeout_secs: u64,
    /// Network timeout for downloading the generated image
    pub download_timeout_secs: u64,
    /// Interval between prediction status polls
    pub poll_interval_ms: u64,
    /// Send the child's photo to the primary provider (premium mode)
    pub use_reference_photo: bool,
    pub default_aspect_ratio: AspectRatio,
    pub provider_order: ProviderOrder,
    pub api_base: String,
    pub api_token: Option<String>,
    pub primary: PrimaryModelConfig,
    pub fallback: FallbackModelConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            submit_timeout_secs: DEFAULT_SUBMIT_TIMEOUT_SECS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            use_reference_photo: false,
            default_aspect_ratio: AspectRatio::VerticalTall,
            provider_order: ProviderOrder::PrimaryThenFallback,
            api_base: DEFAULT_REPLICATE_API_BASE.to_string(),
            api_token: None,
            primary: PrimaryModelConfig::default(),
            fallback: FallbackModelConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Build the configuration from process environment variables
    ///
    /// Loads `.env` first when present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup, overlaying
    /// any values found on top of the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        config.api_token = get("REPLICATE_API_TOKEN");

        if let Some(base) = get("REPLICATE_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(value) = get("ILLUSTRATION_BASE_DELAY_MS") {
            config.retry.base_delay_ms = value
                .parse()
                .with_context(|| format!("ILLUSTRATION_BASE_DELAY_MS is not a number: {value}"))?;
        }
        if let Some(value) = get("ILLUSTRATION_JITTER_MS") {
            config.retry.rate_limit_jitter_ms = value
                .parse()
                .with_context(|| format!("ILLUSTRATION_JITTER_MS is not a number: {value}"))?;
        }
        if let Some(value) = get("ILLUSTRATION_SUBMIT_TIMEOUT_SECS") {
            config.submit_timeout_secs = value.parse().with_context(|| {
                format!("ILLUSTRATION_SUBMIT_TIMEOUT_SECS is not a number: {value}")
            })?;
        }
        if let Some(value) = get("ILLUSTRATION_DOWNLOAD_TIMEOUT_SECS") {
            config.download_timeout_secs = value.parse().with_context(|| {
                format!("ILLUSTRATION_DOWNLOAD_TIMEOUT_SECS is not a number: {value}")
            })?;
        }
        if let Some(value) = get("ILLUSTRATION_USE_REFERENCE_PHOTO") {
            config.use_reference_photo = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(value) = get("ILLUSTRATION_ASPECT_RATIO") {
            config.default_aspect_ratio = value
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid ILLUSTRATION_ASPECT_RATIO")?;
        }

        Ok(config)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
