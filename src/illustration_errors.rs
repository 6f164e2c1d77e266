//! # Illustration Error Types Module
//!
//! Typed errors for the illustration pipeline. Providers map vendor payloads
//! into [`ProviderError`]; the pipeline folds everything it surfaces into
//! [`PipelineError`].

use std::time::Duration;

use crate::illustration_model::{AttemptOutcome, ProviderKind};

/// Errors reported by an image synthesis provider adapter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Output blocked by the provider's safety filter
    #[error("content policy rejection: {0}")]
    ContentPolicy(String),
    /// Provider throttled the request (HTTP 429 or equivalent)
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Network failure talking to the provider
    #[error("transport error: {0}")]
    Transport(String),
    /// Non-success HTTP status that is not a throttling signal
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    /// Prediction finished in a failed or canceled state
    #[error("prediction failed: {0}")]
    PredictionFailed(String),
    /// Prediction succeeded but carried no image URL
    #[error("provider returned no output")]
    EmptyOutput,
    /// Submission did not finish in time
    #[error("submission timed out after {0}s")]
    Timeout(u64),
}

impl ProviderError {
    /// Classify the error for the retry state machine
    pub fn attempt_outcome(&self) -> AttemptOutcome {
        match self {
            ProviderError::ContentPolicy(_) => AttemptOutcome::ContentPolicyRejected,
            ProviderError::RateLimited { .. } => AttemptOutcome::RateLimited,
            _ => AttemptOutcome::TransientError,
        }
    }
}

/// Errors raised while downloading a candidate image
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("download of {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("download transport error: {0}")]
    Transport(String),
    #[error("download timed out after {0}s")]
    Timeout(u64),
    #[error("failed to write download: {0}")]
    Io(String),
}

/// Terminal errors surfaced by the illustration pipeline
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("pipeline misconfigured: {0}")]
    Configuration(String),
    #[error("{provider} provider rejected the prompt on content policy: {message}")]
    ContentPolicyRejected {
        provider: ProviderKind,
        message: String,
    },
    #[error("{provider} provider rate limited: {message}")]
    RateLimited {
        provider: ProviderKind,
        message: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("corrupt artifact: {0}")]
    CorruptArtifact(String),
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },
    #[error("i/o error: {0}")]
    Io(String),
    #[error("generation cancelled")]
    Cancelled,
    #[error("{provider} provider failed: {source}")]
    Provider {
        provider: ProviderKind,
        source: ProviderError,
    },
}

impl PipelineError {
    /// Wrap a provider error that ended the run
    pub fn from_provider(provider: ProviderKind, err: ProviderError) -> Self {
        match err {
            ProviderError::ContentPolicy(message) => {
                PipelineError::ContentPolicyRejected { provider, message }
            }
            ProviderError::RateLimited { message, .. } => {
                PipelineError::RateLimited { provider, message }
            }
            ProviderError::Transport(message) => {
                PipelineError::Transport(format!("{provider} provider: {message}"))
            }
            source => PipelineError::Provider { provider, source },
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        PipelineError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}
