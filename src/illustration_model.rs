//! # Illustration Data Model
//!
//! This module defines the values that flow through one illustration run:
//! the immutable request a caller builds per scene, the attempt records the
//! pipeline emits while it works, and the verified artifact it hands back.
//!
//! ## Usage
//!
//! ```rust
//! use storybook::illustration_model::{AspectRatio, GenerationRequest, ProviderKind};
//!
//! let request = GenerationRequest::new("a child astronaut in a vertical frame", "out/scene_01.png")
//!     .with_aspect_ratio(AspectRatio::VerticalPortrait)
//!     .with_provider_hint(ProviderKind::Primary);
//!
//! assert_eq!(request.aspect_ratio().primary_label(), "2:3");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::illustration_errors::PipelineError;

/// Vertical compositions supported by the storybook layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AspectRatio {
    /// Tall phone-style frame (9:16)
    #[default]
    VerticalTall,
    /// Classic book portrait frame (2:3)
    VerticalPortrait,
}

impl AspectRatio {
    /// Aspect ratio in the primary provider's vocabulary
    pub fn primary_label(self) -> &'static str {
        match self {
            AspectRatio::VerticalTall => "9:16",
            AspectRatio::VerticalPortrait => "2:3",
        }
    }

    /// Explicit width and height for the fallback provider, which only
    /// accepts pixel dimensions
    pub fn fallback_dimensions(self) -> (u32, u32) {
        match self {
            AspectRatio::VerticalTall => (768, 1344),
            AspectRatio::VerticalPortrait => (832, 1216),
        }
    }

    /// Expected width / height proportion
    pub fn proportion(self) -> f64 {
        match self {
            AspectRatio::VerticalTall => 9.0 / 16.0,
            AspectRatio::VerticalPortrait => 2.0 / 3.0,
        }
    }

    /// Every supported ratio is a vertical composition
    pub fn is_vertical(self) -> bool {
        self.proportion() < 1.0
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AspectRatio::VerticalTall => write!(f, "vertical-tall"),
            AspectRatio::VerticalPortrait => write!(f, "vertical-portrait"),
        }
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vertical-tall" | "tall" | "9:16" => Ok(AspectRatio::VerticalTall),
            "vertical-portrait" | "portrait" | "2:3" => Ok(AspectRatio::VerticalPortrait),
            other => Err(format!("unsupported aspect ratio: {other}")),
        }
    }
}

/// Which upstream image synthesis backend handled an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Higher fidelity provider, tried first
    #[default]
    Primary,
    /// Lower fidelity last resort
    Fallback,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Primary => write!(f, "primary"),
            ProviderKind::Fallback => write!(f, "fallback"),
        }
    }
}

/// One illustration to synthesize. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    prompt: String,
    target_path: PathBuf,
    aspect_ratio: AspectRatio,
    provider_hint: ProviderKind,
    reference_photo: Option<Vec<u8>>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, target_path: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            target_path: target_path.into(),
            aspect_ratio: AspectRatio::default(),
            provider_hint: ProviderKind::Primary,
            reference_photo: None,
        }
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: AspectRatio) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    /// Start directly at the given provider instead of the primary
    pub fn with_provider_hint(mut self, provider_hint: ProviderKind) -> Self {
        self.provider_hint = provider_hint;
        self
    }

    /// Attach a photo of the child for identity-preserving generation
    pub fn with_reference_photo(mut self, photo: Vec<u8>) -> Self {
        self.reference_photo = Some(photo);
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn aspect_ratio(&self) -> AspectRatio {
        self.aspect_ratio
    }

    pub fn provider_hint(&self) -> ProviderKind {
        self.provider_hint
    }

    pub fn reference_photo(&self) -> Option<&[u8]> {
        self.reference_photo.as_deref()
    }
}

/// Classified result of a single provider submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Success,
    ContentPolicyRejected,
    RateLimited,
    TransientError,
}

/// Record of one provider submission within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: ProviderKind,
    /// 1-based attempt counter for this provider
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    /// First candidate URL when the attempt succeeded
    pub resulting_url: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A downloaded illustration whose bytes have been fully decoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedImage {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
}

impl VerifiedImage {
    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }
}

/// Terminal result of one generation request
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Succeeded(VerifiedImage, ProviderKind),
    /// Every bounded retry was consumed without an image
    ExhaustedRetries(PipelineError),
    FatalError(PipelineError),
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Succeeded(..))
    }

    /// Provider that produced the image, if any
    pub fn provider(&self) -> Option<ProviderKind> {
        match self {
            PipelineOutcome::Succeeded(_, provider) => Some(*provider),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<(VerifiedImage, ProviderKind), PipelineError> {
        match self {
            PipelineOutcome::Succeeded(image, provider) => Ok((image, provider)),
            PipelineOutcome::ExhaustedRetries(err) | PipelineOutcome::FatalError(err) => Err(err),
        }
    }
}

/// Outcome plus the attempt log of a single run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub outcome: PipelineOutcome,
    pub attempts: Vec<ProviderAttempt>,
}

impl PipelineReport {
    /// Number of attempts made against the given provider
    pub fn attempts_for(&self, provider: ProviderKind) -> usize {
        self.attempts
            .iter()
            .filter(|attempt| attempt.provider == provider)
            .count()
    }
}
