//! # Retry Policy Module
//!
//! The illustration pipeline is a small state machine. This module holds its
//! pure transition function, so attempt limits and backoff can be checked
//! without network calls or real waiting, and the [`Sleeper`] seam the effect
//! layer waits through.
//!
//! # State Machine
//!
//! - **PrimaryAttempt(n)**: submit to the primary provider
//!   - success: download
//!   - content-policy rejection: retry after a fixed delay while
//!     `n < max_primary_attempts`, then switch to the fallback
//!   - rate limit: retry after `base_delay * n` while `n < max_retry_attempts`,
//!     then stop with exhausted retries
//!   - anything else: fatal
//! - **FallbackAttempt**: single submission, any failure is fatal

use async_trait::async_trait;
use std::time::Duration;

use crate::illustration_config::RetryPolicy;
use crate::illustration_model::{AttemptOutcome, ProviderKind};

/// Position of a run within the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// About to make the n-th primary submission (1-based)
    PrimaryAttempt(u32),
    /// About to make the single fallback submission
    FallbackAttempt,
}

impl PipelineState {
    /// Initial state for a request
    pub fn start(hint: ProviderKind) -> Self {
        match hint {
            ProviderKind::Primary => PipelineState::PrimaryAttempt(1),
            ProviderKind::Fallback => PipelineState::FallbackAttempt,
        }
    }

    pub fn provider(self) -> ProviderKind {
        match self {
            PipelineState::PrimaryAttempt(_) => ProviderKind::Primary,
            PipelineState::FallbackAttempt => ProviderKind::Fallback,
        }
    }

    pub fn attempt_number(self) -> u32 {
        match self {
            PipelineState::PrimaryAttempt(n) => n,
            PipelineState::FallbackAttempt => 1,
        }
    }
}

/// What the effect layer must do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Fetch the candidate image and verify it
    Download,
    /// Wait, then submit again in `next`
    Retry { next: PipelineState, delay: Duration },
    /// Primary exhausted on content policy, hand over to the fallback
    SwitchToFallback,
    /// Bounded retries consumed
    Exhausted,
    /// Unretryable failure
    Fatal,
}

/// Pure transition: given where the run is and how the last attempt went,
/// decide the next step
pub fn next_step(state: PipelineState, outcome: AttemptOutcome, policy: &RetryPolicy) -> Step {
    match (state, outcome) {
        (_, AttemptOutcome::Success) => Step::Download,
        (PipelineState::PrimaryAttempt(n), AttemptOutcome::ContentPolicyRejected) => {
            if n < policy.max_primary_attempts {
                Step::Retry {
                    next: PipelineState::PrimaryAttempt(n + 1),
                    delay: policy.content_policy_delay(),
                }
            } else {
                Step::SwitchToFallback
            }
        }
        (PipelineState::PrimaryAttempt(n), AttemptOutcome::RateLimited) => {
            if n < policy.max_retry_attempts {
                Step::Retry {
                    next: PipelineState::PrimaryAttempt(n + 1),
                    delay: policy.rate_limit_delay(n),
                }
            } else {
                Step::Exhausted
            }
        }
        (PipelineState::PrimaryAttempt(_), AttemptOutcome::TransientError) => Step::Fatal,
        (PipelineState::FallbackAttempt, _) => Step::Fatal,
    }
}

/// Waiting seam so backoff can be observed in tests without real delays
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
