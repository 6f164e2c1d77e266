//! # Illustration Pipeline
//!
//! Turns one [`GenerationRequest`] into a [`PipelineOutcome`]. The retry
//! decisions come from [`next_step`]; this module only performs the effects
//! they call for: provider submissions, waits, the download and the decode
//! check. Every effect is raced against a cancellation signal.
//!
//! A pipeline holds no per-run state, so one instance can serve many
//! concurrent requests as long as each targets its own path.

use anyhow::Result;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::fetcher::{HttpFetcher, ReqwestFetcher};
use crate::illustration_config::PipelineConfig;
use crate::illustration_errors::{PipelineError, ProviderError};
use crate::illustration_model::{
    AttemptOutcome, GenerationRequest, PipelineOutcome, PipelineReport, ProviderAttempt,
    ProviderKind, VerifiedImage,
};
use crate::providers::{ImageSynthesisProvider, ReplicateProvider, SynthesisRequest};
use crate::retry_policy::{next_step, PipelineState, Sleeper, Step, TokioSleeper};
use crate::verifier::{verify_artifact, ImageDecoder, RasterDecoder};

/// Retry/fallback driver for illustration generation
pub struct IllustrationPipeline {
    primary: Option<Arc<dyn ImageSynthesisProvider>>,
    fallback: Option<Arc<dyn ImageSynthesisProvider>>,
    fetcher: Arc<dyn HttpFetcher>,
    decoder: Arc<dyn ImageDecoder>,
    sleeper: Arc<dyn Sleeper>,
    config: PipelineConfig,
}

/// Assembles an [`IllustrationPipeline`] from its collaborators
///
/// # Examples
///
/// ```rust,no_run
/// use storybook::illustration_config::PipelineConfig;
/// use storybook::pipeline::IllustrationPipeline;
/// use storybook::providers::ReplicateProvider;
/// use std::sync::Arc;
///
/// # fn example() -> anyhow::Result<()> {
/// let config = PipelineConfig::from_env()?;
/// let pipeline = IllustrationPipeline::builder()
///     .primary(Arc::new(ReplicateProvider::primary(&config)?))
///     .fallback(Arc::new(ReplicateProvider::fallback(&config)?))
///     .config(config)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct IllustrationPipelineBuilder {
    primary: Option<Arc<dyn ImageSynthesisProvider>>,
    fallback: Option<Arc<dyn ImageSynthesisProvider>>,
    fetcher: Option<Arc<dyn HttpFetcher>>,
    decoder: Option<Arc<dyn ImageDecoder>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    config: Option<PipelineConfig>,
}

impl IllustrationPipelineBuilder {
    pub fn primary(mut self, provider: Arc<dyn ImageSynthesisProvider>) -> Self {
        self.primary = Some(provider);
        self
    }

    pub fn fallback(mut self, provider: Arc<dyn ImageSynthesisProvider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn HttpFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<IllustrationPipeline, PipelineError> {
        let config = self.config.unwrap_or_default();

        if self.primary.is_none() && self.fallback.is_none() {
            return Err(PipelineError::Configuration(
                "at least one image synthesis provider is required".to_string(),
            ));
        }
        for (slot, provider) in [
            (ProviderKind::Primary, &self.primary),
            (ProviderKind::Fallback, &self.fallback),
        ] {
            if let Some(provider) = provider {
                if provider.kind() != slot {
                    return Err(PipelineError::Configuration(format!(
                        "{} is a {} provider but was configured as the {slot} provider",
                        provider.name(),
                        provider.kind()
                    )));
                }
            }
        }

        let fetcher: Arc<dyn HttpFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(
                ReqwestFetcher::new(config.download_timeout())
                    .map_err(|e| PipelineError::Configuration(e.to_string()))?,
            ),
        };

        Ok(IllustrationPipeline {
            primary: self.primary,
            fallback: self.fallback,
            fetcher,
            decoder: self.decoder.unwrap_or_else(|| Arc::new(RasterDecoder)),
            sleeper: self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper)),
            config,
        })
    }
}

impl IllustrationPipeline {
    pub fn builder() -> IllustrationPipelineBuilder {
        IllustrationPipelineBuilder::default()
    }

    /// Pipeline backed by the Replicate-hosted models selected by
    /// `config.provider_order`
    pub fn replicate(config: PipelineConfig) -> Result<Self> {
        let mut builder = Self::builder();
        if config.provider_order.uses_primary() {
            builder = builder.primary(Arc::new(ReplicateProvider::primary(&config)?));
        }
        if config.provider_order.uses_fallback() {
            builder = builder.fallback(Arc::new(ReplicateProvider::fallback(&config)?));
        }
        Ok(builder.config(config).build()?)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Generate one illustration
    pub async fn generate(&self, request: &GenerationRequest) -> PipelineOutcome {
        self.run(request).await.outcome
    }

    /// Generate one illustration and keep the attempt log
    pub async fn run(&self, request: &GenerationRequest) -> PipelineReport {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_with_cancel(request, cancel_rx).await
    }

    /// Generate one illustration, aborting when `cancel_rx` turns `true`
    pub async fn run_with_cancel(
        &self,
        request: &GenerationRequest,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> PipelineReport {
        let mut attempts = Vec::new();
        let outcome = match self.drive(request, &mut cancel_rx, &mut attempts).await {
            Ok((image, provider)) => {
                info!(
                    provider = %provider,
                    path = %image.path.display(),
                    width = image.width,
                    height = image.height,
                    attempts = attempts.len(),
                    "Illustration generated"
                );
                PipelineOutcome::Succeeded(image, provider)
            }
            Err(err @ PipelineError::ExhaustedRetries { .. }) => {
                warn!(error = %err, attempts = attempts.len(), "Illustration retries exhausted");
                PipelineOutcome::ExhaustedRetries(err)
            }
            Err(err) => {
                error!(error = %err, attempts = attempts.len(), "Illustration generation failed");
                PipelineOutcome::FatalError(err)
            }
        };

        PipelineReport { outcome, attempts }
    }

    async fn drive(
        &self,
        request: &GenerationRequest,
        cancel_rx: &mut watch::Receiver<bool>,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Result<(VerifiedImage, ProviderKind), PipelineError> {
        self.prepare(request).await?;

        let mut state = self.initial_state(request)?;

        loop {
            let kind = state.provider();
            let attempt_number = state.attempt_number();
            let provider = self.provider_for(kind)?;
            let synthesis = self.synthesis_request(request, kind);

            info!(
                provider = %kind,
                backend = provider.name(),
                attempt = attempt_number,
                "Submitting illustration prompt"
            );

            let started_at = chrono::Utc::now();
            let submitted = until_cancelled(cancel_rx, self.submit_with_timeout(provider, &synthesis))
                .await?
                .and_then(|urls| {
                    if urls.is_empty() {
                        Err(ProviderError::EmptyOutput)
                    } else {
                        Ok(urls)
                    }
                });

            let outcome = match &submitted {
                Ok(_) => AttemptOutcome::Success,
                Err(err) => err.attempt_outcome(),
            };
            attempts.push(ProviderAttempt {
                provider: kind,
                attempt_number,
                outcome,
                resulting_url: submitted.as_ref().ok().and_then(|urls| urls.first().cloned()),
                started_at,
            });

            match (next_step(state, outcome, &self.config.retry), submitted) {
                (Step::Download, Ok(urls)) => {
                    let url = urls.first().ok_or(PipelineError::Provider {
                        provider: kind,
                        source: ProviderError::EmptyOutput,
                    })?;
                    let image = self.download_and_verify(request, url, cancel_rx).await?;
                    return Ok((image, kind));
                }
                (Step::Retry { next, delay }, Err(err)) => {
                    let delay = self.with_jitter(outcome, delay);
                    warn!(
                        provider = %kind,
                        attempt = attempt_number,
                        outcome = ?outcome,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying illustration prompt"
                    );
                    until_cancelled(cancel_rx, self.sleeper.sleep(delay)).await?;
                    state = next;
                }
                (Step::SwitchToFallback, Err(err)) => {
                    if self.fallback.is_none() {
                        return Err(PipelineError::ExhaustedRetries {
                            attempts: attempt_number,
                            last_error: err.to_string(),
                        });
                    }
                    warn!(
                        attempts = attempt_number,
                        error = %err,
                        "Primary provider kept rejecting the prompt, switching to fallback"
                    );
                    state = PipelineState::FallbackAttempt;
                }
                (Step::Exhausted, Err(err)) => {
                    return Err(PipelineError::ExhaustedRetries {
                        attempts: attempt_number,
                        last_error: err.to_string(),
                    });
                }
                (_, Err(err)) => return Err(PipelineError::from_provider(kind, err)),
                (step, Ok(_)) => {
                    return Err(PipelineError::Configuration(format!(
                        "unexpected step {step:?} after a successful submission"
                    )));
                }
            }
        }
    }

    /// Validate the request and make sure the output directory exists
    async fn prepare(&self, request: &GenerationRequest) -> Result<(), PipelineError> {
        if request.prompt().trim().is_empty() {
            return Err(PipelineError::InvalidRequest("prompt must not be empty".to_string()));
        }

        let target = request.target_path();
        if target.file_name().is_none() {
            return Err(PipelineError::InvalidRequest(format!(
                "target path {} does not name a file",
                target.display()
            )));
        }
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn initial_state(&self, request: &GenerationRequest) -> Result<PipelineState, PipelineError> {
        let hint = match (request.provider_hint(), &self.primary) {
            // No primary configured: the fallback is the only choice
            (ProviderKind::Primary, None) => ProviderKind::Fallback,
            (hint, _) => hint,
        };
        let state = PipelineState::start(hint);
        self.provider_for(state.provider())?;
        Ok(state)
    }

    fn provider_for(&self, kind: ProviderKind) -> Result<&dyn ImageSynthesisProvider, PipelineError> {
        let provider = match kind {
            ProviderKind::Primary => self.primary.as_deref(),
            ProviderKind::Fallback => self.fallback.as_deref(),
        };
        provider.ok_or_else(|| {
            PipelineError::Configuration(format!("no {kind} provider configured"))
        })
    }

    fn synthesis_request(&self, request: &GenerationRequest, kind: ProviderKind) -> SynthesisRequest {
        let reference_photo = match kind {
            ProviderKind::Primary if self.config.use_reference_photo => {
                request.reference_photo().map(<[u8]>::to_vec)
            }
            _ => None,
        };

        SynthesisRequest {
            prompt: request.prompt().to_string(),
            aspect_ratio: request.aspect_ratio(),
            reference_photo,
        }
    }

    async fn submit_with_timeout(
        &self,
        provider: &dyn ImageSynthesisProvider,
        request: &SynthesisRequest,
    ) -> Result<Vec<String>, ProviderError> {
        let timeout = self.config.submit_timeout();
        match tokio::time::timeout(timeout, provider.submit(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout.as_secs())),
        }
    }

    async fn download_and_verify(
        &self,
        request: &GenerationRequest,
        url: &str,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<VerifiedImage, PipelineError> {
        let target = request.target_path();
        let bytes = until_cancelled(cancel_rx, self.fetcher.fetch_to_file(url, target)).await??;
        info!(url = %url, target = %target.display(), bytes, "Illustration downloaded");

        verify_artifact(self.decoder.clone(), target, request.aspect_ratio()).await
    }

    /// Random jitter only ever applies to rate-limit waits
    fn with_jitter(&self, outcome: AttemptOutcome, delay: Duration) -> Duration {
        let max_jitter = self.config.retry.rate_limit_jitter_ms;
        if outcome != AttemptOutcome::RateLimited || max_jitter == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
    }
}

/// Resolves once the cancellation flag is set; never resolves if the sender
/// is dropped without cancelling
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn until_cancelled<F>(
    cancel_rx: &mut watch::Receiver<bool>,
    work: F,
) -> Result<F::Output, PipelineError>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancelled(cancel_rx) => Err(PipelineError::Cancelled),
        output = work => Ok(output),
    }
}
