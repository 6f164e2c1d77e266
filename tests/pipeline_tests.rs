//! # Illustration Pipeline Tests
//!
//! End-to-end runs of the retry/fallback pipeline against scripted providers,
//! a canned fetcher and an instant sleeper.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use storybook::illustration_config::PipelineConfig;
use storybook::illustration_errors::{PipelineError, ProviderError};
use storybook::illustration_model::{
    AspectRatio, AttemptOutcome, GenerationRequest, PipelineOutcome, ProviderKind,
};
use storybook::pipeline::IllustrationPipeline;
use storybook::retry_policy::Sleeper;
use tempfile::TempDir;
use tokio::sync::watch;

const URL_A: &str = "https://replicate.delivery/a.png";
const URL_B: &str = "https://replicate.delivery/b.png";

struct Harness {
    primary: Arc<ScriptedProvider>,
    fallback: Arc<ScriptedProvider>,
    fetcher: Arc<MockFetcher>,
    sleeper: Arc<RecordingSleeper>,
    pipeline: IllustrationPipeline,
    dir: TempDir,
}

impl Harness {
    fn new(primary: Vec<Response>, fallback: Vec<Response>, fetcher: MockFetcher) -> Self {
        Self::with_config(primary, fallback, fetcher, PipelineConfig::default())
    }

    fn with_config(
        primary: Vec<Response>,
        fallback: Vec<Response>,
        fetcher: MockFetcher,
        config: PipelineConfig,
    ) -> Self {
        let primary = ScriptedProvider::new(ProviderKind::Primary, primary);
        let fallback = ScriptedProvider::new(ProviderKind::Fallback, fallback);
        let fetcher = Arc::new(fetcher);
        let sleeper = Arc::new(RecordingSleeper::default());
        let pipeline = pipeline_builder(fetcher.clone(), sleeper.clone())
            .primary(primary.clone())
            .fallback(fallback.clone())
            .config(config)
            .build()
            .unwrap();

        Self {
            primary,
            fallback,
            fetcher,
            sleeper,
            pipeline,
            dir: TempDir::new().unwrap(),
        }
    }

    fn request(&self, prompt: &str, aspect_ratio: AspectRatio) -> GenerationRequest {
        GenerationRequest::new(prompt, self.dir.path().join("book").join("scene_01.png"))
            .with_aspect_ratio(aspect_ratio)
    }
}

fn tall_png() -> Vec<u8> {
    png_bytes(90, 160)
}

#[tokio::test]
async fn test_primary_success_on_first_attempt() {
    let h = Harness::new(vec![ok(URL_A)], vec![], MockFetcher::default().with(URL_A, tall_png()));
    let request = h.request("a dragon reading a book", AspectRatio::VerticalTall);

    let report = h.pipeline.run(&request).await;

    match &report.outcome {
        PipelineOutcome::Succeeded(image, provider) => {
            assert_eq!(*provider, ProviderKind::Primary);
            assert_eq!(image.path, request.target_path());
            let proportion = f64::from(image.width) / f64::from(image.height);
            assert!((proportion - AspectRatio::VerticalTall.proportion()).abs() < 0.01);
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Success);
    assert_eq!(report.attempts[0].resulting_url.as_deref(), Some(URL_A));
    assert_eq!(h.fallback.calls(), 0);
    assert!(h.sleeper.waits().is_empty());
    assert!(request.target_path().exists());
}

#[tokio::test]
async fn test_content_policy_rejections_then_primary_success() {
    let h = Harness::new(
        vec![nsfw(), nsfw(), ok(URL_A)],
        vec![ok(URL_B)],
        MockFetcher::default().with(URL_A, png_bytes(80, 120)),
    );
    let request = h.request(
        "a child astronaut in a vertical frame",
        AspectRatio::VerticalPortrait,
    );

    let report = h.pipeline.run(&request).await;

    assert_eq!(report.attempts.len(), 3);
    assert!(report
        .attempts
        .iter()
        .all(|attempt| attempt.provider == ProviderKind::Primary));
    assert_eq!(
        report.attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(h.fetcher.fetched(), vec![URL_A.to_string()]);
    assert_eq!(h.fallback.calls(), 0);
    assert_eq!(
        h.sleeper.waits(),
        vec![Duration::from_secs(2), Duration::from_secs(2)]
    );

    match report.outcome {
        PipelineOutcome::Succeeded(image, ProviderKind::Primary) => {
            assert!(image.height > image.width);
        }
        other => panic!("expected primary success, got {other:?}"),
    }
    assert!(h
        .primary
        .requests()
        .iter()
        .all(|req| req.aspect_ratio == AspectRatio::VerticalPortrait));
}

#[tokio::test]
async fn test_content_policy_exhaustion_invokes_fallback_once() {
    let h = Harness::new(
        vec![nsfw(), nsfw(), nsfw()],
        vec![ok(URL_B)],
        MockFetcher::default().with(URL_B, tall_png()),
    );
    let request = h.request("a knight and a friendly dragon", AspectRatio::VerticalTall);

    let report = h.pipeline.run(&request).await;

    assert_eq!(report.outcome.provider(), Some(ProviderKind::Fallback));
    assert_eq!(h.primary.calls(), 3);
    assert_eq!(h.fallback.calls(), 1);
    assert_eq!(report.attempts_for(ProviderKind::Primary), 3);
    assert_eq!(report.attempts_for(ProviderKind::Fallback), 1);
    assert_eq!(h.fetcher.fetched(), vec![URL_B.to_string()]);
}

#[tokio::test]
async fn test_fallback_failure_is_fatal_and_not_retried() {
    let h = Harness::new(
        vec![nsfw()],
        vec![server_error()],
        MockFetcher::default(),
    );
    let request = h.request("a unicorn over a rainbow", AspectRatio::VerticalTall);

    let outcome = h.pipeline.generate(&request).await;

    assert!(matches!(
        outcome,
        PipelineOutcome::FatalError(PipelineError::Provider {
            provider: ProviderKind::Fallback,
            ..
        })
    ));
    assert_eq!(h.primary.calls(), 3);
    assert_eq!(h.fallback.calls(), 1);
    assert!(h.fetcher.fetched().is_empty());
}

#[tokio::test]
async fn test_rate_limit_exhaustion_never_calls_fallback() {
    let h = Harness::new(vec![throttled()], vec![ok(URL_B)], MockFetcher::default());
    let request = h.request("a busy robot city", AspectRatio::VerticalTall);

    let report = h.pipeline.run(&request).await;

    match &report.outcome {
        PipelineOutcome::ExhaustedRetries(PipelineError::ExhaustedRetries { attempts, .. }) => {
            assert_eq!(*attempts, 5);
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert_eq!(h.primary.calls(), 5);
    assert_eq!(h.fallback.calls(), 0);
    assert!(report
        .attempts
        .iter()
        .all(|attempt| attempt.outcome == AttemptOutcome::RateLimited));

    let waits = h.sleeper.waits();
    assert_eq!(
        waits,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_secs(4),
        ]
    );
    assert!(waits.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn test_unclassified_error_is_fatal_immediately() {
    let h = Harness::new(vec![server_error()], vec![ok(URL_B)], MockFetcher::default());
    let request = h.request("a quiet forest", AspectRatio::VerticalTall);

    let outcome = h.pipeline.generate(&request).await;

    match outcome {
        PipelineOutcome::FatalError(err) => assert!(err.to_string().contains("internal error")),
        other => panic!("expected fatal error, got {other:?}"),
    }
    assert_eq!(h.primary.calls(), 1);
    assert_eq!(h.fallback.calls(), 0);
    assert!(h.sleeper.waits().is_empty());
}

#[tokio::test]
async fn test_counters_reset_between_requests() {
    let h = Harness::new(
        vec![nsfw(), nsfw(), ok(URL_A), nsfw(), nsfw(), ok(URL_A)],
        vec![ok(URL_B)],
        MockFetcher::default().with(URL_A, tall_png()),
    );
    let request = h.request("a pirate ship at dawn", AspectRatio::VerticalTall);

    let first = h.pipeline.run(&request).await;
    let second = h.pipeline.run(&request).await;

    assert_eq!(first.outcome, second.outcome);
    assert_eq!(first.attempts.len(), 3);
    assert_eq!(second.attempts.len(), 3);
    assert_eq!(h.fallback.calls(), 0);
}

#[tokio::test]
async fn test_zero_byte_download_is_corrupt() {
    let h = Harness::new(vec![ok(URL_A)], vec![], MockFetcher::default().with(URL_A, Vec::new()));
    let request = h.request("an empty page", AspectRatio::VerticalTall);

    let outcome = h.pipeline.generate(&request).await;

    assert!(matches!(
        outcome,
        PipelineOutcome::FatalError(PipelineError::CorruptArtifact(_))
    ));
}

#[tokio::test]
async fn test_undecodable_download_is_corrupt() {
    let mut truncated = tall_png();
    truncated.truncate(truncated.len() / 2);
    let h = Harness::new(
        vec![ok(URL_A), ok(URL_B)],
        vec![],
        MockFetcher::default()
            .with(URL_A, b"<html>Service Unavailable</html>".to_vec())
            .with(URL_B, truncated),
    );

    for _ in 0..2 {
        let request = h.request("a castle on a hill", AspectRatio::VerticalTall);
        let outcome = h.pipeline.generate(&request).await;
        match outcome {
            PipelineOutcome::FatalError(err) => {
                assert!(err.to_string().starts_with("corrupt artifact"))
            }
            other => panic!("expected corrupt artifact, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_download_failure_is_fatal_and_not_retried() {
    let h = Harness::new(vec![ok(URL_A)], vec![ok(URL_B)], MockFetcher::default());
    let request = h.request("a lighthouse", AspectRatio::VerticalTall);

    let outcome = h.pipeline.generate(&request).await;

    assert!(matches!(
        outcome,
        PipelineOutcome::FatalError(PipelineError::Transport(ref msg)) if msg.contains("404")
    ));
    assert_eq!(h.primary.calls(), 1);
    assert_eq!(h.fallback.calls(), 0);
}

#[tokio::test]
async fn test_empty_prompt_is_rejected_without_calls() {
    let h = Harness::new(vec![ok(URL_A)], vec![], MockFetcher::default());
    let request = h.request("   ", AspectRatio::VerticalTall);

    let outcome = h.pipeline.generate(&request).await;

    assert!(matches!(
        outcome,
        PipelineOutcome::FatalError(PipelineError::InvalidRequest(_))
    ));
    assert_eq!(h.primary.calls(), 0);
}

#[tokio::test]
async fn test_landscape_result_still_succeeds() {
    let h = Harness::new(
        vec![ok(URL_A)],
        vec![],
        MockFetcher::default().with(URL_A, png_bytes(160, 90)),
    );
    let request = h.request("a wide meadow", AspectRatio::VerticalTall);

    let outcome = h.pipeline.generate(&request).await;

    assert_eq!(outcome.provider(), Some(ProviderKind::Primary));
}

#[tokio::test]
async fn test_fallback_hint_skips_primary() {
    let h = Harness::new(
        vec![ok(URL_A)],
        vec![ok(URL_B)],
        MockFetcher::default().with(URL_B, tall_png()),
    );
    let request = h
        .request("a snowy mountain", AspectRatio::VerticalTall)
        .with_provider_hint(ProviderKind::Fallback);

    let outcome = h.pipeline.generate(&request).await;

    assert_eq!(outcome.provider(), Some(ProviderKind::Fallback));
    assert_eq!(h.primary.calls(), 0);
}

#[tokio::test]
async fn test_primary_only_pipeline_exhausts_on_content_policy() {
    let primary = ScriptedProvider::new(ProviderKind::Primary, vec![nsfw()]);
    let sleeper = Arc::new(RecordingSleeper::default());
    let pipeline = pipeline_builder(Arc::new(MockFetcher::default()), sleeper)
        .primary(primary.clone())
        .build()
        .unwrap();
    let dir = TempDir::new().unwrap();
    let request = GenerationRequest::new("a stormy sea", dir.path().join("scene_01.png"));

    let outcome = pipeline.generate(&request).await;

    assert!(matches!(
        outcome,
        PipelineOutcome::ExhaustedRetries(PipelineError::ExhaustedRetries { attempts: 3, .. })
    ));
    assert_eq!(primary.calls(), 3);
}

#[tokio::test]
async fn test_reference_photo_only_sent_to_primary_in_premium_mode() {
    let photo = png_bytes(4, 4);
    let config = PipelineConfig {
        use_reference_photo: true,
        ..Default::default()
    };
    let h = Harness::with_config(
        vec![nsfw()],
        vec![ok(URL_B)],
        MockFetcher::default().with(URL_B, tall_png()),
        config,
    );
    let request = h
        .request("a portrait in the garden", AspectRatio::VerticalTall)
        .with_reference_photo(photo.clone());

    let outcome = h.pipeline.generate(&request).await;

    assert!(outcome.is_success());
    assert!(h
        .primary
        .requests()
        .iter()
        .all(|req| req.reference_photo.as_deref() == Some(photo.as_slice())));
    assert!(h.fallback.requests()[0].reference_photo.is_none());

    let standard = Harness::new(
        vec![ok(URL_A)],
        vec![],
        MockFetcher::default().with(URL_A, tall_png()),
    );
    let request = standard
        .request("a portrait in the garden", AspectRatio::VerticalTall)
        .with_reference_photo(photo);
    assert!(standard.pipeline.generate(&request).await.is_success());
    assert!(standard.primary.requests()[0].reference_photo.is_none());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let h = Harness::new(vec![ok(URL_A)], vec![], MockFetcher::default().with(URL_A, tall_png()));
    let request = h.request("a sleepy owl", AspectRatio::VerticalTall);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    cancel_tx.send(true).unwrap();

    let report = h.pipeline.run_with_cancel(&request, cancel_rx).await;

    assert_eq!(report.outcome, PipelineOutcome::FatalError(PipelineError::Cancelled));
    assert!(report.attempts.is_empty());
    assert_eq!(h.primary.calls(), 0);
}

/// Flags cancellation as soon as the pipeline starts waiting, then never wakes
struct CancellingSleeper {
    cancel_tx: watch::Sender<bool>,
}

#[async_trait::async_trait]
impl Sleeper for CancellingSleeper {
    async fn sleep(&self, _duration: Duration) {
        let _ = self.cancel_tx.send(true);
        std::future::pending::<()>().await;
    }
}

#[tokio::test]
async fn test_cancelled_during_backoff() {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let primary = ScriptedProvider::new(ProviderKind::Primary, vec![throttled()]);
    let pipeline = IllustrationPipeline::builder()
        .primary(primary.clone())
        .fetcher(Arc::new(MockFetcher::default()))
        .sleeper(Arc::new(CancellingSleeper { cancel_tx }))
        .build()
        .unwrap();
    let dir = TempDir::new().unwrap();
    let request = GenerationRequest::new("a racing car", dir.path().join("scene_01.png"));

    let report = pipeline.run_with_cancel(&request, cancel_rx).await;

    assert_eq!(report.outcome, PipelineOutcome::FatalError(PipelineError::Cancelled));
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(primary.calls(), 1);
    assert!(!request.target_path().exists());
}

#[tokio::test(start_paused = true)]
async fn test_slow_submission_times_out() {
    let primary = ScriptedProvider::slow(ProviderKind::Primary, Duration::from_secs(30), ok(URL_A));
    let config = PipelineConfig {
        submit_timeout_secs: 1,
        ..Default::default()
    };
    let pipeline = pipeline_builder(
        Arc::new(MockFetcher::default()),
        Arc::new(RecordingSleeper::default()),
    )
    .primary(primary)
    .config(config)
    .build()
    .unwrap();
    let dir = TempDir::new().unwrap();
    let request = GenerationRequest::new("a slow snail", dir.path().join("scene_01.png"));

    let report = pipeline.run(&request).await;

    assert!(matches!(
        report.outcome,
        PipelineOutcome::FatalError(PipelineError::Provider { .. })
    ));
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::TransientError);
}

#[tokio::test]
async fn test_rejection_after_throttling_switches_to_fallback() {
    // One counter: the rejection on attempt 3 already reaches the content-policy limit
    let h = Harness::new(
        vec![throttled(), throttled(), nsfw()],
        vec![ok(URL_B)],
        MockFetcher::default().with(URL_B, tall_png()),
    );
    let request = h.request("a carousel at night", AspectRatio::VerticalTall);

    let report = h.pipeline.run(&request).await;

    assert_eq!(report.outcome.provider(), Some(ProviderKind::Fallback));
    assert_eq!(h.primary.calls(), 3);
    assert_eq!(h.fallback.calls(), 1);
    assert_eq!(
        h.sleeper.waits(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
}

#[tokio::test]
async fn test_throttling_after_rejection_exhausts_at_fifth_attempt() {
    let h = Harness::new(
        vec![nsfw(), throttled()],
        vec![ok(URL_B)],
        MockFetcher::default().with(URL_B, tall_png()),
    );
    let request = h.request("a marching band", AspectRatio::VerticalTall);

    let report = h.pipeline.run(&request).await;

    assert!(matches!(
        report.outcome,
        PipelineOutcome::ExhaustedRetries(PipelineError::ExhaustedRetries { attempts: 5, .. })
    ));
    assert_eq!(h.primary.calls(), 5);
    assert_eq!(h.fallback.calls(), 0);
    assert_eq!(
        h.sleeper.waits(),
        vec![
            Duration::from_secs(2),
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_secs(4),
        ]
    );
}

#[tokio::test]
async fn test_empty_url_list_is_recorded_as_failure() {
    let h = Harness::new(
        vec![Ok(Vec::new())],
        vec![ok(URL_B)],
        MockFetcher::default().with(URL_B, tall_png()),
    );
    let request = h.request("an empty sky", AspectRatio::VerticalTall);

    let report = h.pipeline.run(&request).await;

    assert_eq!(
        report.outcome,
        PipelineOutcome::FatalError(PipelineError::Provider {
            provider: ProviderKind::Primary,
            source: ProviderError::EmptyOutput,
        })
    );
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::TransientError);
    assert!(report.attempts[0].resulting_url.is_none());
    assert!(h.fetcher.fetched().is_empty());
    assert_eq!(h.fallback.calls(), 0);
}

#[test]
fn test_builder_rejects_provider_in_wrong_slot() {
    let result = IllustrationPipeline::builder()
        .primary(ScriptedProvider::new(ProviderKind::Fallback, vec![ok(URL_A)]))
        .fetcher(Arc::new(MockFetcher::default()))
        .build();
    assert!(matches!(result, Err(PipelineError::Configuration(_))));

    let result = IllustrationPipeline::builder()
        .primary(ScriptedProvider::new(ProviderKind::Primary, vec![ok(URL_A)]))
        .fallback(ScriptedProvider::new(ProviderKind::Primary, vec![ok(URL_B)]))
        .fetcher(Arc::new(MockFetcher::default()))
        .build();
    assert!(matches!(result, Err(PipelineError::Configuration(_))));
}

#[test]
fn test_builder_requires_a_provider() {
    let result = IllustrationPipeline::builder()
        .fetcher(Arc::new(MockFetcher::default()))
        .build();
    assert!(matches!(result, Err(PipelineError::Configuration(_))));
}
