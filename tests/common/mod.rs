//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, ImageOutputFormat, RgbImage};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storybook::fetcher::HttpFetcher;
use storybook::illustration_config::PipelineConfig;
use storybook::illustration_errors::{FetchError, ProviderError};
use storybook::illustration_model::ProviderKind;
use storybook::pipeline::{IllustrationPipeline, IllustrationPipelineBuilder};
use storybook::providers::{ImageSynthesisProvider, SynthesisRequest};
use storybook::retry_policy::Sleeper;

pub type Response = Result<Vec<String>, ProviderError>;

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buffer = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::new(width, height))
        .write_to(&mut Cursor::new(&mut buffer), ImageOutputFormat::Png)
        .unwrap();
    buffer
}

pub fn ok(url: &str) -> Response {
    Ok(vec![url.to_string()])
}

pub fn nsfw() -> Response {
    Err(ProviderError::ContentPolicy(
        "NSFW content detected. Try running it again.".to_string(),
    ))
}

pub fn throttled() -> Response {
    Err(ProviderError::RateLimited {
        message: "Request was throttled.".to_string(),
        retry_after: None,
    })
}

pub fn server_error() -> Response {
    Err(ProviderError::Api {
        status: 500,
        message: "internal error".to_string(),
    })
}

/// Provider that replays a fixed script of responses, repeating the last
/// one once the script runs out
pub struct ScriptedProvider {
    kind: ProviderKind,
    script: Mutex<VecDeque<Response>>,
    last: Mutex<Option<Response>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<SynthesisRequest>>,
}

impl ScriptedProvider {
    pub fn new(kind: ProviderKind, script: Vec<Response>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Provider that takes `delay` before answering
    pub fn slow(kind: ProviderKind, delay: Duration, response: Response) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script: Mutex::new(vec![response].into()),
            last: Mutex::new(None),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SynthesisRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageSynthesisProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, request: &SynthesisRequest) -> Result<Vec<String>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(response) => {
                *last = Some(response.clone());
                response
            }
            None => last.clone().unwrap_or(Err(ProviderError::EmptyOutput)),
        }
    }
}

/// Fetcher serving canned bodies by URL; unknown URLs answer 404
#[derive(Default)]
pub struct MockFetcher {
    bodies: HashMap<String, Vec<u8>>,
    any_url_body: Option<Vec<u8>>,
    fetched: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn with(mut self, url: &str, body: Vec<u8>) -> Self {
        self.bodies.insert(url.to_string(), body);
        self
    }

    /// Serve the same body for every URL
    pub fn serving_any(body: Vec<u8>) -> Self {
        Self {
            any_url_body: Some(body),
            ..Default::default()
        }
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpFetcher for MockFetcher {
    async fn fetch_to_file(&self, url: &str, target: &Path) -> Result<u64, FetchError> {
        self.fetched.lock().unwrap().push(url.to_string());

        let body = self
            .bodies
            .get(url)
            .or(self.any_url_body.as_ref())
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })?;

        tokio::fs::write(target, body)
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;
        Ok(body.len() as u64)
    }
}

/// Sleeper that returns immediately and remembers what it was asked to wait
#[derive(Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
    }
}

/// Builder preloaded with instant sleeps and the given fetcher
pub fn pipeline_builder(
    fetcher: Arc<MockFetcher>,
    sleeper: Arc<RecordingSleeper>,
) -> IllustrationPipelineBuilder {
    IllustrationPipeline::builder()
        .fetcher(fetcher)
        .sleeper(sleeper)
        .config(PipelineConfig::default())
}
