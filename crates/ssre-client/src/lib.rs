//! Instrumentation SDK for scrapers reporting to a Scraper SRE backend.
//!
//! [`SreClient`] wraps the HTTP API with retrying submission;
//! [`ScraperObserver::monitor`] times a scraping job and reports its run on
//! every exit path.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use ssre_core::{IngestAck, RunSubmission, Scraper, ScraperConfig};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod observer;

pub use observer::{RunCapture, ScraperObserver};

pub const CRATE_NAME: &str = "ssre-client";

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root including the version prefix, e.g. `http://localhost:8000/api/v1`.
    pub api_url: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn for_api_url(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct SreClient {
    http: reqwest::Client,
    api_url: String,
    backoff: BackoffPolicy,
}

impl SreClient {
    pub fn new(config: ClientConfig) -> Result<Self, SubmitError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(SubmitError::Client)?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub async fn register(&self, config: &ScraperConfig) -> Result<Scraper, SubmitError> {
        self.post_json("register", config).await
    }

    pub async fn ingest(&self, submission: &RunSubmission) -> Result<IngestAck, SubmitError> {
        let span = info_span!("ingest", scraper_id = %submission.scraper_id, status = %submission.status);
        self.post_json("ingest", submission).instrument(span).await
    }

    pub fn observer(&self, scraper_id: Uuid) -> ScraperObserver {
        ScraperObserver::new(self.clone(), scraper_id)
    }

    /// POST `body` to `path`, retrying transient failures per the backoff policy.
    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, SubmitError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.api_url, path);
        let mut attempt = 0;
        loop {
            let retry = match self.http.post(&url).json(body).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.json::<R>().await?),
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(SubmitError::HttpStatus {
                            status: status.as_u16(),
                            url,
                        });
                    }
                    status.to_string()
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(SubmitError::Request(err));
                    }
                    err.to_string()
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(%url, attempt, reason = %retry, delay_ms = delay.as_millis() as u64, "retrying request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Submit without surfacing failures to the caller; they are only logged.
pub(crate) async fn submit_logged(client: &SreClient, submission: &RunSubmission) {
    if let Err(err) = client.ingest(submission).await {
        warn!(scraper_id = %submission.scraper_id, error = %err, "failed to submit run metrics");
    }
}
