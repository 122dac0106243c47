//! HTTP adapter for a remote review service.
//!
//! Each operation POSTs its request as JSON to `{base_url}/{operation}` and
//! expects a `Billed<T>` JSON body back.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ArbitrateRequest, Billed, Challenge, ChallengeRequest, Defense, DefendRequest, Evaluation,
    EvaluateRequest, ReviewCapability, Ruling,
};
use crate::error::ReviewError;

/// Connection settings for [`HttpReviewer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpReviewerConfig {
    pub base_url: String,
    /// Bearer token sent with every request.
    pub api_key: Option<String>,
    /// Client-side request timeout.
    pub timeout_ms: u64,
}

impl Default for HttpReviewerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_key: None,
            timeout_ms: 60_000,
        }
    }
}

impl HttpReviewerConfig {
    /// Defaults overridden by `REVIEW_BASE_URL` and `REVIEW_API_KEY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            base_url: lookup("REVIEW_BASE_URL").unwrap_or(defaults.base_url),
            api_key: lookup("REVIEW_API_KEY").filter(|key| !key.is_empty()),
            ..defaults
        }
    }
}

/// [`ReviewCapability`] backed by a JSON-over-HTTP service.
pub struct HttpReviewer {
    config: HttpReviewerConfig,
    client: reqwest::Client,
}

impl HttpReviewer {
    pub fn new(config: HttpReviewerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), operation)
    }

    async fn post<Req, Resp>(&self, operation: &str, request: &Req) -> Result<Billed<Resp>, ReviewError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned + Send,
    {
        let mut builder = self.client.post(self.endpoint(operation)).json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| self.classify_send_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            debug!(operation, status = status.as_u16(), "Review service returned an error");
            return Err(classify_status(status, retry_after, body));
        }

        response
            .json::<Billed<Resp>>()
            .await
            .map_err(|e| ReviewError::malformed(format!("{} response: {}", operation, e)))
    }

    fn classify_send_error(&self, e: reqwest::Error) -> ReviewError {
        if e.is_timeout() {
            ReviewError::Timeout(Duration::from_millis(self.config.timeout_ms))
        } else if e.is_builder() {
            ReviewError::Rejected(e.to_string())
        } else {
            ReviewError::Transient(e.to_string())
        }
    }
}

/// Map a non-success status onto the review error taxonomy.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> ReviewError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ReviewError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ReviewError::Unauthorized(format!("{}: {}", status, body))
        }
        StatusCode::REQUEST_TIMEOUT => ReviewError::Transient(format!("{}: {}", status, body)),
        s if s.is_server_error() => ReviewError::Transient(format!("{}: {}", status, body)),
        _ => ReviewError::Rejected(format!("{}: {}", status, body)),
    }
}

/// `Retry-After` in delta-seconds form.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl ReviewCapability for HttpReviewer {
    async fn evaluate(&self, request: &EvaluateRequest) -> Result<Billed<Evaluation>, ReviewError> {
        self.post("evaluate", request).await
    }

    async fn challenge(
        &self,
        request: &ChallengeRequest,
    ) -> Result<Billed<Challenge>, ReviewError> {
        self.post("challenge", request).await
    }

    async fn defend(&self, request: &DefendRequest) -> Result<Billed<Defense>, ReviewError> {
        self.post("defend", request).await
    }

    async fn arbitrate(&self, request: &ArbitrateRequest) -> Result<Billed<Ruling>, ReviewError> {
        self.post("arbitrate", request).await
    }
}
