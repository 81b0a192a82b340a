//! Partner API client with bounded retry
//!
//! One GET per target URL. Transient failures (timeouts, connection errors,
//! 5xx) are retried with exponential backoff up to the retry budget; 4xx and
//! undecodable bodies fail on the first attempt.

use async_trait::async_trait;
use reqwest::Client;
use shiptrack_common::{FetchError, Result, TrackError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{PipelineConfig, RetryPolicy};
use crate::models::{RawRecord, TargetRequest};

const USER_AGENT: &str = concat!("shiptrack-ingest/", env!("CARGO_PKG_VERSION"));

/// Source of raw shipment records for a target request
#[async_trait]
pub trait PartnerClient: Send + Sync {
    async fn fetch(&self, request: &TargetRequest) -> std::result::Result<Vec<RawRecord>, FetchError>;
}

/// HTTP client for the partner endpoint
pub struct ResilientFetcher {
    client: Client,
    retry: RetryPolicy,
}

impl ResilientFetcher {
    pub fn new(retry: RetryPolicy, timeout: Duration) -> Result<Self> {
        // No idle connections are kept, so every attempt opens its own.
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TrackError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, retry })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(config.retry.clone(), config.request_timeout())
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fetch a URL, retrying transient failures per the retry policy
    pub async fn fetch_url(&self, url: &str) -> std::result::Result<Vec<RawRecord>, FetchError> {
        let max_attempts = self.retry.max_retries + 1;
        let mut attempt = 1;

        loop {
            match self.attempt(url).await {
                Ok(records) => {
                    debug!(url, attempt, records = records.len(), "Fetched partner response");
                    return Ok(records);
                },
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        url,
                        attempt,
                        max_attempts,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Transient fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(err) => {
                    warn!(url, attempt, max_attempts, error = %err, "Fetch failed");
                    return Err(err);
                },
            }
        }
    }

    async fn attempt(&self, url: &str) -> std::result::Result<Vec<RawRecord>, FetchError> {
        let response = self.client.get(url).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::RemoteError {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(classify)?;
        decode_records(&body)
    }
}

#[async_trait]
impl PartnerClient for ResilientFetcher {
    async fn fetch(&self, request: &TargetRequest) -> std::result::Result<Vec<RawRecord>, FetchError> {
        self.fetch_url(&request.url).await
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if err.is_decode() {
        FetchError::MalformedResponse(err.to_string())
    } else {
        FetchError::Connection(err.to_string())
    }
}

/// Decode a partner body: a JSON array of per-shipment objects.
///
/// A bare object is accepted as a single-shipment response.
pub fn decode_records(body: &[u8]) -> std::result::Result<Vec<RawRecord>, FetchError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| FetchError::MalformedResponse(e.to_string()))?;

    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                serde_json::Value::Object(record) => Ok(record),
                other => Err(FetchError::MalformedResponse(format!(
                    "element {} is {} rather than an object",
                    index,
                    json_kind(&other)
                ))),
            })
            .collect(),
        serde_json::Value::Object(record) => Ok(vec![record]),
        other => Err(FetchError::MalformedResponse(format!(
            "expected an array of shipments, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
