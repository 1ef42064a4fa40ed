//! HTTP broadcaster for delivering batches to the remote collector.
//!
//! Each batch is wrapped in an [`Envelope`] and POSTed as JSON. Transport
//! failures are retried with a fixed delay up to the configured number of
//! attempts; batches are always sent one at a time, in order.

use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::batcher::Batch;
use crate::config::Config;

/// Schema identifier carried by every envelope.
pub const SCHEMA: &str = "good.v1";

/// Content type sent with every POST.
const CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// The wire unit POSTed to the collector.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<'a> {
    pub schema: &'static str,
    pub host: &'a str,
    pub app_version: &'a str,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub events: &'a Batch,
}

/// Errors that can occur while broadcasting a batch.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    /// Every attempt failed
    #[error("all {attempts} broadcast attempts failed, giving up. Last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The envelope could not be encoded
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The HTTP client could not be built
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// How a batch was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Status of the accepted response; `None` when nothing was sent
    pub status: Option<StatusCode>,

    /// Number of POSTs issued for the batch
    pub attempts: u32,
}

/// Statistics about broadcast operations.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    /// Batches delivered
    pub batches_sent: u64,

    /// Events delivered
    pub events_sent: u64,

    /// POST requests issued, including retries
    pub attempts: u64,

    /// POST requests that failed
    pub failed_attempts: u64,

    /// Batches abandoned after all attempts failed
    pub batches_failed: u64,
}

/// Sends batches to the collector endpoint.
///
/// The underlying `reqwest::Client` is built once so connections are pooled
/// across cycles.
pub struct Broadcaster {
    client: Client,
    url: String,
    attempts: u32,
    wait: Duration,
    retry_on_status: bool,
    host: String,
    app_version: String,
    stats: RwLock<BroadcastStats>,
}

impl Broadcaster {
    /// Create a broadcaster for the endpoint and retry policy in `config`.
    ///
    /// # Errors
    ///
    /// Returns `BroadcastError::Client` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, BroadcastError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(BroadcastError::Client)?;

        Ok(Self {
            client,
            url: config.url.clone(),
            attempts: config.attempts,
            wait: config.wait,
            retry_on_status: config.retry_on_status,
            host: gethostname::gethostname().to_string_lossy().into_owned(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            stats: RwLock::new(BroadcastStats::default()),
        })
    }

    /// Override the delay between attempts.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Deliver one batch, retrying on failure.
    ///
    /// An empty batch succeeds immediately without a network call. Otherwise at
    /// most `attempts` POSTs are issued, `wait` apart. Only transport failures
    /// are retried unless `retry_on_status` is set, in which case a non-2xx
    /// response is retried as well.
    pub async fn send(&self, batch: &Batch) -> Result<Delivery, BroadcastError> {
        if batch.is_empty() {
            return Ok(Delivery {
                status: None,
                attempts: 0,
            });
        }

        let envelope = Envelope {
            schema: SCHEMA,
            host: &self.host,
            app_version: &self.app_version,
            timestamp: Utc::now().timestamp_millis(),
            events: batch,
        };
        let body = serde_json::to_vec(&envelope)?;

        debug!(
            events = batch.len(),
            bytes = body.len(),
            url = %self.url,
            "Sending batch"
        );

        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            if attempt > 1 {
                warn!(
                    attempt = attempt,
                    attempts = self.attempts,
                    wait_ms = self.wait.as_millis(),
                    "Retrying broadcast after delay"
                );
                tokio::time::sleep(self.wait).await;
            }

            self.record(|stats| stats.attempts += 1);

            match self.post(body.clone()).await {
                Ok(status) if status.is_success() || !self.retry_on_status => {
                    if !status.is_success() {
                        warn!(
                            status = %status,
                            url = %self.url,
                            "Collector returned non-success status"
                        );
                    }
                    info!(
                        events = batch.len(),
                        status = %status,
                        attempt = attempt,
                        "Broadcast batch"
                    );
                    self.record(|stats| {
                        stats.batches_sent += 1;
                        stats.events_sent += batch.len() as u64;
                    });
                    return Ok(Delivery {
                        status: Some(status),
                        attempts: attempt,
                    });
                }
                Ok(status) => {
                    warn!(
                        status = %status,
                        attempt = attempt,
                        attempts = self.attempts,
                        "Collector rejected batch"
                    );
                    last_error = format!("collector responded with status {}", status);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        attempt = attempt,
                        attempts = self.attempts,
                        url = %self.url,
                        "Broadcast request failed"
                    );
                    last_error = e.to_string();
                }
            }

            self.record(|stats| stats.failed_attempts += 1);
        }

        self.record(|stats| stats.batches_failed += 1);
        error!(
            attempts = self.attempts,
            events = batch.len(),
            last_error = %last_error,
            "Maximum retries exceeded, giving up"
        );

        Err(BroadcastError::RetriesExhausted {
            attempts: self.attempts,
            last_error,
        })
    }

    /// Issue a single POST and drain the response body.
    async fn post(&self, body: Vec<u8>) -> Result<StatusCode, reqwest::Error> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        match response.text().await {
            Ok(text) if !text.is_empty() => {
                debug!(status = %status, body = %text, "Collector response")
            }
            Ok(_) => {}
            Err(e) => debug!(status = %status, error = %e, "Failed to read collector response"),
        }

        Ok(status)
    }

    fn record(&self, update: impl FnOnce(&mut BroadcastStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }

    /// Get current broadcast statistics.
    pub fn stats(&self) -> BroadcastStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}
