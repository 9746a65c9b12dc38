//! HTTP client for the Heimdall coordinator.

use super::{EventRecord, HeimdallClient};
use crate::error::BorError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts before a transient failure is reported as an outage.
pub const MAX_FETCH_ATTEMPTS: u32 = 5;

/// First retry delay; doubles per attempt up to [`MAX_BACKOFF`].
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Ceiling on the retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinator client over HTTP with bounded exponential backoff.
///
/// Network failures and 5xx responses are retried; 4xx responses are
/// terminal and surface immediately.
pub struct HeimdallHttpClient {
    inner: Client,
    base_url: Url,
}

impl HeimdallHttpClient {
    /// Build a client for the coordinator at `url`.
    pub fn new(url: &str) -> Result<Self, BorError> {
        let mut base_url = Url::parse(url).map_err(|e| BorError::Config {
            message: format!("invalid heimdall url {url}: {e}"),
        })?;
        // A trailing slash keeps Url::join from eating the last segment.
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        let inner = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BorError::Config {
                message: format!("building heimdall client: {e}"),
            })?;
        Ok(Self { inner, base_url })
    }

    fn url_for(&self, path: &str, query: &str) -> Result<Url, BorError> {
        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| BorError::Heimdall {
                message: format!("invalid path {path}: {e}"),
            })?;
        if !query.is_empty() {
            url.set_query(Some(query));
        }
        Ok(url)
    }

    async fn fetch_once(&self, url: &Url) -> Result<Vec<u8>, FetchFailure> {
        let response = self
            .inner
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchFailure::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| FetchFailure::Transient(e.to_string()))?;
            return Ok(body.to_vec());
        }
        if status.is_server_error() {
            return Err(FetchFailure::Transient(format!("status {status}")));
        }
        Err(FetchFailure::Terminal(status))
    }
}

enum FetchFailure {
    /// Worth retrying: network trouble or a 5xx.
    Transient(String),
    /// Not worth retrying: the coordinator rejected the request.
    Terminal(StatusCode),
}

#[async_trait]
impl HeimdallClient for HeimdallHttpClient {
    async fn fetch(&self, path: &str, query: &str) -> Result<Vec<u8>, BorError> {
        let url = self.url_for(path, query)?;

        let mut backoff = INITIAL_BACKOFF;
        let mut last_failure = String::new();
        for attempt in 1..=MAX_FETCH_ATTEMPTS {
            match self.fetch_once(&url).await {
                Ok(body) => return Ok(body),
                Err(FetchFailure::Terminal(status)) => {
                    return Err(BorError::Heimdall {
                        message: format!("{url} returned {status}"),
                    });
                }
                Err(FetchFailure::Transient(reason)) => {
                    debug!(
                        target: "bor::heimdall",
                        %url,
                        attempt,
                        %reason,
                        "fetch failed, backing off"
                    );
                    last_failure = reason;
                }
            }
            if attempt < MAX_FETCH_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        warn!(target: "bor::heimdall", %url, %last_failure, "coordinator unreachable");
        Err(BorError::HeimdallUnavailable {
            message: format!("{url}: {last_failure}"),
        })
    }

    async fn fetch_state_sync_events(
        &self,
        from_id: u64,
        to_time: i64,
    ) -> Result<Vec<EventRecord>, BorError> {
        let query = format!("from-id={from_id}&to-time={to_time}");
        let body = self.fetch("clerk/event-record/list", &query).await?;

        let mut events: Vec<EventRecord> =
            serde_json::from_slice(&body).map_err(|e| BorError::Heimdall {
                message: format!("malformed event record list: {e}"),
            })?;
        events.sort_by_key(|e| e.id);
        Ok(events)
    }

    async fn close(&self) {
        // reqwest tears the pool down with the client; nothing to flush.
        debug!(target: "bor::heimdall", "closing coordinator client");
    }
}
