//! Store client trait and its HTTP implementation.
//!
//! The authoritative store speaks a small JSON protocol:
//!
//! - `POST {base}/add/{key}` with `{"value": "..."}` writes a key
//! - `GET {base}/get/{key}` returns `{"key": "...", "value": "..."}` or 404
//! - `GET {base}/entries` returns every entry as a JSON array

use crate::error::{Result, StoreError};
use crate::types::{Ack, Entry, StoreErrorBody, WriteRequest};
use async_trait::async_trait;
use metrics::counter;
use reqwest::{Response, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, warn};

/// Default base URL of the authoritative store.
pub const DEFAULT_STORE_URL: &str = "http://localhost:5080";

/// Read/write access to the authoritative key/value store.
///
/// Implementations never touch gateway state; they only perform the call and
/// normalize its failure into a [`StoreError`].
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Write `value` under `key`, returning the store's acknowledgment.
    async fn write(&self, key: &str, value: &str) -> Result<Ack>;

    /// Read the current value of `key`.
    async fn read(&self, key: &str) -> Result<String>;

    /// List every entry currently held by the store.
    async fn list(&self) -> Result<Vec<Entry>>;
}

/// Configuration for [`HttpStoreClient`].
#[derive(Debug, Clone)]
pub struct StoreClientConfig {
    /// Base URL of the store (e.g. `http://localhost:5080`).
    pub base_url: String,
    /// Per-call timeout. A call that sees no response within it is a transport failure.
    pub timeout: Duration,
    /// Extra attempts after a transport failure where no response was observed.
    pub retries: u32,
}

impl Default for StoreClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_STORE_URL.to_string(),
            timeout: Duration::from_secs(2),
            retries: 1,
        }
    }
}

/// HTTP client for the authoritative store.
#[derive(Debug, Clone)]
pub struct HttpStoreClient {
    http: reqwest::Client,
    base_url: Url,
    retries: u32,
}

impl HttpStoreClient {
    /// Create a new client from configuration.
    pub fn new(config: StoreClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| StoreError::Config(format!("invalid store url '{}': {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Config(format!(
                "store url '{}' cannot be used as a base",
                config.base_url
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            retries: config.retries,
        })
    }

    /// Create a client for `base_url` with default timeout and retry settings.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        Self::new(StoreClientConfig {
            base_url: base_url.into(),
            ..Default::default()
        })
    }

    /// Base URL this client talks to.
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Config(format!("store url '{}' cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send a request, retrying only when no response was observed.
    ///
    /// Once the store has answered, whatever it said is final: an explicit
    /// error response is never retried.
    async fn send<F>(&self, op: &'static str, build: F) -> Result<Response>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.retries && is_transport_failure(&e) => {
                    attempt += 1;
                    counter!("store_client_retries_total", "op" => op).increment(1);
                    warn!("Store {} saw no response ({}), retry {}/{}", op, e, attempt, self.retries);
                }
                Err(e) => return Err(StoreError::Unavailable(format!("{} failed: {}", op, e))),
            }
        }
    }
}

#[async_trait]
impl StoreClient for HttpStoreClient {
    async fn write(&self, key: &str, value: &str) -> Result<Ack> {
        let url = self.url(&["add", key])?;
        debug!("Writing key '{}' to {}", key, url);

        let body = WriteRequest {
            value: value.to_string(),
        };
        let response = self
            .send("write", || self.http.post(url.clone()).json(&body))
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(Ack {
                key: key.to_string(),
                value: value.to_string(),
            });
        }

        let message = error_message(response).await;
        if status.is_server_error() {
            Err(StoreError::Unavailable(message))
        } else {
            Err(StoreError::Rejected(message))
        }
    }

    async fn read(&self, key: &str) -> Result<String> {
        let url = self.url(&["get", key])?;
        debug!("Reading key '{}' from {}", key, url);

        let response = self.send("read", || self.http.get(url.clone())).await?;

        match response.status() {
            status if status.is_success() => {
                let entry: Entry = response.json().await?;
                Ok(entry.value)
            }
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(key.to_string())),
            status if status.is_server_error() => {
                Err(StoreError::Unavailable(error_message(response).await))
            }
            _ => Err(StoreError::Rejected(error_message(response).await)),
        }
    }

    async fn list(&self) -> Result<Vec<Entry>> {
        let url = self.url(&["entries"])?;
        let response = self.send("list", || self.http.get(url.clone())).await?;

        let status = response.status();
        if status.is_success() {
            let entries: Vec<Entry> = response.json().await?;
            debug!("Listed {} entries from store", entries.len());
            return Ok(entries);
        }

        let message = error_message(response).await;
        if status.is_server_error() {
            Err(StoreError::Unavailable(message))
        } else {
            Err(StoreError::Rejected(message))
        }
    }
}

fn is_transport_failure(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Extract a human-readable message from an error response.
async fn error_message(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<StoreErrorBody>(&text) {
        Ok(body) => body.error,
        Err(_) if text.is_empty() => format!("store returned {}", status),
        Err(_) => format!("store returned {}: {}", status, text),
    }
}
