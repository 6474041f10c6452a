//! Elasticsearch HTTP client
//!
//! Thin async client over the cluster's REST API with HTTP Basic auth,
//! optional TLS verification, and retry with exponential backoff for
//! idempotent read operations. Writes are never retried.

use async_trait::async_trait;
use dshield_core::{DshieldError, DshieldResult, ElasticsearchConfig, RetrySettings};
use rand::Rng;
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::time::Duration;

const SERVICE: &str = "elasticsearch";

/// Abstraction over the search cluster consumed by the engine.
///
/// `ElasticsearchClient` is the production implementation; tests substitute
/// scripted backends.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// `POST /<indices>/_search`.
    async fn search(&self, indices: &[String], body: &Value) -> DshieldResult<Value>;

    /// `POST /<indices>/_count`, returning the match count.
    async fn count(&self, indices: &[String], body: &Value) -> DshieldResult<u64>;

    /// `GET /_cat/indices`, returning index names.
    async fn list_indices(&self) -> DshieldResult<Vec<String>>;

    /// `GET /<index>/_mapping`.
    async fn get_mapping(&self, index: &str) -> DshieldResult<Value>;

    /// `GET /_cluster/health`.
    async fn cluster_health(&self) -> DshieldResult<Value>;

    /// `GET /_cluster/stats`.
    async fn cluster_stats(&self) -> DshieldResult<Value>;

    /// `POST /<index>/_doc/<id>`. Not retried.
    async fn index_document(&self, index: &str, id: &str, document: &Value) -> DshieldResult<()>;
}

/// Production client for an Elasticsearch-compatible cluster.
pub struct ElasticsearchClient {
    http: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    retry: RetrySettings,
}

impl ElasticsearchClient {
    /// Build a client from configuration.
    pub fn from_config(
        config: &ElasticsearchConfig,
        retry: RetrySettings,
    ) -> DshieldResult<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .danger_accept_invalid_certs(!config.verify_ssl);
        if config.compatibility_mode {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::ACCEPT,
                reqwest::header::HeaderValue::from_static(
                    "application/vnd.elasticsearch+json; compatible-with=8",
                ),
            );
            builder = builder.default_headers(headers);
        }
        let http = builder
            .build()
            .map_err(|e| DshieldError::external(SERVICE, e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config
                .password
                .as_ref()
                .map(|secret| secret.expose_secret().to_string()),
            retry,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut builder = self.http.request(method, url);
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_deref());
        }
        builder
    }

    /// Execute a read with retry on retryable failures.
    async fn with_retry<F, Fut>(&self, operation: &str, mut call: F) -> DshieldResult<Value>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = DshieldResult<Value>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = backoff_delay(&self.retry, attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying elasticsearch read"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn execute_json(request: reqwest::RequestBuilder) -> DshieldResult<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| DshieldError::external(SERVICE, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| DshieldError::external(SERVICE, format!("invalid response: {}", e)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                    // Malformed query or missing index; retrying will not help
                    DshieldError::internal(format!("elasticsearch rejected request: {}", body))
                }
                _ => DshieldError::external(SERVICE, format!("status {}: {}", status, body)),
            })
        }
    }
}

#[async_trait]
impl SearchBackend for ElasticsearchClient {
    async fn search(&self, indices: &[String], body: &Value) -> DshieldResult<Value> {
        let path = format!("{}/_search", indices.join(","));
        self.with_retry("search", || {
            Self::execute_json(self.request(reqwest::Method::POST, &path).json(body))
        })
        .await
    }

    async fn count(&self, indices: &[String], body: &Value) -> DshieldResult<u64> {
        let path = format!("{}/_count", indices.join(","));
        let response = self
            .with_retry("count", || {
                Self::execute_json(self.request(reqwest::Method::POST, &path).json(body))
            })
            .await?;
        Ok(response.get("count").and_then(Value::as_u64).unwrap_or(0))
    }

    async fn list_indices(&self) -> DshieldResult<Vec<String>> {
        let response = self
            .with_retry("list_indices", || {
                Self::execute_json(
                    self.request(reqwest::Method::GET, "_cat/indices")
                        .query(&[("format", "json")]),
                )
            })
            .await?;

        let names = response
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("index").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    async fn get_mapping(&self, index: &str) -> DshieldResult<Value> {
        let path = format!("{}/_mapping", index);
        self.with_retry("get_mapping", || {
            Self::execute_json(self.request(reqwest::Method::GET, &path))
        })
        .await
    }

    async fn cluster_health(&self) -> DshieldResult<Value> {
        self.with_retry("cluster_health", || {
            Self::execute_json(self.request(reqwest::Method::GET, "_cluster/health"))
        })
        .await
    }

    async fn cluster_stats(&self) -> DshieldResult<Value> {
        self.with_retry("cluster_stats", || {
            Self::execute_json(self.request(reqwest::Method::GET, "_cluster/stats"))
        })
        .await
    }

    async fn index_document(&self, index: &str, id: &str, document: &Value) -> DshieldResult<()> {
        let path = format!("{}/_doc/{}", index, id);
        Self::execute_json(self.request(reqwest::Method::POST, &path).json(document)).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ElasticsearchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticsearchClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Exponential backoff with full jitter, capped at `max_delay_ms`.
fn backoff_delay(retry: &RetrySettings, attempt: u32) -> Duration {
    let exp = retry.exponential_base.powi(attempt as i32);
    let upper = ((retry.base_delay_ms as f64) * exp).min(retry.max_delay_ms as f64);
    let jittered = rand::rng().random_range(0.0..=upper.max(1.0));
    Duration::from_millis(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded() {
        let retry = RetrySettings {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            exponential_base: 2.0,
        };
        for attempt in 0..10 {
            let delay = backoff_delay(&retry, attempt);
            assert!(delay <= Duration::from_millis(1000));
        }
    }
}
