//! Elasticsearch HTTP client.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace, warn};

use super::{BackendError, CountResponse, SearchBackend, SearchOptions, SearchResponse};
use crate::BoxFuture;

/// Default backend URL.
pub const DEFAULT_URL: &str = "http://localhost:9200";
/// Default index name.
pub const DEFAULT_INDEX: &str = "observations";
/// Default shard routing preference.
pub const DEFAULT_PREFERENCE: &str = "_local";
/// Default per-request timeout when a call does not give one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for [`ElasticsearchClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct ElasticsearchConfig {
    /// Base URL, e.g. `http://localhost:9200`.
    pub url: String,
    pub index: String,
    /// Value of the `preference` query parameter.
    pub preference: String,
    pub request_timeout: Duration,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            index: DEFAULT_INDEX.to_string(),
            preference: DEFAULT_PREFERENCE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ElasticsearchConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    fn endpoint(&self, api: &str) -> String {
        format!("{}/{}/{}", self.url.trim_end_matches('/'), self.index, api)
    }
}

/// Search backend over the Elasticsearch REST API.
///
/// One client is built by the composition root and shared through the
/// service context; the underlying reqwest client pools connections.
#[derive(Clone)]
pub struct ElasticsearchClient {
    client: reqwest::Client,
    config: ElasticsearchConfig,
}

impl ElasticsearchClient {
    /// Creates a client with pooled keep-alive connections.
    pub fn new(config: ElasticsearchConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ElasticsearchConfig {
        &self.config
    }

    async fn post(&self, api: &str, body: &Value, options: SearchOptions) -> Result<Vec<u8>, BackendError> {
        let url = self.config.endpoint(api);
        trace!(url = %url, "search request starting");

        let mut request = self
            .client
            .post(&url)
            .query(&[("preference", self.config.preference.as_str())])
            .json(body);
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let response = match request.send().await {
            Ok(resp) => {
                debug!(url = %url, status = resp.status().as_u16(), "search response received");
                resp
            }
            Err(e) => {
                warn!(
                    url = %url,
                    error = %e,
                    is_connect = e.is_connect(),
                    is_timeout = e.is_timeout(),
                    "search request failed"
                );
                if e.is_timeout() {
                    return Err(BackendError::Timeout);
                }
                return Err(BackendError::Http(format!("Request failed: {}", e)));
            }
        };

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Http(format!("Failed to read response: {}", e))
            }
        })?;

        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        Ok(bytes.to_vec())
    }
}

impl SearchBackend for ElasticsearchClient {
    fn search(&self, body: Value, options: SearchOptions) -> BoxFuture<'_, Result<SearchResponse, BackendError>> {
        Box::pin(async move {
            let bytes = self.post("_search", &body, options).await?;
            serde_json::from_slice(&bytes).map_err(|e| BackendError::Malformed(e.to_string()))
        })
    }

    fn count(&self, body: Value, options: SearchOptions) -> BoxFuture<'_, Result<u64, BackendError>> {
        Box::pin(async move {
            let bytes = self.post("_count", &body, options).await?;
            let rsp: CountResponse =
                serde_json::from_slice(&bytes).map_err(|e| BackendError::Malformed(e.to_string()))?;
            Ok(rsp.count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_url_and_index() {
        let config = ElasticsearchConfig::default()
            .with_url("http://es:9200/")
            .with_index("obs");
        assert_eq!(config.endpoint("_search"), "http://es:9200/obs/_search");
    }

    #[test]
    fn test_default_config() {
        let config = ElasticsearchConfig::default();
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.preference, "_local");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_http_error() {
        let config = ElasticsearchConfig::default().with_url("http://127.0.0.1:1");
        let client = ElasticsearchClient::new(config).unwrap();
        let err = client
            .count(serde_json::json!({ "query": { "match_all": {} } }), SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Http(_) | BackendError::Timeout));
    }
}
