pub mod http;
pub mod nested;

pub use http::HttpFeedClient;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use url::Url;

/// Endpoint plus the versioning/session query pairs the feed expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRequest {
    pub endpoint: String,
    pub params: Vec<(String, String)>,
}

impl FeedRequest {
    pub fn new(endpoint: &str, params: Vec<(String, String)>) -> Self {
        FeedRequest {
            endpoint: endpoint.to_string(),
            params,
        }
    }

    /// Copy of this request with one more query pair.
    pub fn with_param(&self, key: &str, value: impl Into<String>) -> Self {
        let mut req = self.clone();
        req.params.push((key.to_string(), value.into()));
        req
    }

    pub fn url(&self) -> Result<Url> {
        Url::parse_with_params(&self.endpoint, &self.params)
            .with_context(|| format!("invalid feed endpoint {}", self.endpoint))
    }
}

/// Anything that can turn a request descriptor into a raw feed document.
/// Implementations do not retry; a failed fetch abandons the tick.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch(&self, request: &FeedRequest) -> Result<Value>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
