use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{FeedClient, FeedRequest};

const BODY_EXCERPT: usize = 256;

/// Plain HTTP GET against the bookmaker JSON endpoints.
#[derive(Clone)]
pub struct HttpFeedClient {
    http: Client,
}

impl HttpFeedClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpFeedClient { http })
    }
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, request: &FeedRequest) -> Result<Value> {
        let url = request.url()?;
        debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("feed request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(BODY_EXCERPT).collect();
            anyhow::bail!("feed returned {}: {}", status, excerpt);
        }

        let body = resp.text().await.context("failed to read feed body")?;
        serde_json::from_str(&body).context("feed body is not valid JSON")
    }
}
