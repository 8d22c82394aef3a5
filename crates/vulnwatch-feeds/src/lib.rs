//! HTTP clients for the two public CVE feeds.
//!
//! Fetches are fire-and-forget with a bounded timeout and no retries: a
//! failed tick is retried naturally by the next scheduled tick.

use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use vulnwatch_core::{LastCve, TrendingSnapshot};

pub const CRATE_NAME: &str = "vulnwatch-feeds";

pub const TRENDING_FEED_BASE: &str = "https://cvetrends.com/api/cves";
pub const LAST_FEED_URL: &str = "https://cve.circl.lu/api/last/100";

/// The trending feed rejects non-browser user agents.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/100.0.4896.75 Safari/537.36";

const TRENDING_TIMEOUT: Duration = Duration::from_secs(15);
// The last-N endpoint is slow; it aggregates on demand.
const LAST_TIMEOUT: Duration = Duration::from_secs(300);

/// Query window of the trending feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFrame {
    Day,
    Week,
}

impl TimeFrame {
    pub fn api_segment(self) -> &'static str {
        match self {
            TimeFrame::Day => "24hrs",
            TimeFrame::Week => "7days",
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct FeedClient {
    client: reqwest::Client,
}

impl FeedClient {
    pub fn new(proxy_url: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .user_agent(USER_AGENT);
        if let Some(url) = proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(url).context("building feed proxy")?);
        }
        let client = builder.build().context("building feed http client")?;
        Ok(Self { client })
    }

    pub async fn fetch_trending(&self, frame: TimeFrame) -> Result<TrendingSnapshot, FetchError> {
        let url = format!("{TRENDING_FEED_BASE}/{}", frame.api_segment());
        self.get_json(&url, TRENDING_TIMEOUT).await
    }

    pub async fn fetch_last(&self) -> Result<Vec<LastCve>, FetchError> {
        self.get_json(LAST_FEED_URL, LAST_TIMEOUT).await
    }

    async fn get_json<T>(&self, url: &str, timeout: Duration) -> Result<T, FetchError>
    where
        T: serde::de::DeserializeOwned,
    {
        let resp = self.client.get(url).timeout(timeout).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.json().await?)
    }
}
