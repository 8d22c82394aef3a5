//! Webhook notifiers: chat-card formatting, delivery and the bot registry.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};
use vulnwatch_core::{cpe_vendor_product, LastCve, Tagged, TrendingCve};

pub const CRATE_NAME: &str = "vulnwatch-bot";

const FEISHU_HOOK_BASE: &str = "https://open.feishu.cn/open-apis/bot/v2/hook";

/// Per-bot webhook settings from the config file. `secret_env` names an
/// environment variable that overrides `key` when set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotConfig {
    pub enabled: bool,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret_env: Option<String>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// A delivery target. Failures are logged per item and never abort the
/// remaining deliveries; there are no retries.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_trending(&self, items: &[Tagged<TrendingCve>]);

    async fn send_last(&self, items: &[Tagged<LastCve>]);
}

/// Instantiate the configured notifiers. The registry is a closed set keyed
/// by the config tag; unknown tags are skipped with a warning.
pub fn build_notifiers(
    configs: &BTreeMap<String, BotConfig>,
    proxy_url: Option<&str>,
) -> anyhow::Result<Vec<Box<dyn Notifier>>> {
    let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
    for (tag, config) in configs {
        if !config.enabled {
            continue;
        }
        let key = resolve_key(config);
        if key.is_empty() {
            warn!(tag, "bot has no webhook key configured, skipping");
            continue;
        }
        match tag.as_str() {
            "feishu" => notifiers.push(Box::new(FeishuBot::new(key, proxy_url)?)),
            other => warn!(tag = other, "unknown bot tag in config, skipping"),
        }
    }
    Ok(notifiers)
}

fn resolve_key(config: &BotConfig) -> String {
    config
        .secret_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| config.key.clone())
}

pub struct FeishuBot {
    key: String,
    client: reqwest::Client,
}

impl FeishuBot {
    pub fn new(key: String, proxy_url: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(url) = proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(url).context("building bot proxy")?);
        }
        let client = builder.build().context("building bot http client")?;
        Ok(Self { key, client })
    }

    async fn deliver(&self, card: JsonValue) -> Result<(), DeliveryError> {
        let url = format!("{FEISHU_HOOK_BASE}/{}", self.key);
        let resp = self
            .client
            .post(&url)
            .json(&json!({"msg_type": "interactive", "card": card}))
            .send()
            .await?;
        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for FeishuBot {
    fn name(&self) -> &'static str {
        "feishu"
    }

    async fn send_trending(&self, items: &[Tagged<TrendingCve>]) {
        for item in items {
            match self.deliver(trending_card(item.relevant, &item.entry)).await {
                Ok(()) => info!(cve = %item.entry.cve, "feishu card delivered"),
                Err(err) => warn!(cve = %item.entry.cve, %err, "feishu delivery failed"),
            }
        }
    }

    async fn send_last(&self, items: &[Tagged<LastCve>]) {
        for item in items {
            match self.deliver(last_card(item.relevant, &item.entry)).await {
                Ok(()) => info!(cve = %item.entry.id, "feishu card delivered"),
                Err(err) => warn!(cve = %item.entry.id, %err, "feishu delivery failed"),
            }
        }
    }
}

/// Interactive card for a trending entry. Relevant entries get the urgent
/// (red) header, the rest are informational (orange).
pub fn trending_card(relevant: bool, cve: &TrendingCve) -> JsonValue {
    let vendor = cve.vendors.first();
    let vendor_name = vendor.map(|v| v.vendor.as_str()).unwrap_or("-");
    let product_name = vendor
        .and_then(|v| v.products.first())
        .map(|p| p.product.as_str())
        .unwrap_or("-");

    let epss = format!("{:.2}%", cve.epss_score.unwrap_or(0.0) * 100.0);
    let advisory = cve
        .vendor_advisories
        .first()
        .map(display_advisory)
        .unwrap_or_default();
    let github = cve
        .github_repos
        .iter()
        .map(|repo| repo.url.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let reddit = cve
        .reddit_posts
        .iter()
        .map(|post| post.reddit_url.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let twitter = cve
        .tweets
        .iter()
        .map(|tweet| {
            format!(
                "https://twitter.com/{}/status/{}",
                tweet.twitter_user_handle, tweet.tweet_id
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let summary = cve
        .description
        .as_deref()
        .filter(|text| !text.is_empty())
        .or_else(|| cve.tweets.first().and_then(|t| t.tweet_text.as_deref()))
        .unwrap_or("-");

    json!({
        "header": {
            "template": header_template(relevant),
            "title": {
                "content": format!("[Trending] {} | {} - {}", cve.cve, vendor_name, product_name),
                "tag": "plain_text"
            }
        },
        "elements": [
            {
                "tag": "div",
                "fields": [
                    {
                        "is_short": true,
                        "text": {
                            "content": format!(
                                "**Timeline**\nPublished: {}\nModified: {}",
                                short_date(cve.published_date.as_deref()),
                                short_date(cve.last_modified_date.as_deref())
                            ),
                            "tag": "lark_md"
                        }
                    },
                    {
                        "is_short": true,
                        "text": {
                            "content": format!(
                                "**Severity**\nCVSS: {}\nEPSS: {}",
                                cve.severity.as_deref().unwrap_or("-"),
                                epss
                            ),
                            "tag": "lark_md"
                        }
                    }
                ]
            },
            {
                "tag": "div",
                "text": {
                    "content": format!(
                        "**Advisories**\nhttps://nvd.nist.gov/vuln/detail/{}\n{}",
                        cve.cve, advisory
                    ),
                    "tag": "lark_md"
                }
            },
            {
                "tag": "div",
                "text": {
                    "content": format!("**Summary**\n{summary}"),
                    "tag": "lark_md"
                }
            },
            {
                "tag": "div",
                "text": { "content": format!("**GitHub**\n{github}"), "tag": "lark_md" }
            },
            {
                "tag": "div",
                "text": { "content": format!("**Reddit**\n{reddit}"), "tag": "lark_md" }
            },
            {
                "tag": "div",
                "text": { "content": format!("**Twitter**\n{twitter}"), "tag": "lark_md" }
            }
        ]
    })
}

/// Interactive card for a "last N" entry.
pub fn last_card(relevant: bool, cve: &LastCve) -> JsonValue {
    let (vendor, product) = cve
        .vulnerable_product
        .first()
        .and_then(|uri| cpe_vendor_product(uri))
        .unwrap_or_else(|| ("-".to_string(), "-".to_string()));
    let cvss = cve
        .cvss
        .map(|score| score.to_string())
        .unwrap_or_else(|| "-".to_string());
    let references = cve.references.join("\n");

    json!({
        "header": {
            "template": header_template(relevant),
            "title": {
                "content": format!("[Latest] {} | {} - {}", cve.id, vendor, product),
                "tag": "plain_text"
            }
        },
        "elements": [
            {
                "tag": "div",
                "fields": [
                    {
                        "is_short": true,
                        "text": {
                            "content": format!(
                                "**Timeline**\nPublished: {}\nModified: {}",
                                short_date(cve.published.as_deref()),
                                short_date(cve.modified.as_deref())
                            ),
                            "tag": "lark_md"
                        }
                    },
                    {
                        "is_short": true,
                        "text": {
                            "content": format!("**Severity**\nCVSS: {cvss}"),
                            "tag": "lark_md"
                        }
                    }
                ]
            },
            {
                "tag": "div",
                "text": {
                    "content": format!(
                        "**Advisories**\nhttps://nvd.nist.gov/vuln/detail/{}",
                        cve.id
                    ),
                    "tag": "lark_md"
                }
            },
            {
                "tag": "div",
                "text": {
                    "content": format!("**Summary**\n{}", cve.summary),
                    "tag": "lark_md"
                }
            },
            {
                "tag": "div",
                "text": { "content": format!("**References**\n{references}"), "tag": "lark_md" }
            }
        ]
    })
}

fn header_template(relevant: bool) -> &'static str {
    if relevant {
        "red"
    } else {
        "orange"
    }
}

/// Feed timestamps are `YYYY-mm-dd HH:MM:SS`; cards show the date part only.
fn short_date(value: Option<&str>) -> &str {
    match value {
        Some(ts) => ts.get(..10).unwrap_or(ts),
        None => "-",
    }
}

fn display_advisory(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other
            .get("url")
            .and_then(|url| url.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}
