//! Domain records for both CVE feeds + keyword relevance filtering.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "vulnwatch-core";

/// One poll result of the trending feed. `updated` is the server-assigned
/// label that doubles as the snapshot's on-disk identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendingSnapshot {
    pub updated: String,
    pub data: Vec<TrendingCve>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendingCve {
    pub cve: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "de_stringish")]
    pub severity: Option<String>,
    #[serde(default, deserialize_with = "de_score")]
    pub epss_score: Option<f64>,
    #[serde(default, rename = "publishedDate")]
    pub published_date: Option<String>,
    #[serde(default, rename = "lastModifiedDate")]
    pub last_modified_date: Option<String>,
    #[serde(default)]
    pub vendors: Vec<VendorEntry>,
    #[serde(default)]
    pub vendor_advisories: Vec<JsonValue>,
    #[serde(default)]
    pub github_repos: Vec<GithubRepo>,
    #[serde(default)]
    pub reddit_posts: Vec<RedditPost>,
    #[serde(default)]
    pub tweets: Vec<Tweet>,
    /// Bulky time-series payload, dropped from persisted copies.
    #[serde(default, skip_serializing)]
    pub timegraph_data: Option<JsonValue>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorEntry {
    pub vendor: String,
    #[serde(default)]
    pub products: Vec<ProductEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductEntry {
    pub product: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubRepo {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedditPost {
    pub reddit_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tweet {
    pub twitter_user_handle: String,
    pub tweet_id: String,
    #[serde(default)]
    pub tweet_text: Option<String>,
}

/// One entry of the "last N" feed. The CPE-bearing fields are used for
/// filtering and card rendering only and are stripped from persisted copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastCve {
    pub id: String,
    #[serde(default, rename = "Published")]
    pub published: Option<String>,
    #[serde(default, rename = "Modified")]
    pub modified: Option<String>,
    #[serde(default, deserialize_with = "de_score")]
    pub cvss: Option<f64>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default, skip_serializing)]
    pub vulnerable_product: Vec<String>,
    #[serde(default, skip_serializing)]
    pub capec: Option<JsonValue>,
    #[serde(default, skip_serializing)]
    pub vulnerable_configuration: Option<JsonValue>,
    #[serde(default, skip_serializing)]
    pub vulnerable_configuration_cpe_2_2: Option<JsonValue>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

/// Feeds send scores as numbers, numeric strings, or null.
fn de_score<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.parse().ok(),
        _ => None,
    })
}

fn de_stringish<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Vendor and product extracted from a CPE 2.2 (`cpe:/a:vendor:product:...`)
/// or CPE 2.3 (`cpe:2.3:a:vendor:product:...`) URI.
pub fn cpe_vendor_product(uri: &str) -> Option<(String, String)> {
    let rest = uri.strip_prefix("cpe:")?;
    let components = if let Some(formatted) = rest.strip_prefix("2.3:") {
        formatted
    } else if let Some(legacy) = rest.strip_prefix('/') {
        legacy
    } else {
        return None;
    };
    let mut parts = components.split(':');
    let _part = parts.next()?;
    let vendor = parts.next()?;
    let product = parts.next()?;
    if vendor.is_empty() || product.is_empty() {
        return None;
    }
    Some((vendor.to_string(), product.to_string()))
}

/// Outcome of the relevance filter for a single entry. On a miss, `matched`
/// carries the last vendor/product seen so the caller can log what was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relevance {
    pub hit: bool,
    pub matched: Option<String>,
}

impl Relevance {
    fn hit(term: &str) -> Self {
        Self {
            hit: true,
            matched: Some(term.to_string()),
        }
    }

    fn miss(seen: Option<String>) -> Self {
        Self {
            hit: false,
            matched: seen,
        }
    }
}

/// An entry tagged with its filter outcome, ready for notification. The flag
/// selects the card styling (urgent vs informational).
#[derive(Debug, Clone)]
pub struct Tagged<T> {
    pub relevant: bool,
    pub entry: T,
}

/// Keyword lists driving the relevance filter. Vendor/product lists are
/// matched against feed metadata, all lists are additionally searched as
/// whole words inside the description text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keywords {
    #[serde(default)]
    pub vendor: Vec<String>,
    #[serde(default)]
    pub product: Vec<String>,
    #[serde(default)]
    pub others: Vec<String>,
}

impl Keywords {
    pub fn assess_trending(&self, cve: &TrendingCve) -> Relevance {
        let mut last_vendor = None;
        let mut last_product = None;
        for entry in &cve.vendors {
            if contains_ci(&self.vendor, &entry.vendor) {
                return Relevance::hit(&entry.vendor);
            }
            last_vendor = Some(entry.vendor.clone());
            if let Some(product) = entry.products.first() {
                if contains_ci(&self.product, &product.product) {
                    return Relevance::hit(&product.product);
                }
                last_product = Some(product.product.clone());
            }
        }
        if let Some(term) = self.text_match(cve.description.as_deref().unwrap_or_default()) {
            return Relevance::hit(&term);
        }
        Relevance::miss(last_vendor.or(last_product))
    }

    pub fn assess_last(&self, cve: &LastCve) -> Relevance {
        let mut last_vendor = None;
        let mut last_product = None;
        for uri in &cve.vulnerable_product {
            let Some((vendor, product)) = cpe_vendor_product(uri) else {
                continue;
            };
            if contains_ci(&self.vendor, &vendor) {
                return Relevance::hit(&vendor);
            }
            if contains_ci(&self.product, &product) {
                return Relevance::hit(&product);
            }
            last_vendor = Some(vendor);
            last_product = Some(product);
        }
        if let Some(term) = self.text_match(&cve.summary) {
            return Relevance::hit(&term);
        }
        Relevance::miss(last_vendor.or(last_product))
    }

    /// Whole-word search: needles are padded with spaces so `SSH` does not
    /// fire on `OpenSSH`. The haystack is padded too so edge words count.
    fn text_match(&self, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        let haystack = format!(" {} ", text.to_uppercase());
        self.others
            .iter()
            .chain(&self.vendor)
            .chain(&self.product)
            .find(|keyword| haystack.contains(&format!(" {} ", keyword.to_uppercase())))
            .cloned()
    }
}

fn contains_ci(list: &[String], candidate: &str) -> bool {
    list.iter().any(|item| item.eq_ignore_ascii_case(candidate))
}
