//! Poll pipelines: fetch each feed, detect entries not seen before, notify,
//! persist, prune. One job run covers both feeds under a single run id.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;
use vulnwatch_bot::{BotConfig, Notifier};
use vulnwatch_core::{Keywords, LastCve, Tagged, TrendingSnapshot};
use vulnwatch_feeds::{FeedClient, TimeFrame};
use vulnwatch_storage::SnapshotStore;

pub const CRATE_NAME: &str = "vulnwatch-poll";

/// Process configuration, loaded once at startup and passed by value into
/// the constructors. No ambient global.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Snapshot retention in hours; overridable from the CLI.
    pub db_hours: i64,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default)]
    pub keywords: Keywords,
    #[serde(default)]
    pub bot: BTreeMap<String, BotConfig>,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("db")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendingOutcome {
    /// Feed unreachable this tick; the next tick is the retry.
    FetchFailed,
    /// The label was already ingested; reprocessing is skipped entirely.
    AlreadySeen,
    /// A fresh label whose entries were all known. Not persisted, so the
    /// same label is re-examined if the feed serves it again.
    NoNewEntries,
    Notified { new_entries: usize, pruned: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    FetchFailed,
    NoNewEntries,
    Notified { new_entries: usize },
}

#[derive(Debug, Clone)]
pub struct PollSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub trending: TrendingOutcome,
    pub last: WindowOutcome,
}

/// One scheduler tick: trending feed first, then the last-N feed. Fetch
/// failures are contained per pipeline; storage failures propagate.
pub async fn run_job(
    store: &SnapshotStore,
    feeds: &FeedClient,
    keywords: &Keywords,
    notifiers: &[Box<dyn Notifier>],
    frame: TimeFrame,
    retention_hours: i64,
) -> Result<PollSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("poll_run", %run_id);
    let _guard = span.enter();

    let trending = run_trending(store, feeds, keywords, notifiers, frame, retention_hours).await?;
    let last = run_last(store, feeds, keywords, notifiers).await?;

    Ok(PollSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        trending,
        last,
    })
}

pub async fn run_trending(
    store: &SnapshotStore,
    feeds: &FeedClient,
    keywords: &Keywords,
    notifiers: &[Box<dyn Notifier>],
    frame: TimeFrame,
    retention_hours: i64,
) -> Result<TrendingOutcome> {
    let snapshot = match feeds.fetch_trending(frame).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(%err, "trending feed fetch failed");
            return Ok(TrendingOutcome::FetchFailed);
        }
    };
    process_trending(store, keywords, notifiers, retention_hours, snapshot).await
}

/// Novelty logic for the accumulating trending feed.
///
/// The label guard is the at-most-once guarantee: processing is keyed on the
/// feed's own update identifier, so a re-served label is skipped even if its
/// entries were edited in place.
pub async fn process_trending(
    store: &SnapshotStore,
    keywords: &Keywords,
    notifiers: &[Box<dyn Notifier>],
    retention_hours: i64,
    snapshot: TrendingSnapshot,
) -> Result<TrendingOutcome> {
    if store.has_snapshot(&snapshot.updated).await? {
        info!(label = %snapshot.updated, "trending update already ingested");
        return Ok(TrendingOutcome::AlreadySeen);
    }
    info!(label = %snapshot.updated, "new trending update");

    let known = store.known_trending_ids().await?;
    let new_entries: Vec<_> = snapshot
        .data
        .iter()
        .filter(|entry| !known.contains(&entry.cve))
        .cloned()
        .collect();
    if new_entries.is_empty() {
        info!("no new vulnerabilities");
        return Ok(TrendingOutcome::NoNewEntries);
    }
    info!(count = new_entries.len(), "new vulnerabilities found");

    // Persist before notifying; if the write fails nothing has been sent
    // yet and the next tick starts over cleanly.
    store.write_snapshot(&snapshot).await?;

    let tagged: Vec<Tagged<_>> = new_entries
        .into_iter()
        .map(|entry| {
            let relevance = keywords.assess_trending(&entry);
            let term = relevance.matched.as_deref().unwrap_or("-");
            if relevance.hit {
                warn!(cve = %entry.cve, term, "keyword hit");
            } else {
                info!(cve = %entry.cve, term, "no keyword match");
            }
            Tagged {
                relevant: relevance.hit,
                entry,
            }
        })
        .collect();

    for notifier in notifiers {
        notifier.send_trending(&tagged).await;
    }

    let pruned = store.prune_snapshots(retention_hours).await?;
    Ok(TrendingOutcome::Notified {
        new_entries: tagged.len(),
        pruned: pruned.len(),
    })
}

pub async fn run_last(
    store: &SnapshotStore,
    feeds: &FeedClient,
    keywords: &Keywords,
    notifiers: &[Box<dyn Notifier>],
) -> Result<WindowOutcome> {
    let entries = match feeds.fetch_last().await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(%err, "last feed fetch failed");
            return Ok(WindowOutcome::FetchFailed);
        }
    };
    process_last(store, keywords, notifiers, entries).await
}

/// Novelty logic for the fixed-size last-N feed: diff against the single
/// stored window, then replace it wholesale.
pub async fn process_last(
    store: &SnapshotStore,
    keywords: &Keywords,
    notifiers: &[Box<dyn Notifier>],
    entries: Vec<LastCve>,
) -> Result<WindowOutcome> {
    let existing = store.read_window().await?;
    let existing_ids: HashSet<&str> = if existing.is_empty() {
        // First-ever run: establish the baseline file even though no "new"
        // determination has been made, then diff against it.
        store.write_window(&entries).await?;
        entries.iter().map(|entry| entry.id.as_str()).collect()
    } else {
        existing.iter().map(|entry| entry.id.as_str()).collect()
    };

    let new_entries: Vec<_> = entries
        .iter()
        .filter(|entry| !existing_ids.contains(entry.id.as_str()))
        .cloned()
        .collect();
    if new_entries.is_empty() {
        info!("no new vulnerabilities");
        return Ok(WindowOutcome::NoNewEntries);
    }
    info!(count = new_entries.len(), "new vulnerabilities found");

    // This feed only pushes the relevant entries; misses are just logged.
    let mut tagged = Vec::new();
    for entry in new_entries.iter() {
        let relevance = keywords.assess_last(entry);
        let term = relevance.matched.as_deref().unwrap_or("-");
        if relevance.hit {
            warn!(cve = %entry.id, term, "keyword hit");
            tagged.push(Tagged {
                relevant: true,
                entry: entry.clone(),
            });
        } else {
            info!(cve = %entry.id, term, "no keyword match");
        }
    }

    for notifier in notifiers {
        notifier.send_last(&tagged).await;
    }

    // Replace after notifying. A failure here means possible duplicate
    // notifications next tick, which we accept over losing them.
    if let Err(err) = store.write_window(&entries).await {
        error!(%err, "window replace failed; entries may notify again next tick");
    }

    Ok(WindowOutcome::Notified {
        new_entries: new_entries.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;
    use vulnwatch_core::TrendingCve;

    #[derive(Default)]
    struct Recorded {
        trending: Mutex<Vec<Vec<(bool, String)>>>,
        last: Mutex<Vec<Vec<(bool, String)>>>,
    }

    struct RecordingNotifier(Arc<Recorded>);

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send_trending(&self, items: &[Tagged<TrendingCve>]) {
            self.0.trending.lock().expect("lock").push(
                items
                    .iter()
                    .map(|t| (t.relevant, t.entry.cve.clone()))
                    .collect(),
            );
        }

        async fn send_last(&self, items: &[Tagged<LastCve>]) {
            self.0.last.lock().expect("lock").push(
                items
                    .iter()
                    .map(|t| (t.relevant, t.entry.id.clone()))
                    .collect(),
            );
        }
    }

    fn recording() -> (Arc<Recorded>, Vec<Box<dyn Notifier>>) {
        let recorded = Arc::new(Recorded::default());
        let notifiers: Vec<Box<dyn Notifier>> =
            vec![Box::new(RecordingNotifier(Arc::clone(&recorded)))];
        (recorded, notifiers)
    }

    fn keywords() -> Keywords {
        Keywords {
            vendor: vec!["acme".into()],
            product: vec![],
            others: vec![],
        }
    }

    fn trending_snapshot(label: &str, cves: &[(&str, &str)]) -> TrendingSnapshot {
        serde_json::from_value(json!({
            "updated": label,
            "data": cves
                .iter()
                .map(|(id, vendor)| json!({
                    "cve": id,
                    "vendors": [{"vendor": vendor, "products": [{"product": "widget"}]}],
                }))
                .collect::<Vec<_>>(),
        }))
        .expect("snapshot fixture")
    }

    fn last_entries(cves: &[(&str, &str)]) -> Vec<LastCve> {
        cves.iter()
            .map(|(id, vendor)| {
                serde_json::from_value(json!({
                    "id": id,
                    "summary": "s",
                    "vulnerable_product": [format!("cpe:2.3:a:{vendor}:widget:1.0:*:*:*:*:*:*:*")],
                }))
                .expect("entry fixture")
            })
            .collect()
    }

    #[tokio::test]
    async fn repeated_label_never_notifies_twice() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let (recorded, notifiers) = recording();
        let payload = trending_snapshot("2024-01-01 00:00:00", &[("CVE-1", "acme")]);

        let first = process_trending(&store, &keywords(), &notifiers, 24, payload.clone())
            .await
            .expect("first run");
        let second = process_trending(&store, &keywords(), &notifiers, 24, payload)
            .await
            .expect("second run");

        assert!(matches!(first, TrendingOutcome::Notified { new_entries: 1, .. }));
        assert_eq!(second, TrendingOutcome::AlreadySeen);
        assert_eq!(recorded.trending.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn known_entries_are_filtered_from_a_new_label() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        store
            .write_snapshot(&trending_snapshot("2024-01-01 00:00:00", &[("CVE-1", "x")]))
            .await
            .expect("seed");
        let (recorded, notifiers) = recording();

        let outcome = process_trending(
            &store,
            &keywords(),
            &notifiers,
            24,
            trending_snapshot("2024-01-01 01:00:00", &[("CVE-1", "x"), ("CVE-2", "x")]),
        )
        .await
        .expect("run");

        assert!(matches!(outcome, TrendingOutcome::Notified { new_entries: 1, .. }));
        let batches = recorded.trending.lock().expect("lock");
        assert_eq!(batches[0], vec![(false, "CVE-2".to_string())]);

        // the persisted snapshot holds the full payload, not just the delta
        let raw: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("2024-01-01 01:00:00.json")).expect("read"),
        )
        .expect("parse");
        assert_eq!(raw["data"].as_array().expect("data").len(), 2);
    }

    #[tokio::test]
    async fn label_with_zero_new_entries_is_not_persisted() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        store
            .write_snapshot(&trending_snapshot("2024-01-01 00:00:00", &[("CVE-1", "x")]))
            .await
            .expect("seed");
        let (recorded, notifiers) = recording();

        let outcome = process_trending(
            &store,
            &keywords(),
            &notifiers,
            24,
            trending_snapshot("2024-01-01 01:00:00", &[("CVE-1", "x")]),
        )
        .await
        .expect("run");

        assert_eq!(outcome, TrendingOutcome::NoNewEntries);
        assert!(!store.has_snapshot("2024-01-01 01:00:00").await.expect("has"));
        assert!(recorded.trending.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn new_entries_keep_feed_order_and_carry_both_tags() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        store
            .write_snapshot(&trending_snapshot("2024-01-01 00:00:00", &[("CVE-2", "x")]))
            .await
            .expect("seed");
        let (recorded, notifiers) = recording();

        process_trending(
            &store,
            &keywords(),
            &notifiers,
            24,
            trending_snapshot(
                "2024-01-01 01:00:00",
                &[("CVE-5", "acme"), ("CVE-2", "x"), ("CVE-1", "x"), ("CVE-4", "acme")],
            ),
        )
        .await
        .expect("run");

        let batches = recorded.trending.lock().expect("lock");
        assert_eq!(
            batches[0],
            vec![
                (true, "CVE-5".to_string()),
                (false, "CVE-1".to_string()),
                (true, "CVE-4".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn pruning_runs_after_a_notified_update() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        store
            .write_snapshot(&trending_snapshot("2024-01-01 00:00:00", &[("CVE-1", "x")]))
            .await
            .expect("seed");
        let (_recorded, notifiers) = recording();

        let outcome = process_trending(
            &store,
            &keywords(),
            &notifiers,
            24,
            trending_snapshot("2024-01-03 00:00:00", &[("CVE-2", "x")]),
        )
        .await
        .expect("run");

        assert_eq!(
            outcome,
            TrendingOutcome::Notified {
                new_entries: 1,
                pruned: 1
            }
        );
        assert_eq!(
            store.snapshot_labels().await.expect("labels"),
            vec!["2024-01-03 00:00:00"]
        );
    }

    #[tokio::test]
    async fn first_last_run_bootstraps_the_window_without_notifying() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let (recorded, notifiers) = recording();
        let payload = last_entries(&[("CVE-A", "acme"), ("CVE-B", "x")]);

        let outcome = process_last(&store, &keywords(), &notifiers, payload.clone())
            .await
            .expect("run");

        assert_eq!(outcome, WindowOutcome::NoNewEntries);
        assert!(recorded.last.lock().expect("lock").is_empty());
        let window = store.read_window().await.expect("window");
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].id, "CVE-A");
    }

    #[tokio::test]
    async fn window_is_replaced_and_only_relevant_entries_notify() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let (recorded, notifiers) = recording();

        process_last(&store, &keywords(), &notifiers, last_entries(&[("CVE-A", "x")]))
            .await
            .expect("bootstrap");
        let outcome = process_last(
            &store,
            &keywords(),
            &notifiers,
            last_entries(&[("CVE-B", "acme"), ("CVE-C", "x")]),
        )
        .await
        .expect("second run");

        assert_eq!(outcome, WindowOutcome::Notified { new_entries: 2 });
        let batches = recorded.last.lock().expect("lock");
        assert_eq!(batches[0], vec![(true, "CVE-B".to_string())]);

        // full replace, not a merge with the previous window
        let window = store.read_window().await.expect("window");
        let ids: Vec<_> = window.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids, vec!["CVE-B", "CVE-C"]);
    }

    #[tokio::test]
    async fn unchanged_window_does_not_rewrite_or_notify() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let (recorded, notifiers) = recording();
        let payload = last_entries(&[("CVE-A", "acme")]);

        process_last(&store, &keywords(), &notifiers, payload.clone())
            .await
            .expect("bootstrap");
        let outcome = process_last(&store, &keywords(), &notifiers, payload)
            .await
            .expect("repeat");

        assert_eq!(outcome, WindowOutcome::NoNewEntries);
        assert!(recorded.last.lock().expect("lock").is_empty());
    }

    #[test]
    fn config_parses_with_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "db_hours": 48,
                "keywords": {"vendor": ["acme"], "product": [], "others": ["rce"]},
                "bot": {"feishu": {"enabled": true, "key": "k"}},
                "proxy": "http://127.0.0.1:7890"
            }"#,
        )
        .expect("config");
        assert_eq!(config.db_hours, 48);
        assert_eq!(config.store_dir, PathBuf::from("db"));
        assert_eq!(config.keywords.vendor, vec!["acme"]);
        assert!(config.bot["feishu"].enabled);
        assert_eq!(config.proxy.as_deref(), Some("http://127.0.0.1:7890"));
    }
}
