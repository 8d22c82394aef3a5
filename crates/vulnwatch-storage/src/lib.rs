//! Flat-file snapshot store: novelty lookups, window replacement and
//! time-based retention pruning for the two feed shapes.
//!
//! Layout: one `<label>.json` file per trending snapshot (labels are
//! `YYYY-mm-dd HH:MM:SS` strings handed out by the feed, so lexicographic
//! order is chronological order) plus a single fixed-named window file.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use vulnwatch_core::{LastCve, TrendingSnapshot};

pub const CRATE_NAME: &str = "vulnwatch-storage";

/// Fixed name of the "last N" window file, excluded from snapshot listings.
pub const WINDOW_FILE: &str = "last.json";

const LABEL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("listing {}: {source}", path.display())]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("deleting {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A persisted file no longer parses. Never downgraded to "no data":
    /// doing so would re-notify every historical entry as new.
    #[error("corrupt store file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot label {label:?} is not a timestamp: {source}")]
    Label {
        label: String,
        #[source]
        source: chrono::ParseError,
    },
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_path(&self, label: &str) -> PathBuf {
        self.root.join(format!("{label}.json"))
    }

    fn window_path(&self) -> PathBuf {
        self.root.join(WINDOW_FILE)
    }

    async fn ensure_root(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::Write {
                path: self.root.clone(),
                source,
            })
    }

    /// All persisted snapshot labels, ascending. An absent or empty store
    /// yields an empty list, not an error.
    pub async fn snapshot_labels(&self) -> Result<Vec<String>, StorageError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::List {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut labels = Vec::new();
        loop {
            let entry = dir.next_entry().await.map_err(|source| StorageError::List {
                path: self.root.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(WINDOW_FILE) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                labels.push(stem.to_string());
            }
        }
        labels.sort();
        Ok(labels)
    }

    /// True iff a snapshot with this exact label has been persisted. This is
    /// the at-most-once guard for reprocessing a feed update.
    pub async fn has_snapshot(&self, label: &str) -> Result<bool, StorageError> {
        let path = self.snapshot_path(label);
        fs::try_exists(&path)
            .await
            .map_err(|source| StorageError::Read { path, source })
    }

    /// Union of every entry id across all persisted snapshots. O(total
    /// historical entries); snapshot count is bounded by retention.
    pub async fn known_trending_ids(&self) -> Result<HashSet<String>, StorageError> {
        let mut ids = HashSet::new();
        for label in self.snapshot_labels().await? {
            let snapshot = self.read_snapshot(&label).await?;
            ids.extend(snapshot.data.into_iter().map(|entry| entry.cve));
        }
        Ok(ids)
    }

    async fn read_snapshot(&self, label: &str) -> Result<TrendingSnapshot, StorageError> {
        let path = self.snapshot_path(label);
        let raw = fs::read(&path).await.map_err(|source| StorageError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| StorageError::Corrupt { path, source })
    }

    /// Persist one trending poll under its label. Heavy per-entry fields are
    /// dropped by the record's serialization contract; the file is never
    /// rewritten afterwards (label uniqueness is the caller's job via
    /// [`has_snapshot`](Self::has_snapshot)).
    pub async fn write_snapshot(&self, snapshot: &TrendingSnapshot) -> Result<(), StorageError> {
        self.ensure_root().await?;
        let path = self.snapshot_path(&snapshot.updated);
        let raw = serde_json::to_vec_pretty(snapshot).expect("snapshot serializes");
        fs::write(&path, raw)
            .await
            .map_err(|source| StorageError::Write { path, source })
    }

    /// Delete every snapshot older than `retention_hours` relative to the
    /// newest label. No-op on an empty store; deleting an already-missing
    /// file is not an error. Returns the pruned labels.
    pub async fn prune_snapshots(&self, retention_hours: i64) -> Result<Vec<String>, StorageError> {
        let labels = self.snapshot_labels().await?;
        let Some(newest) = labels.last() else {
            return Ok(Vec::new());
        };
        let newest = parse_label(newest)?;
        let retention = Duration::hours(retention_hours);

        let mut pruned = Vec::new();
        for label in &labels {
            if newest - parse_label(label)? > retention {
                let path = self.snapshot_path(label);
                match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => return Err(StorageError::Remove { path, source }),
                }
                debug!(label, "pruned expired snapshot");
                pruned.push(label.clone());
            }
        }
        Ok(pruned)
    }

    /// The persisted "last N" window, or an empty list if it has never been
    /// written (bootstrap case).
    pub async fn read_window(&self) -> Result<Vec<LastCve>, StorageError> {
        let path = self.window_path();
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StorageError::Read { path, source }),
        };
        serde_json::from_slice(&raw).map_err(|source| StorageError::Corrupt { path, source })
    }

    /// Replace the window wholesale. Full replace, never a merge.
    pub async fn write_window(&self, entries: &[LastCve]) -> Result<(), StorageError> {
        self.ensure_root().await?;
        let path = self.window_path();
        let raw = serde_json::to_vec_pretty(entries).expect("window serializes");
        fs::write(&path, raw)
            .await
            .map_err(|source| StorageError::Write { path, source })
    }
}

fn parse_label(label: &str) -> Result<NaiveDateTime, StorageError> {
    NaiveDateTime::parse_from_str(label, LABEL_FORMAT).map_err(|source| StorageError::Label {
        label: label.to_string(),
        source,
    })
}
