// src/dedup.rs
//! Durable per-creator dedup state.
//!
//! All records persist together as one JSON document; every mutation is
//! flushed with a temp-file + rename so the file is never torn. Commits
//! from concurrent creator cycles serialize through one async mutex.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const DEFAULT_SEEN_CAP: usize = 200;

/// Per-creator record of delivered activity. `seen` is insertion-ordered
/// (front = oldest inserted) and capped; an ID present in it is never
/// dispatched again.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DedupRecord {
    pub last_seen_id: Option<String>,
    #[serde(default)]
    pub seen: VecDeque<String>,
}

impl DedupRecord {
    pub fn contains(&self, item_id: &str) -> bool {
        self.seen.iter().any(|id| id == item_id)
    }

    fn insert(&mut self, item_id: String, cap: usize) {
        if self.contains(&item_id) {
            self.last_seen_id = Some(item_id);
            return;
        }
        self.seen.push_back(item_id.clone());
        while self.seen.len() > cap {
            self.seen.pop_front();
        }
        self.last_seen_id = Some(item_id);
    }
}

pub struct DedupStore {
    path: PathBuf,
    cap: usize,
    records: Mutex<HashMap<String, DedupRecord>>,
}

impl DedupStore {
    /// Load the document; an absent file bootstraps an empty mapping.
    pub fn open(path: impl Into<PathBuf>, cap: usize) -> Result<Self> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("parsing dedup state at {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading dedup state at {}", path.display()))
            }
        };
        Ok(Self {
            path,
            cap: cap.max(1),
            records: Mutex::new(records),
        })
    }

    /// Snapshot of one creator's record; empty record when none exists.
    pub async fn load(&self, creator_id: &str) -> DedupRecord {
        self.records
            .lock()
            .await
            .get(creator_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_new(&self, creator_id: &str, item_id: &str) -> bool {
        let records = self.records.lock().await;
        match records.get(creator_id) {
            Some(rec) => !rec.contains(item_id),
            None => true,
        }
    }

    /// Record `item_id` as delivered and flush the whole document. On a
    /// flush failure the in-memory mutation is rolled back and the error
    /// surfaces to the caller, which must treat the dispatch as not
    /// idempotent-safe.
    pub async fn commit(&self, creator_id: &str, item_id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let prior = records.get(creator_id).cloned();

        records
            .entry(creator_id.to_string())
            .or_default()
            .insert(item_id.to_string(), self.cap);

        if let Err(e) = crate::persist::write_json_atomic(&self.path, &*records) {
            match prior {
                Some(rec) => {
                    records.insert(creator_id.to_string(), rec);
                }
                None => {
                    records.remove(creator_id);
                }
            }
            return Err(e).context("flushing dedup state");
        }
        Ok(())
    }

    /// Administrative reset: clear one creator's record, or every record.
    /// The next cycle treats all currently-visible items as new.
    pub async fn reset(&self, creator_id: Option<&str>) -> Result<()> {
        let mut records = self.records.lock().await;
        let prior = records.clone();
        match creator_id {
            Some(id) => {
                records.remove(id);
            }
            None => records.clear(),
        }
        if let Err(e) = crate::persist::write_json_atomic(&self.path, &*records) {
            *records = prior;
            return Err(e).context("flushing dedup state after reset");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_in(dir: &tempfile::TempDir, cap: usize) -> DedupStore {
        DedupStore::open(dir.path().join("state.json"), cap).unwrap()
    }

    #[tokio::test]
    async fn absent_file_bootstraps_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir, 10);
        let rec = store.load("42").await;
        assert!(rec.last_seen_id.is_none());
        assert!(rec.seen.is_empty());
        assert!(store.is_new("42", "a").await);
    }

    #[tokio::test]
    async fn commit_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = DedupStore::open(&path, 10).unwrap();
        store.commit("42", "a").await.unwrap();
        store.commit("42", "b").await.unwrap();
        assert!(!store.is_new("42", "a").await);
        assert_eq!(store.load("42").await.last_seen_id.as_deref(), Some("b"));

        let reopened = DedupStore::open(&path, 10).unwrap();
        assert!(!reopened.is_new("42", "a").await);
        assert!(!reopened.is_new("42", "b").await);
        assert!(reopened.is_new("42", "c").await);
    }

    #[tokio::test]
    async fn seen_set_evicts_oldest_inserted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir, 3);
        for id in ["a", "b", "c", "d"] {
            store.commit("42", id).await.unwrap();
        }
        let rec = store.load("42").await;
        assert_eq!(rec.seen.len(), 3);
        // "a" was inserted first, so it is the one evicted.
        assert!(store.is_new("42", "a").await);
        assert!(!store.is_new("42", "d").await);
        assert_eq!(rec.last_seen_id.as_deref(), Some("d"));
    }

    #[tokio::test]
    async fn reset_clears_one_or_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir, 10);
        store.commit("42", "a").await.unwrap();
        store.commit("43", "x").await.unwrap();

        store.reset(Some("42")).await.unwrap();
        assert!(store.is_new("42", "a").await);
        assert!(!store.is_new("43", "x").await);

        store.reset(None).await.unwrap();
        assert!(store.is_new("43", "x").await);
    }

    #[tokio::test]
    async fn failed_flush_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = DedupStore::open(dir.path().join("sub").join("state.json"), 10).unwrap();
        // Drop a regular file where the state directory should go, so
        // the flush cannot succeed.
        std::fs::write(dir.path().join("sub"), b"x").unwrap();

        assert!(store.commit("42", "a").await.is_err());
        // The rollback keeps the item dispatchable on retry.
        assert!(store.is_new("42", "a").await);
    }

    #[tokio::test]
    async fn recommit_of_seen_id_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir, 10);
        store.commit("42", "a").await.unwrap();
        store.commit("42", "b").await.unwrap();
        store.commit("42", "a").await.unwrap();
        let rec = store.load("42").await;
        assert_eq!(rec.seen.len(), 2);
        assert_eq!(rec.last_seen_id.as_deref(), Some("a"));
    }
}
