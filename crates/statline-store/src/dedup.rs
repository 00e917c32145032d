//! Content-hash index answering "have we already persisted this payload?"
//!
//! Fetching a page that hasn't changed since the last run should cost one
//! request, not a duplicate write. The index is scoped by content type: the
//! same bytes recorded as `roster_json` and as `boxscore_json` are two
//! distinct entries.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use statline_core::CollectError;

use crate::hash::canonical_hash;

/// One fingerprinted payload. Append-only except for `last_seen_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentHash {
    pub hash: String,
    pub content_type: String,
    pub source: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Deduplication index keyed by `(content_type, hash)`.
///
/// Holds the index in memory; with a backing file it is loaded on open and
/// rewritten on every mutation, so a restarted run still skips known content.
/// The internal lock serializes writers to the index; it is held only for the
/// map access and file write, never across a network call.
#[derive(Debug)]
pub struct DedupStore {
    index: Mutex<HashMap<(String, String), ContentHash>>,
    path: Option<PathBuf>,
}

impl DedupStore {
    /// Volatile store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            index: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// Open (or create) a file-backed store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CollectError> {
        let path = path.into();
        let mut index = HashMap::new();

        if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                CollectError::Storage(format!(
                    "failed to read dedup index {}: {e}",
                    path.display()
                ))
            })?;
            let entries: Vec<ContentHash> = serde_json::from_str(&raw).map_err(|e| {
                CollectError::Storage(format!(
                    "corrupt dedup index {}: {e}",
                    path.display()
                ))
            })?;
            for entry in entries {
                index.insert((entry.content_type.clone(), entry.hash.clone()), entry);
            }
            tracing::debug!(path = %path.display(), entries = index.len(), "Loaded dedup index");
        }

        Ok(Self {
            index: Mutex::new(index),
            path: Some(path),
        })
    }

    /// Check whether this payload was already recorded under `content_type`.
    pub async fn check_duplicate(
        &self,
        content: &str,
        content_type: &str,
    ) -> (bool, Option<ContentHash>) {
        let hash = canonical_hash(content);
        let index = self.index.lock().await;
        let existing = index
            .get(&(content_type.to_string(), hash))
            .cloned();
        (existing.is_some(), existing)
    }

    /// Record a payload. Idempotent: a repeat of the same `(content,
    /// content_type)` touches `last_seen_at` but never creates a second entry.
    pub async fn record(
        &self,
        content: &str,
        content_type: &str,
        source: &str,
    ) -> Result<ContentHash, CollectError> {
        let hash = canonical_hash(content);
        let key = (content_type.to_string(), hash.clone());
        let now = Utc::now();

        let mut index = self.index.lock().await;
        let entry = match index.entry(key) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                existing.last_seen_at = now;
                existing.clone()
            }
            Entry::Vacant(vacant) => {
                let entry = ContentHash {
                    hash,
                    content_type: content_type.to_string(),
                    source: source.to_string(),
                    first_seen_at: now,
                    last_seen_at: now,
                };
                tracing::debug!(
                    content_type = %content_type,
                    source = %source,
                    hash = %&entry.hash[..8],
                    "New content recorded"
                );
                vacant.insert(entry.clone());
                entry
            }
        };

        self.persist(&index)?;
        Ok(entry)
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.is_empty()
    }

    fn persist(&self, index: &HashMap<(String, String), ContentHash>) -> Result<(), CollectError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let entries: Vec<&ContentHash> = index.values().collect();
        let raw = serde_json::to_string_pretty(&entries)?;
        write_atomic(path, &raw)
            .map_err(|e| CollectError::Storage(format!("failed to write dedup index: {e}")))
    }
}

/// Write via a temp file + rename so a crash mid-write can't corrupt the index.
fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOXSCORE: &str = r#"{"home": "ravens", "away": "chiefs", "score": [21, 17]}"#;

    #[tokio::test]
    async fn test_first_sighting_is_not_duplicate() {
        let store = DedupStore::in_memory();
        let (is_dup, existing) = store.check_duplicate(BOXSCORE, "boxscore_json").await;
        assert!(!is_dup);
        assert!(existing.is_none());
    }

    #[tokio::test]
    async fn test_record_then_check_is_duplicate() {
        let store = DedupStore::in_memory();
        store
            .record(BOXSCORE, "boxscore_json", "nflstats")
            .await
            .unwrap();

        let (is_dup, existing) = store.check_duplicate(BOXSCORE, "boxscore_json").await;
        assert!(is_dup);
        assert_eq!(existing.unwrap().source, "nflstats");
    }

    #[tokio::test]
    async fn test_record_twice_keeps_one_entry() {
        let store = DedupStore::in_memory();
        let first = store
            .record(BOXSCORE, "boxscore_json", "nflstats")
            .await
            .unwrap();
        let second = store
            .record(BOXSCORE, "boxscore_json", "nflstats")
            .await
            .unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.first_seen_at, second.first_seen_at);
        assert!(second.last_seen_at >= first.last_seen_at);
    }

    #[tokio::test]
    async fn test_same_bytes_different_type_are_distinct() {
        let store = DedupStore::in_memory();
        store
            .record(BOXSCORE, "boxscore_json", "nflstats")
            .await
            .unwrap();
        store
            .record(BOXSCORE, "roster_json", "nflstats")
            .await
            .unwrap();

        assert_eq!(store.len().await, 2);
        let (dup_box, _) = store.check_duplicate(BOXSCORE, "boxscore_json").await;
        let (dup_roster, _) = store.check_duplicate(BOXSCORE, "roster_json").await;
        assert!(dup_box);
        assert!(dup_roster);
    }

    #[tokio::test]
    async fn test_reordered_json_is_still_a_duplicate() {
        let store = DedupStore::in_memory();
        store
            .record(BOXSCORE, "boxscore_json", "nflstats")
            .await
            .unwrap();

        let reordered = r#"{"score": [21, 17], "away": "chiefs", "home": "ravens"}"#;
        let (is_dup, _) = store.check_duplicate(reordered, "boxscore_json").await;
        assert!(is_dup);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.json");

        {
            let store = DedupStore::open(&path).unwrap();
            store
                .record(BOXSCORE, "boxscore_json", "nflstats")
                .await
                .unwrap();
        }

        let reopened = DedupStore::open(&path).unwrap();
        assert_eq!(reopened.len().await, 1);
        let (is_dup, _) = reopened.check_duplicate(BOXSCORE, "boxscore_json").await;
        assert!(is_dup);
    }

    #[tokio::test]
    async fn test_corrupt_index_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = DedupStore::open(&path).unwrap_err();
        assert!(matches!(err, CollectError::Storage(_)));
    }
}
