//! Durable resume points, one per logical task stream.
//!
//! A collector records how far it got (`"scraper X progress"`); the next run
//! loads the checkpoint and continues incrementally instead of starting over.
//! A missing checkpoint is not an error; callers supply their own default
//! starting point (e.g. "N days back").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use statline_core::CollectError;

/// The on-disk envelope around an opaque data blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub data: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

/// File-per-stream checkpoint storage with a single backup generation.
///
/// Saving overwrites the current checkpoint but first renames it to `.bak`,
/// so one prior version always survives a bad write. Writes to the same id
/// are serialized through a per-id lock; unrelated streams never wait on each
/// other.
pub struct CheckpointStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CheckpointStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CollectError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            CollectError::Storage(format!(
                "failed to create checkpoint dir {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Persist `data` as the current checkpoint for `id`, keeping the prior
    /// version as the single backup copy.
    pub async fn save_checkpoint(
        &self,
        id: &str,
        data: serde_json::Value,
    ) -> Result<(), CollectError> {
        let path = self.path_for(id)?;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let checkpoint = Checkpoint {
            checkpoint_id: id.to_string(),
            data,
            saved_at: Utc::now(),
        };
        let raw = serde_json::to_string_pretty(&checkpoint)?;

        if path.exists() {
            let backup = backup_path(&path);
            std::fs::rename(&path, &backup).map_err(|e| {
                CollectError::Storage(format!("failed to rotate checkpoint backup for '{id}': {e}"))
            })?;
        }

        std::fs::write(&path, raw).map_err(|e| {
            CollectError::Storage(format!("failed to write checkpoint '{id}': {e}"))
        })?;
        tracing::debug!(checkpoint_id = %id, path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    /// Load the current checkpoint data for `id`.
    ///
    /// Falls back to the backup generation when the primary file is missing
    /// or unreadable; returns `Ok(None)` when the stream has never saved.
    pub async fn load_checkpoint(&self, id: &str) -> Result<Option<serde_json::Value>, CollectError> {
        let path = self.path_for(id)?;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        match read_checkpoint(&path) {
            Ok(Some(checkpoint)) => return Ok(Some(checkpoint.data)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(checkpoint_id = %id, error = %e, "Primary checkpoint unreadable, trying backup");
            }
        }

        match read_checkpoint(&backup_path(&path)) {
            Ok(Some(checkpoint)) => Ok(Some(checkpoint.data)),
            Ok(None) => Ok(None),
            Err(e) => Err(CollectError::Storage(format!(
                "checkpoint '{id}' and its backup are both unreadable: {e}"
            ))),
        }
    }

    /// Full envelope (including `saved_at`) for the current checkpoint.
    pub async fn load_checkpoint_meta(&self, id: &str) -> Result<Option<Checkpoint>, CollectError> {
        let path = self.path_for(id)?;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        match read_checkpoint(&path) {
            Ok(Some(checkpoint)) => Ok(Some(checkpoint)),
            _ => read_checkpoint(&backup_path(&path)).or(Ok(None)),
        }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, CollectError> {
        if id.is_empty() {
            return Err(CollectError::Validation(
                "checkpoint id must not be empty".into(),
            ));
        }
        // Ids become file names; anything path-like is a caller bug.
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(CollectError::Validation(format!(
                "checkpoint id '{id}' contains characters outside [A-Za-z0-9._-]"
            )));
        }
        Ok(self.root.join(format!("{id}.json")))
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id.to_string()).or_default().clone()
    }
}

fn backup_path(path: &Path) -> PathBuf {
    path.with_extension("json.bak")
}

fn read_checkpoint(path: &Path) -> Result<Option<Checkpoint>, CollectError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CollectError::Storage(format!(
                "failed to read checkpoint {}: {e}",
                path.display()
            )));
        }
    };
    let checkpoint = serde_json::from_str(&raw).map_err(|e| {
        CollectError::Storage(format!("corrupt checkpoint {}: {e}", path.display()))
    })?;
    Ok(Some(checkpoint))
}
