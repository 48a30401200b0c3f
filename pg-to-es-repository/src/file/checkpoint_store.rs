//! Checkpoint store backed by one JSON file per pipeline key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::errors::StoreError;
use crate::interfaces::CheckpointStore;
use pg_to_es_shared::ResumePosition;

/// On-disk checkpoint document.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    key: String,
    position: ResumePosition,
    saved_at: DateTime<Utc>,
}

/// Stores the position at `<dir>/<key>.json`.
///
/// Saves go through a temporary file that is synced and renamed over the
/// previous checkpoint, so a reader sees either the old or the new position.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    key: String,
}

impl FileCheckpointStore {
    /// Create a store for `key` under `dir`.
    ///
    /// The key becomes a file name and is limited to ASCII letters, digits,
    /// `-`, `_` and `.`.
    pub fn new(dir: impl Into<PathBuf>, key: impl Into<String>) -> Result<Self, StoreError> {
        let key = key.into();
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StoreError::invalid_config(format!(
                "Invalid checkpoint key '{}'",
                key
            )));
        }

        Ok(Self {
            dir: dir.into(),
            key,
        })
    }

    /// Path of the checkpoint file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.key))
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(format!(".{}.json.tmp", self.key))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<ResumePosition>, StoreError> {
        let raw = match fs::read(self.path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(key = %self.key, "No checkpoint found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let file: CheckpointFile = serde_json::from_slice(&raw)?;
        if file.key != self.key {
            return Err(StoreError::serialization(format!(
                "Checkpoint file belongs to '{}', expected '{}'",
                file.key, self.key
            )));
        }

        info!(key = %self.key, position = %file.position, saved_at = %file.saved_at, "Loaded checkpoint");
        Ok(Some(file.position))
    }

    async fn save(&self, position: &ResumePosition) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;

        let file = CheckpointFile {
            key: self.key.clone(),
            position: position.clone(),
            saved_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&file)?;

        let temp = self.temp_path();
        let mut handle = fs::File::create(&temp).await?;
        handle.write_all(&body).await?;
        handle.sync_all().await?;
        drop(handle);

        fs::rename(&temp, self.path()).await?;
        sync_dir(&self.dir).await?;

        debug!(key = %self.key, position = %position, "Saved checkpoint");
        Ok(())
    }
}

/// Flush the directory entry of a rename.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}
