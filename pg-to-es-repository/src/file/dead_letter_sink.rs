//! Append-only JSON Lines dead-letter sink.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::StoreError;
use crate::interfaces::DeadLetterSink;
use pg_to_es_shared::DeadLetterRecord;

/// Writes one JSON record per line to a file, syncing after every call.
pub struct JsonlDeadLetterSink {
    path: PathBuf,
    // Serializes appends from concurrent callers
    lock: Mutex<()>,
}

impl JsonlDeadLetterSink {
    /// Create a sink appending to `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the dead-letter file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl DeadLetterSink for JsonlDeadLetterSink {
    async fn record(&self, records: &[DeadLetterRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buffer).await?;
        file.sync_data().await?;

        for record in records {
            warn!(
                stage = ?record.stage,
                table = %record.table,
                key = %record.key,
                position = %record.position,
                reason = %record.reason,
                "Dead-lettered record"
            );
        }
        Ok(())
    }
}
