//! In-memory checkpoint store and dead-letter sink.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::StoreError;
use crate::interfaces::{CheckpointStore, DeadLetterSink};
use pg_to_es_shared::{DeadLetterRecord, ResumePosition};

#[derive(Default)]
struct CheckpointState {
    current: Option<ResumePosition>,
    history: Vec<ResumePosition>,
    failures_left: usize,
}

/// Keeps the checkpoint and every saved value in memory.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    state: Mutex<CheckpointState>,
}

impl MemoryCheckpointStore {
    /// Create a store with no checkpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store as if `position` had been saved by an earlier run.
    pub fn with_position(position: ResumePosition) -> Self {
        Self {
            state: Mutex::new(CheckpointState {
                current: Some(position),
                ..Default::default()
            }),
        }
    }

    /// Positions saved so far, oldest first.
    pub async fn history(&self) -> Vec<ResumePosition> {
        self.state.lock().await.history.clone()
    }

    /// Current checkpoint.
    pub async fn current(&self) -> Option<ResumePosition> {
        self.state.lock().await.current.clone()
    }

    /// Fail the next `saves` saves with an IO error.
    pub async fn fail_next_saves(&self, saves: usize) {
        self.state.lock().await.failures_left = saves;
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<ResumePosition>, StoreError> {
        Ok(self.state.lock().await.current.clone())
    }

    async fn save(&self, position: &ResumePosition) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected checkpoint failure",
            )));
        }
        state.current = Some(position.clone());
        state.history.push(position.clone());
        Ok(())
    }
}

/// Collects dead-letter records in memory.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetterSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records received so far.
    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, records: &[DeadLetterRecord]) -> Result<(), StoreError> {
        self.records.lock().await.extend_from_slice(records);
        Ok(())
    }
}
