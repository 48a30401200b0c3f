//! Checkpoint bookkeeping for the orchestrator.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::errors::PipelineError;
use pg_to_es_repository::CheckpointStore;
use pg_to_es_shared::ResumePosition;

/// Owns the persisted position of a pipeline.
///
/// The position only moves forward, and observers see it after it is durable.
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    current: Option<ResumePosition>,
    published: Arc<watch::Sender<Option<ResumePosition>>>,
}

impl Checkpointer {
    /// Load the stored position and publish it.
    pub async fn load(
        store: Arc<dyn CheckpointStore>,
        published: Arc<watch::Sender<Option<ResumePosition>>>,
    ) -> Result<Self, PipelineError> {
        let current = store.load().await.map_err(PipelineError::checkpoint)?;
        published.send_replace(current.clone());

        Ok(Self {
            store,
            current,
            published,
        })
    }

    /// Last durable position.
    pub fn current(&self) -> Option<&ResumePosition> {
        self.current.as_ref()
    }

    /// Persist `position` as applied.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The position was saved
    /// * `Ok(false)` - The position is not ahead of the current one and was refused
    /// * `Err(PipelineError::CheckpointError)` - If the store failed
    pub async fn commit(&mut self, position: &ResumePosition) -> Result<bool, PipelineError> {
        if let Some(current) = &self.current {
            if position < current {
                warn!(current = %current, refused = %position, "Refusing to move checkpoint backwards");
                return Ok(false);
            }
            if position == current {
                return Ok(false);
            }
        }

        self.store
            .save(position)
            .await
            .map_err(PipelineError::checkpoint)?;
        self.current = Some(position.clone());
        self.published.send_replace(self.current.clone());

        debug!(position = %position, "Checkpoint committed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_to_es_repository::memory::MemoryCheckpointStore;

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let store = Arc::new(MemoryCheckpointStore::with_position(ResumePosition::stream(5)));
        let (tx, rx) = watch::channel(None);
        let mut checkpointer = Checkpointer::load(store.clone(), Arc::new(tx)).await.unwrap();
        assert_eq!(*rx.borrow(), Some(ResumePosition::stream(5)));

        assert!(!checkpointer.commit(&ResumePosition::stream(3)).await.unwrap());
        assert!(!checkpointer.commit(&ResumePosition::stream(5)).await.unwrap());
        assert!(checkpointer.commit(&ResumePosition::stream(8)).await.unwrap());

        assert_eq!(store.history().await, vec![ResumePosition::stream(8)]);
        assert_eq!(*rx.borrow(), Some(ResumePosition::stream(8)));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_position() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let (tx, rx) = watch::channel(None);
        let mut checkpointer = Checkpointer::load(store.clone(), Arc::new(tx)).await.unwrap();

        store.fail_next_saves(1).await;
        let err = checkpointer.commit(&ResumePosition::stream(1)).await.unwrap_err();

        assert!(err.is_retryable());
        assert!(checkpointer.current().is_none());
        assert!(rx.borrow().is_none());
    }
}
