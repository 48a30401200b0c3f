//! Checkpoint store trait definition.

use async_trait::async_trait;

use crate::errors::StoreError;
use pg_to_es_shared::ResumePosition;

/// Durable storage for the single "applied through" position of a pipeline.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the persisted position, `None` on first run.
    async fn load(&self) -> Result<Option<ResumePosition>, StoreError>;

    /// Persist `position`.
    ///
    /// The write must be durable when this returns: a crash right after a
    /// successful `save` must not lose it.
    async fn save(&self, position: &ResumePosition) -> Result<(), StoreError>;
}
