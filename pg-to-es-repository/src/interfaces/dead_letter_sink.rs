//! Dead-letter sink trait definition.

use async_trait::async_trait;

use crate::errors::StoreError;
use pg_to_es_shared::DeadLetterRecord;

/// Durable destination for records the pipeline could not apply.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Persist `records`; durable when this returns.
    async fn record(&self, records: &[DeadLetterRecord]) -> Result<(), StoreError>;
}
