//! Index writer for the sync pipeline.
//!
//! Applies a batch of mutations with bulk requests, retrying the items the
//! search engine reported as transient and giving up on the others.

use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::errors::PipelineError;
use pg_to_es_repository::{ItemStatus, SearchIndexClient};
use pg_to_es_shared::{Batch, DocumentMutation};

/// Configuration for the index writer.
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    /// Retries of a transiently failing item before it is dead-lettered.
    pub max_retries: u32,
    /// Delay between item retries.
    pub backoff: BackoffPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Final outcome of one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The index reflects the mutation.
    Applied,
    /// The mutation was given up on.
    DeadLettered(String),
}

/// Outcome of writing one batch. Every mutation is either applied or
/// dead-lettered.
#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    /// Number of applied mutations.
    pub applied: usize,
    /// Mutations given up on, with the reason.
    pub dead_lettered: Vec<(DocumentMutation, String)>,
    /// Number of item retries performed.
    pub retried: usize,
}

impl WriteResult {
    /// Record the outcome of one mutation.
    pub fn record(&mut self, mutation: DocumentMutation, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Applied => self.applied += 1,
            ItemOutcome::DeadLettered(reason) => self.dead_lettered.push((mutation, reason)),
        }
    }

    /// Number of mutations resolved.
    pub fn resolved(&self) -> usize {
        self.applied + self.dead_lettered.len()
    }
}

/// Writes mutation batches to the search index.
pub struct IndexWriter {
    client: SearchIndexClient,
    config: WriterConfig,
}

impl IndexWriter {
    /// Create a new writer with default configuration.
    pub fn new(client: SearchIndexClient) -> Self {
        Self {
            client,
            config: WriterConfig::default(),
        }
    }

    /// Create a new writer with custom configuration.
    pub fn with_config(client: SearchIndexClient, config: WriterConfig) -> Self {
        Self { client, config }
    }

    /// Apply a batch.
    ///
    /// # Returns
    ///
    /// * `Ok(WriteResult)` - Every mutation applied or dead-lettered
    /// * `Err(PipelineError::IndexUnavailable)` - A bulk request failed as a
    ///   whole; the batch has to be retried
    /// * `Err(PipelineError::IndexError)` - The engine refused the request
    #[instrument(skip(self, batch), fields(batch = batch.id(), mutations = batch.len()))]
    pub async fn write(&self, batch: &Batch<DocumentMutation>) -> Result<WriteResult, PipelineError> {
        let mut result = WriteResult::default();
        let mut pending: Vec<DocumentMutation> = batch.items().to_vec();
        let mut attempt: u32 = 0;

        while !pending.is_empty() {
            let summary = self.client.bulk_write(&pending).await?;

            let mut retry = Vec::new();
            let mut last_reason = String::new();
            for (mutation, item) in pending.into_iter().zip(summary.results) {
                match item.status {
                    ItemStatus::Applied => result.record(mutation, ItemOutcome::Applied),
                    ItemStatus::Retryable(reason) if attempt < self.config.max_retries => {
                        last_reason = reason;
                        retry.push(mutation);
                    }
                    ItemStatus::Retryable(reason) => result.record(
                        mutation,
                        ItemOutcome::DeadLettered(format!(
                            "Gave up after {} retries: {}",
                            self.config.max_retries, reason
                        )),
                    ),
                    ItemStatus::MappingConflict(reason) => {
                        result.record(mutation, ItemOutcome::DeadLettered(format!("Mapping conflict: {}", reason)))
                    }
                    ItemStatus::Rejected(reason) => {
                        result.record(mutation, ItemOutcome::DeadLettered(format!("Rejected: {}", reason)))
                    }
                }
            }

            if !retry.is_empty() {
                let delay: Duration = self.config.backoff.delay(attempt);
                attempt += 1;
                result.retried += retry.len();
                warn!(
                    attempt = attempt,
                    items = retry.len(),
                    delay_ms = delay.as_millis() as u64,
                    reason = %last_reason,
                    "Retrying failed items"
                );
                tokio::time::sleep(delay).await;
            }
            pending = retry;
        }

        debug!(
            applied = result.applied,
            dead_lettered = result.dead_lettered.len(),
            retried = result.retried,
            "Batch written"
        );
        Ok(result)
    }
}
