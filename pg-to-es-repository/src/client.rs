//! Search index client implementation.
//!
//! This module provides the client the pipeline writes through. It validates
//! mutations and keeps bulk requests within the configured size before
//! handing them to the underlying provider.

use std::sync::Arc;
use tracing::debug;

use crate::errors::SearchIndexError;
use crate::interfaces::SearchIndexProvider;
use crate::types::BulkWriteSummary;
use pg_to_es_shared::DocumentMutation;

/// Default number of mutations sent per bulk request.
pub const DEFAULT_MAX_BULK_MUTATIONS: usize = 1000;

/// Size limit of the bulk requests sent by [`SearchIndexClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkLimits {
    /// Mutations per bulk request; larger writes are split.
    pub max_mutations: usize,
}

impl Default for BulkLimits {
    fn default() -> Self {
        Self {
            max_mutations: DEFAULT_MAX_BULK_MUTATIONS,
        }
    }
}

/// The client the pipeline uses to write document mutations.
pub struct SearchIndexClient {
    provider: Arc<dyn SearchIndexProvider>,
    limits: BulkLimits,
}

impl SearchIndexClient {
    /// Create a client with the default bulk limits.
    pub fn new(provider: Arc<dyn SearchIndexProvider>) -> Self {
        Self::with_limits(provider, BulkLimits::default())
    }

    /// Create a client with custom bulk limits.
    pub fn with_limits(provider: Arc<dyn SearchIndexProvider>, limits: BulkLimits) -> Self {
        Self { provider, limits }
    }

    /// Check every mutation names an index and a document.
    fn validate(mutations: &[DocumentMutation]) -> Result<(), SearchIndexError> {
        for mutation in mutations {
            if mutation.index.is_empty() {
                return Err(SearchIndexError::validation(
                    "All mutations must have an index",
                ));
            }
            if mutation.document_id.is_empty() {
                return Err(SearchIndexError::validation(
                    "All mutations must have a document_id",
                ));
            }
        }
        Ok(())
    }

    /// Apply mutations to the search index.
    /// Input: mutations in application order
    /// Output: Result<BulkWriteSummary, SearchIndexError>, one result per mutation
    ///
    /// Writes above `max_mutations` are sent as consecutive bulk requests. A request-level failure aborts the remaining
    /// chunks; already applied chunks are idempotent to re-send.
    pub async fn bulk_write(
        &self,
        mutations: &[DocumentMutation],
    ) -> Result<BulkWriteSummary, SearchIndexError> {
        if mutations.is_empty() {
            return Ok(BulkWriteSummary::default());
        }

        Self::validate(mutations)?;

        let chunk_size = self.limits.max_mutations;
        if chunk_size == 0 {
            return Err(SearchIndexError::batch_size_exceeded(mutations.len(), 0));
        }

        let mut summary = BulkWriteSummary::default();
        for chunk in mutations.chunks(chunk_size) {
            let result = self.provider.bulk_write(chunk).await?;
            if result.results.len() != chunk.len() {
                return Err(SearchIndexError::parse(format!(
                    "Bulk response has {} items for {} mutations",
                    result.results.len(),
                    chunk.len()
                )));
            }
            summary.merge(result);
        }

        debug!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Bulk write completed"
        );
        Ok(summary)
    }

    /// Check if the search engine is healthy.
    pub async fn health_check(&self) -> Result<bool, SearchIndexError> {
        self.provider.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BulkItemResult, ItemStatus};
    use async_trait::async_trait;
    use pg_to_es_shared::ResumePosition;
    use tokio::sync::Mutex;

    /// Mock provider for testing
    struct MockProvider {
        requests: Mutex<Vec<usize>>,
        should_fail: bool,
        drop_last_result: bool,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                should_fail: false,
                drop_last_result: false,
            }
        }
    }

    #[async_trait]
    impl SearchIndexProvider for MockProvider {
        async fn bulk_write(
            &self,
            mutations: &[DocumentMutation],
        ) -> Result<BulkWriteSummary, SearchIndexError> {
            if self.should_fail {
                return Err(SearchIndexError::connection("Mock failure"));
            }
            self.requests.lock().await.push(mutations.len());

            let mut results: Vec<BulkItemResult> = mutations
                .iter()
                .map(|m| BulkItemResult {
                    index: m.index.clone(),
                    document_id: m.document_id.clone(),
                    status: ItemStatus::Applied,
                })
                .collect();
            if self.drop_last_result {
                results.pop();
            }
            Ok(BulkWriteSummary::from_results(results))
        }

        async fn health_check(&self) -> Result<bool, SearchIndexError> {
            Ok(!self.should_fail)
        }
    }

    fn deletes(count: usize) -> Vec<DocumentMutation> {
        (0..count)
            .map(|i| {
                DocumentMutation::delete(
                    "movies",
                    i.to_string(),
                    "content.film_work",
                    ResumePosition::stream(i as u64 + 1),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_bulk_write_splits_by_max_mutations() {
        let provider = Arc::new(MockProvider::new());
        let client = SearchIndexClient::with_limits(provider.clone(), BulkLimits { max_mutations: 2 });

        let summary = client.bulk_write(&deletes(5)).await.unwrap();

        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 5);
        assert_eq!(*provider.requests.lock().await, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_zero_limit_is_rejected() {
        let client = SearchIndexClient::with_limits(Arc::new(MockProvider::new()), BulkLimits { max_mutations: 0 });

        let result = client.bulk_write(&deletes(1)).await;
        assert!(matches!(result, Err(SearchIndexError::BatchSizeExceeded { .. })));
        assert_eq!(BulkLimits::default().max_mutations, DEFAULT_MAX_BULK_MUTATIONS);
    }

    #[tokio::test]
    async fn test_bulk_write_empty_skips_provider() {
        let provider = Arc::new(MockProvider::new());
        let client = SearchIndexClient::new(provider.clone());

        let summary = client.bulk_write(&[]).await.unwrap();

        assert_eq!(summary.total, 0);
        assert!(provider.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_write_rejects_missing_document_id() {
        let client = SearchIndexClient::new(Arc::new(MockProvider::new()));
        let mut mutations = deletes(1);
        mutations[0].document_id.clear();

        let result = client.bulk_write(&mutations).await;
        assert!(matches!(result, Err(SearchIndexError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_bulk_write_detects_short_response() {
        let mut provider = MockProvider::new();
        provider.drop_last_result = true;
        let client = SearchIndexClient::new(Arc::new(provider));

        let result = client.bulk_write(&deletes(3)).await;
        assert!(matches!(result, Err(SearchIndexError::ParseError(_))));
    }

    #[tokio::test]
    async fn test_bulk_write_propagates_connection_error() {
        let mut provider = MockProvider::new();
        provider.should_fail = true;
        let client = SearchIndexClient::new(Arc::new(provider));

        let err = client.bulk_write(&deletes(1)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!client.health_check().await.unwrap());
    }
}
