//! Search index provider trait definition.
//!
//! This module defines the abstract interface for search index operations,
//! allowing for different backend implementations (OpenSearch, Elasticsearch, etc.).

use async_trait::async_trait;

use crate::errors::SearchIndexError;
use crate::types::BulkWriteSummary;
use pg_to_es_shared::DocumentMutation;

/// Abstracts the underlying search index implementation (OpenSearch, Elasticsearch, etc.).
///
/// Only the document write path is used: index and mapping creation are
/// provisioned outside the sync. Implementations are injected into
/// `SearchIndexClient` to enable dependency injection and easy testing with
/// mock implementations.
#[async_trait]
pub trait SearchIndexProvider: Send + Sync {
    /// Apply mutations in a single bulk request.
    ///
    /// Upserts replace the whole document under its id; deletes of missing
    /// documents succeed.
    ///
    /// # Arguments
    ///
    /// * `mutations` - Mutations to apply, in order
    ///
    /// # Returns
    ///
    /// * `Ok(BulkWriteSummary)` - One result per mutation, in request order
    /// * `Err(SearchIndexError)` - If the request as a whole failed
    async fn bulk_write(
        &self,
        mutations: &[DocumentMutation],
    ) -> Result<BulkWriteSummary, SearchIndexError>;

    /// Check if the search engine is healthy and reachable.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - If the search engine is healthy
    /// * `Ok(false)` - If the search engine is unhealthy
    /// * `Err(SearchIndexError)` - If the health check fails to execute
    async fn health_check(&self) -> Result<bool, SearchIndexError>;
}
