//! In-memory search index.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::errors::SearchIndexError;
use crate::interfaces::SearchIndexProvider;
use crate::types::{BulkItemResult, BulkWriteSummary, ItemStatus};
use pg_to_es_shared::{DocumentMutation, MutationKind};

#[derive(Default)]
struct IndexState {
    documents: HashMap<(String, String), Map<String, Value>>,
    applied: Vec<DocumentMutation>,
    conflicts: HashSet<String>,
    transient: HashMap<String, usize>,
    unavailable_left: usize,
    bulk_calls: usize,
}

/// Documents held in a map keyed by `(index, id)`, with bulk semantics
/// matching the real engine: upserts replace, deletes of missing documents
/// succeed.
#[derive(Default)]
pub struct MemorySearchIndex {
    state: Mutex<IndexState>,
}

impl MemorySearchIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored document, if any.
    pub async fn document(&self, index: &str, id: &str) -> Option<Map<String, Value>> {
        self.state
            .lock()
            .await
            .documents
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of documents in `index`.
    pub async fn document_count(&self, index: &str) -> usize {
        self.state
            .lock()
            .await
            .documents
            .keys()
            .filter(|(i, _)| i == index)
            .count()
    }

    /// Every successfully applied mutation, in application order.
    pub async fn applied(&self) -> Vec<DocumentMutation> {
        self.state.lock().await.applied.clone()
    }

    /// Number of bulk requests received, failed ones included.
    pub async fn bulk_calls(&self) -> usize {
        self.state.lock().await.bulk_calls
    }

    /// Reject every write of document `id` with a mapping conflict.
    pub async fn reject_document(&self, id: &str) {
        self.state.lock().await.conflicts.insert(id.to_string());
    }

    /// Fail the next `times` writes of document `id` with a retryable status.
    pub async fn fail_document(&self, id: &str, times: usize) {
        self.state.lock().await.transient.insert(id.to_string(), times);
    }

    /// Fail the next `requests` bulk requests as a whole.
    pub async fn fail_next_requests(&self, requests: usize) {
        self.state.lock().await.unavailable_left = requests;
    }
}

#[async_trait]
impl SearchIndexProvider for MemorySearchIndex {
    async fn bulk_write(
        &self,
        mutations: &[DocumentMutation],
    ) -> Result<BulkWriteSummary, SearchIndexError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.bulk_calls += 1;

        if state.unavailable_left > 0 {
            state.unavailable_left -= 1;
            return Err(SearchIndexError::unavailable("injected index outage"));
        }

        let mut results = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            let id = &mutation.document_id;
            let status = if state.conflicts.contains(id) {
                ItemStatus::MappingConflict(format!(
                    "mapper_parsing_exception: document {} does not match the mapping",
                    id
                ))
            } else if let Some(left) = state.transient.get_mut(id).filter(|left| **left > 0) {
                *left -= 1;
                ItemStatus::Retryable("es_rejected_execution_exception: queue full".to_string())
            } else {
                let key = (mutation.index.clone(), id.clone());
                match &mutation.kind {
                    MutationKind::Upsert { body } => {
                        state.documents.insert(key, body.clone());
                    }
                    MutationKind::Delete => {
                        state.documents.remove(&key);
                    }
                }
                state.applied.push(mutation.clone());
                ItemStatus::Applied
            };

            results.push(BulkItemResult {
                index: mutation.index.clone(),
                document_id: id.clone(),
                status,
            });
        }

        Ok(BulkWriteSummary::from_results(results))
    }

    async fn health_check(&self) -> Result<bool, SearchIndexError> {
        Ok(self.state.lock().await.unavailable_left == 0)
    }
}
