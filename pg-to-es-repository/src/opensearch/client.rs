//! OpenSearch client implementation.
//!
//! This module provides the concrete implementation of `SearchIndexProvider`
//! using the OpenSearch Rust client.

use async_trait::async_trait;
use opensearch::{
    http::request::JsonBody,
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    BulkParts, OpenSearch,
};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument};
use url::Url;

use crate::errors::SearchIndexError;
use crate::interfaces::SearchIndexProvider;
use crate::types::{BulkItemResult, BulkWriteSummary, ItemStatus};
use pg_to_es_shared::{DocumentMutation, MutationKind};

/// OpenSearch client implementation.
///
/// Writes document mutations through the `_bulk` endpoint: upserts become
/// `index` actions (full replacement under the derived id) and deletes become
/// `delete` actions.
///
/// # Example
///
/// ```ignore
/// let client = OpenSearchClient::new("http://localhost:9200").await?;
/// let summary = client.bulk_write(&mutations).await?;
/// println!("{} of {} applied", summary.succeeded, summary.total);
/// ```
pub struct OpenSearchClient {
    client: OpenSearch,
}

impl OpenSearchClient {
    /// Create a new OpenSearch client connected to the specified URL.
    ///
    /// # Arguments
    ///
    /// * `url` - The OpenSearch server URL (e.g., "http://localhost:9200")
    ///
    /// # Returns
    ///
    /// * `Ok(OpenSearchClient)` - A new client instance
    /// * `Err(SearchIndexError)` - If connection setup fails
    pub async fn new(url: &str) -> Result<Self, SearchIndexError> {
        let parsed_url =
            Url::parse(url).map_err(|e| SearchIndexError::validation(format!("Invalid URL: {}", e)))?;

        let conn_pool = SingleNodeConnectionPool::new(parsed_url);
        let transport = TransportBuilder::new(conn_pool)
            .disable_proxy()
            .build()
            .map_err(|e| SearchIndexError::connection(e.to_string()))?;

        let client = OpenSearch::new(transport);

        info!(url = %url, "Created OpenSearch client");

        Ok(Self { client })
    }

    /// Build the NDJSON lines of a bulk request.
    fn bulk_body(mutations: &[DocumentMutation]) -> Vec<JsonBody<Value>> {
        let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(mutations.len() * 2);

        for mutation in mutations {
            match &mutation.kind {
                MutationKind::Upsert { body: doc } => {
                    body.push(
                        json!({"index": {"_index": mutation.index, "_id": mutation.document_id}})
                            .into(),
                    );
                    body.push(Value::Object(doc.clone()).into());
                }
                MutationKind::Delete => {
                    body.push(
                        json!({"delete": {"_index": mutation.index, "_id": mutation.document_id}})
                            .into(),
                    );
                }
            }
        }

        body
    }

    /// Turn a bulk response into one result per mutation.
    ///
    /// The bulk API answers items in request order, each keyed by its action
    /// name with a `status` and, on failure, an `error` object.
    fn parse_bulk_response(
        response: &Value,
        mutations: &[DocumentMutation],
    ) -> Result<Vec<BulkItemResult>, SearchIndexError> {
        let items = response
            .get("items")
            .and_then(|i| i.as_array())
            .ok_or_else(|| SearchIndexError::parse("Bulk response has no items"))?;

        if items.len() != mutations.len() {
            return Err(SearchIndexError::parse(format!(
                "Bulk response has {} items for {} mutations",
                items.len(),
                mutations.len()
            )));
        }

        let mut results = Vec::with_capacity(items.len());
        for (item, mutation) in items.iter().zip(mutations) {
            let action = item
                .as_object()
                .and_then(|o| o.values().next())
                .ok_or_else(|| SearchIndexError::parse("Malformed bulk item"))?;

            let status = action
                .get("status")
                .and_then(|s| s.as_u64())
                .ok_or_else(|| SearchIndexError::parse("Bulk item has no status"))?
                as u16;

            let error = action.get("error");
            let error_type = error.and_then(|e| e.get("type")).and_then(|t| t.as_str());
            let reason = match error {
                Some(e) => format!(
                    "{}: {}",
                    error_type.unwrap_or("error"),
                    e.get("reason").and_then(|r| r.as_str()).unwrap_or("unknown")
                ),
                None => format!("status {}", status),
            };

            results.push(BulkItemResult {
                index: mutation.index.clone(),
                document_id: mutation.document_id.clone(),
                status: ItemStatus::classify(status, error_type, &reason, mutation.is_delete()),
            });
        }

        Ok(results)
    }
}

#[async_trait]
impl SearchIndexProvider for OpenSearchClient {
    /// Apply mutations with one `_bulk` request.
    ///
    /// Transport failures and 429/5xx answers for the whole request are
    /// retryable request-level errors; per-document failures are classified in
    /// the returned summary.
    #[instrument(skip(self, mutations), fields(count = mutations.len()))]
    async fn bulk_write(
        &self,
        mutations: &[DocumentMutation],
    ) -> Result<BulkWriteSummary, SearchIndexError> {
        if mutations.is_empty() {
            return Ok(BulkWriteSummary::default());
        }

        let response = self
            .client
            .bulk(BulkParts::None)
            .body(Self::bulk_body(mutations))
            .send()
            .await
            .map_err(|e| SearchIndexError::connection(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Bulk request failed");
            let msg = format!("Bulk failed with status {}: {}", status, error_body);
            return match status.as_u16() {
                429 | 500..=599 => Err(SearchIndexError::unavailable(msg)),
                _ => Err(SearchIndexError::rejected(msg)),
            };
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SearchIndexError::parse(e.to_string()))?;

        let results = Self::parse_bulk_response(&body, mutations)?;
        let summary = BulkWriteSummary::from_results(results);

        debug!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Bulk request completed"
        );
        Ok(summary)
    }

    async fn health_check(&self) -> Result<bool, SearchIndexError> {
        let response = self
            .client
            .ping()
            .send()
            .await
            .map_err(|e| SearchIndexError::connection(e.to_string()))?;

        Ok(response.status_code().is_success())
    }
}
