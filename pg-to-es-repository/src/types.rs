//! Request and response types for source and search index operations.

use serde::Deserialize;
use serde_json::Value;

use pg_to_es_shared::{ChangeEvent, DeadLetterRecord, ResumePosition, RowPayload};

/// Outcome of one mutation inside a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    /// The mutation is reflected in the index.
    Applied,
    /// Transient failure (throttling, shard unavailable, version conflict).
    Retryable(String),
    /// The document violates the index's field-type expectations.
    MappingConflict(String),
    /// Any other permanent refusal.
    Rejected(String),
}

impl ItemStatus {
    /// Classify a bulk item from its HTTP status and error type.
    ///
    /// Deleting a document that does not exist counts as applied.
    pub fn classify(status: u16, error_type: Option<&str>, reason: &str, is_delete: bool) -> Self {
        match status {
            200..=299 => Self::Applied,
            404 if is_delete => Self::Applied,
            409 | 429 => Self::Retryable(reason.to_string()),
            500..=599 => Self::Retryable(reason.to_string()),
            _ => match error_type {
                Some(
                    "mapper_parsing_exception"
                    | "document_parsing_exception"
                    | "strict_dynamic_mapping_exception"
                    | "illegal_argument_exception",
                ) => Self::MappingConflict(reason.to_string()),
                _ => Self::Rejected(reason.to_string()),
            },
        }
    }

    /// Whether the item was applied.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Result of a bulk operation for a single mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    /// Target index.
    pub index: String,
    /// Document id.
    pub document_id: String,
    /// What happened to the mutation.
    pub status: ItemStatus,
}

/// Summary of a bulk operation, with one result per mutation in request order.
///
/// Bulk APIs may partially fail, so callers inspect `results` rather than
/// relying on the aggregate counts alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteSummary {
    /// Total number of mutations in the request.
    pub total: usize,
    /// Number of applied mutations.
    pub succeeded: usize,
    /// Number of failed mutations.
    pub failed: usize,
    /// Individual results, in the same order as the request.
    pub results: Vec<BulkItemResult>,
}

impl BulkWriteSummary {
    /// Build a summary from per-item results.
    pub fn from_results(results: Vec<BulkItemResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.status.is_applied()).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }

    /// Append the results of another summary.
    pub fn merge(&mut self, other: BulkWriteSummary) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.results.extend(other.results);
    }
}

/// A source table read during backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotTable {
    /// Table name, optionally schema-qualified.
    pub name: String,
    /// Primary key columns, used for keyset pagination.
    pub key_columns: Vec<String>,
    /// Relation the rows are read from instead of the table itself, such as
    /// a view that joins in related rows. Must expose the key columns.
    pub view: Option<String>,
}

impl SnapshotTable {
    /// A table read directly.
    pub fn new(name: impl Into<String>, key_columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            key_columns,
            view: None,
        }
    }

    /// Read rows from `view` instead.
    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.view = Some(view.into());
        self
    }

    /// Relation to select rows from.
    pub fn relation(&self) -> &str {
        self.view.as_deref().unwrap_or(&self.name)
    }
}

/// Rows of a link table that point at a changed row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LinkLookup {
    /// Link table, optionally schema-qualified.
    pub table: String,
    /// Link column holding the changed row's key value.
    pub column: String,
}

/// A table whose changes alter the documents of another table.
///
/// Either the changed row holds the parent key itself (a link table such as
/// `genre_film_work`), or the parent keys are found through a [`LinkLookup`]
/// (a `genre` renamed under every film it is linked to).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedTable {
    /// Table whose changes trigger the refresh.
    pub table: String,
    /// Table whose documents are refreshed.
    pub parent: String,
    /// Columns holding the parent key, in the parent's key column order;
    /// read from the changed row, or from the link rows when `link` is set.
    pub parent_columns: Vec<String>,
    /// Link table to search for rows referencing the changed row.
    pub link: Option<LinkLookup>,
}

/// Transaction id horizon of the source.
///
/// Every transaction with an id below `xmin` has finished; every
/// transaction that starts later gets an id of at least `xmax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHorizon {
    /// Oldest transaction id still running.
    pub xmin: u64,
    /// Next transaction id to be assigned.
    pub xmax: u64,
}

impl TxHorizon {
    /// Whether every transaction that was running when `earlier` was taken
    /// has finished.
    pub fn has_passed(&self, earlier: &TxHorizon) -> bool {
        self.xmin >= earlier.xmax
    }
}

/// A change-log entry that could not be decoded into an event.
#[derive(Debug, Clone, PartialEq)]
pub struct UndecodableEntry {
    /// Change-log sequence of the entry.
    pub sequence: u64,
    /// Table named by the entry.
    pub table: String,
    /// Primary key text as stored, empty when missing.
    pub key: String,
    /// Why decoding failed.
    pub reason: String,
    /// Raw entry columns.
    pub raw: Value,
}

impl UndecodableEntry {
    /// Dead-letter record for the entry.
    pub fn to_dead_letter(&self) -> DeadLetterRecord {
        DeadLetterRecord::from_source_entry(
            &self.table,
            &self.key,
            ResumePosition::stream(self.sequence),
            &self.reason,
            self.raw.clone(),
        )
    }
}

/// One change-log entry read from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRecord {
    /// A decoded row change.
    Event(ChangeEvent),
    /// An entry the sync cannot interpret; dead-lettered and skipped.
    Undecodable(UndecodableEntry),
}

impl ChangeRecord {
    /// Stream position of the entry.
    pub fn position(&self) -> ResumePosition {
        match self {
            Self::Event(event) => event.position.clone(),
            Self::Undecodable(entry) => ResumePosition::stream(entry.sequence),
        }
    }

    /// The decoded event, if any.
    pub fn event(&self) -> Option<&ChangeEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::Undecodable(_) => None,
        }
    }
}

impl From<ChangeEvent> for ChangeRecord {
    fn from(event: ChangeEvent) -> Self {
        Self::Event(event)
    }
}

/// One row of a snapshot page.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    /// Opaque, strictly increasing pagination key of the row.
    pub key: String,
    /// Row contents by column name.
    pub row: RowPayload,
}

/// A keyset-paginated chunk of a table snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotPage {
    /// Rows ordered by pagination key.
    pub rows: Vec<SnapshotRow>,
    /// Whether the table has no rows beyond this page.
    pub is_last: bool,
}
