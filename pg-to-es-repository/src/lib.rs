//! # pg-to-es Repository
//!
//! This crate provides traits and implementations for the systems the sync
//! talks to: the PostgreSQL change source, the search index, the checkpoint
//! store and the dead-letter sink. It includes definitions for errors and
//! interfaces, concrete implementations for PostgreSQL, OpenSearch and the
//! local filesystem, and in-memory implementations for tests.

pub mod client;
pub mod errors;
pub mod file;
pub mod interfaces;
pub mod memory;
pub mod opensearch;
pub mod postgres;
pub mod types;

pub use client::{BulkLimits, SearchIndexClient};
pub use errors::{SearchIndexError, SourceError, StoreError};
pub use file::{FileCheckpointStore, JsonlDeadLetterSink};
pub use interfaces::{ChangeSource, CheckpointStore, DeadLetterSink, SearchIndexProvider};
pub use opensearch::OpenSearchClient;
pub use postgres::{ChangeLogConfig, PostgresChangeSource};
pub use types::{
    BulkItemResult, BulkWriteSummary, ChangeRecord, ItemStatus, LinkLookup, RelatedTable,
    SnapshotPage, SnapshotRow, SnapshotTable, TxHorizon, UndecodableEntry,
};
