//! Change source trait definition.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::SourceError;
use crate::types::{ChangeRecord, LinkLookup, SnapshotPage, SnapshotTable, TxHorizon};
use pg_to_es_shared::{PrimaryKey, RowPayload};

/// Read access to the relational source's change history and current rows.
///
/// Change-log entries carry a strictly increasing sequence number; the
/// records returned by [`fetch_changes`](ChangeSource::fetch_changes) are
/// positioned at `ResumePosition::Stream { sequence }`.
///
/// Sequence numbers are taken inside the writing transaction, so an entry
/// can become visible after entries with higher numbers. Readers use
/// [`horizon`](ChangeSource::horizon) to tell a gap that is still being
/// written from one that was rolled back.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Fetch up to `limit` committed change-log entries with sequence greater
    /// than `after`, in sequence order.
    ///
    /// An entry that cannot be decoded is returned as
    /// [`ChangeRecord::Undecodable`] rather than failing the whole fetch.
    async fn fetch_changes(&self, after: u64, limit: usize) -> Result<Vec<ChangeRecord>, SourceError>;

    /// Sequence number of the most recent committed entry, `0` if empty.
    async fn head_position(&self) -> Result<u64, SourceError>;

    /// Highest sequence number removed by retention, `0` if nothing was purged.
    ///
    /// Reading after a sequence lower than this would silently skip changes.
    async fn purged_through(&self) -> Result<u64, SourceError>;

    /// Current transaction id horizon.
    async fn horizon(&self) -> Result<TxHorizon, SourceError>;

    /// Read one page of the current rows of `table`, ordered by pagination
    /// key, starting after `after_key`.
    async fn snapshot_page(
        &self,
        table: &SnapshotTable,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<SnapshotPage, SourceError>;

    /// Read the current rows of `table` with the given keys.
    ///
    /// Keys without a row are left out; row order is unspecified.
    async fn fetch_rows(
        &self,
        table: &SnapshotTable,
        keys: &[PrimaryKey],
    ) -> Result<Vec<RowPayload>, SourceError>;

    /// Distinct values of `columns` over the rows of `link.table` whose
    /// `link.column` equals `value`.
    async fn lookup(
        &self,
        link: &LinkLookup,
        value: &Value,
        columns: &[String],
    ) -> Result<Vec<Vec<Value>>, SourceError>;
}
