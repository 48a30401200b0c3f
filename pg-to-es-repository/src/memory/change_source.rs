//! In-memory change source.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::SourceError;
use crate::interfaces::ChangeSource;
use crate::types::{
    ChangeRecord, LinkLookup, SnapshotPage, SnapshotRow, SnapshotTable, TxHorizon, UndecodableEntry,
};
use pg_to_es_shared::{ChangeEvent, OperationKind, PrimaryKey, ResumePosition, RowPayload};

type ViewFn = Arc<dyn Fn(&TableRows<'_>) -> Vec<RowPayload> + Send + Sync>;

/// Read access to the current rows, handed to view definitions.
pub struct TableRows<'a> {
    tables: &'a HashMap<String, HashMap<String, RowPayload>>,
}

impl TableRows<'_> {
    /// Rows of `table`, ordered by key.
    pub fn rows(&self, table: &str) -> Vec<&RowPayload> {
        let mut rows: Vec<(&String, &RowPayload)> = self
            .tables
            .get(table)
            .map(|rows| rows.iter().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.0.cmp(b.0));
        rows.into_iter().map(|(_, row)| row).collect()
    }
}

struct LogEntry {
    record: ChangeRecord,
    txid: u64,
    committed: bool,
}

struct SourceState {
    log: Vec<LogEntry>,
    sequence: u64,
    head: u64,
    purged_through: u64,
    next_txid: u64,
    running: BTreeSet<u64>,
    // table -> primary key JSON -> row
    rows: HashMap<String, HashMap<String, RowPayload>>,
    views: HashMap<String, ViewFn>,
    failures_left: usize,
    fetch_calls: usize,
}

impl Default for SourceState {
    fn default() -> Self {
        Self {
            log: Vec::new(),
            sequence: 0,
            head: 0,
            purged_through: 0,
            next_txid: 1,
            running: BTreeSet::new(),
            rows: HashMap::new(),
            views: HashMap::new(),
            failures_left: 0,
            fetch_calls: 0,
        }
    }
}

impl SourceState {
    /// Append an entry in a new transaction, committed unless `open`.
    fn append(&mut self, record: impl FnOnce(ResumePosition) -> ChangeRecord, open: bool) -> u64 {
        let txid = self.next_txid;
        self.next_txid += 1;
        self.sequence += 1;
        let sequence = self.sequence;

        self.log.push(LogEntry {
            record: record(ResumePosition::stream(sequence)),
            txid,
            committed: !open,
        });
        if open {
            self.running.insert(txid);
        } else {
            self.head = self.head.max(sequence);
        }
        sequence
    }

    fn apply(&mut self, event: &ChangeEvent) {
        let rows = self.rows.entry(event.table.clone()).or_default();
        match (&event.operation, &event.payload) {
            (OperationKind::Delete, _) => {
                rows.remove(&key_json(&event.primary_key));
            }
            (_, Some(row)) => {
                rows.insert(key_json(&event.primary_key), row.clone());
            }
            (_, None) => {}
        }
    }

    fn relation_rows(&self, relation: &str) -> Result<Vec<RowPayload>, SourceError> {
        if let Some(view) = self.views.get(relation) {
            return Ok(view(&TableRows { tables: &self.rows }));
        }
        Ok(self
            .rows
            .get(relation)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn take_failure(&mut self) -> Result<(), SourceError> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(SourceError::unavailable("injected source outage"));
        }
        Ok(())
    }
}

/// A change log and table contents held in memory.
///
/// Writes made through [`insert`](Self::insert), [`update`](Self::update) and
/// [`delete`](Self::delete) change the current rows and append a committed
/// change-log entry, like the triggers on a real database would. A write
/// started with [`begin_insert`](Self::begin_insert) holds its sequence number
/// in a running transaction until [`commit`](Self::commit) or
/// [`roll_back`](Self::roll_back).
#[derive(Default)]
pub struct MemoryChangeSource {
    state: Mutex<SourceState>,
}

fn key_json(key: &PrimaryKey) -> String {
    serde_json::to_string(key).unwrap_or_default()
}

fn key_values(row: &RowPayload, columns: &[String], relation: &str) -> Result<Vec<Value>, SourceError> {
    columns
        .iter()
        .map(|column| {
            row.get(column)
                .cloned()
                .ok_or_else(|| SourceError::query(format!("Column {} missing from {}", column, relation)))
        })
        .collect()
}

impl MemoryChangeSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row that existed before the change log started.
    pub async fn seed_row(&self, table: &str, key: PrimaryKey, row: RowPayload) {
        let mut state = self.state.lock().await;
        state
            .rows
            .entry(table.to_string())
            .or_default()
            .insert(key_json(&key), row);
    }

    /// Define a view computed from the current rows on every read.
    pub async fn define_view<F>(&self, name: &str, view: F)
    where
        F: Fn(&TableRows<'_>) -> Vec<RowPayload> + Send + Sync + 'static,
    {
        self.state.lock().await.views.insert(name.to_string(), Arc::new(view));
    }

    /// Insert a row, returning the change-log sequence.
    pub async fn insert(&self, table: &str, key: PrimaryKey, row: RowPayload) -> u64 {
        let event = ChangeEvent::insert(table, key, row, ResumePosition::stream(0));
        self.write(event).await
    }

    /// Update a row, returning the change-log sequence.
    pub async fn update(&self, table: &str, key: PrimaryKey, row: RowPayload) -> u64 {
        let event = ChangeEvent::update(table, key, row, ResumePosition::stream(0));
        self.write(event).await
    }

    /// Delete a row, returning the change-log sequence.
    ///
    /// The entry carries the old row, as the change-log trigger records it.
    pub async fn delete(&self, table: &str, key: PrimaryKey) -> u64 {
        let mut event = ChangeEvent::delete(table, key, ResumePosition::stream(0));
        {
            let state = self.state.lock().await;
            event.payload = state
                .rows
                .get(table)
                .and_then(|rows| rows.get(&key_json(&event.primary_key)))
                .cloned();
        }
        self.write(event).await
    }

    async fn write(&self, event: ChangeEvent) -> u64 {
        let mut state = self.state.lock().await;
        state.apply(&event);
        state.append(
            |position| ChangeRecord::Event(ChangeEvent { position, ..event }),
            false,
        )
    }

    /// Insert a row in a transaction that stays open.
    ///
    /// The sequence is taken now, but neither the entry nor the row is
    /// visible until [`commit`](Self::commit).
    pub async fn begin_insert(&self, table: &str, key: PrimaryKey, row: RowPayload) -> u64 {
        let event = ChangeEvent::insert(table, key, row, ResumePosition::stream(0));
        let mut state = self.state.lock().await;
        state.append(
            |position| ChangeRecord::Event(ChangeEvent { position, ..event }),
            true,
        )
    }

    /// Commit the open transaction that took `sequence`.
    pub async fn commit(&self, sequence: u64) {
        let mut state = self.state.lock().await;
        let Some(index) = state
            .log
            .iter()
            .position(|e| !e.committed && e.record.position().sequence() == sequence)
        else {
            return;
        };

        state.log[index].committed = true;
        let txid = state.log[index].txid;
        state.running.remove(&txid);
        state.head = state.head.max(sequence);
        if let ChangeRecord::Event(event) = state.log[index].record.clone() {
            state.apply(&event);
        }
    }

    /// Roll back the open transaction that took `sequence`, leaving a gap.
    pub async fn roll_back(&self, sequence: u64) {
        let mut state = self.state.lock().await;
        let Some(index) = state
            .log
            .iter()
            .position(|e| !e.committed && e.record.position().sequence() == sequence)
        else {
            return;
        };

        let entry = state.log.remove(index);
        state.running.remove(&entry.txid);
    }

    /// Append a committed entry that cannot be decoded, as a trigger writing
    /// an unsupported operation would.
    pub async fn append_undecodable(&self, table: &str, operation: &str) -> u64 {
        let mut state = self.state.lock().await;
        let table = table.to_string();
        let operation = operation.to_string();
        state.append(
            |position| {
                let sequence = position.sequence();
                ChangeRecord::Undecodable(UndecodableEntry {
                    sequence,
                    reason: format!("Unknown operation '{}' at sequence {}", operation, sequence),
                    raw: json!({"sequence": sequence, "table_name": table, "operation": operation}),
                    table,
                    key: String::new(),
                })
            },
            false,
        )
    }

    /// Drop change-log entries up to and including `sequence`.
    pub async fn purge_through(&self, sequence: u64) {
        let mut state = self.state.lock().await;
        state.log.retain(|e| e.record.position().sequence() > sequence);
        state.purged_through = state.purged_through.max(sequence);
    }

    /// Make the next `calls` trait calls fail as unavailable.
    pub async fn fail_next(&self, calls: usize) {
        self.state.lock().await.failures_left = calls;
    }

    /// Number of `fetch_changes` calls served so far, failed ones included.
    pub async fn fetch_calls(&self) -> usize {
        self.state.lock().await.fetch_calls
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn fetch_changes(&self, after: u64, limit: usize) -> Result<Vec<ChangeRecord>, SourceError> {
        let mut state = self.state.lock().await;
        state.fetch_calls += 1;
        state.take_failure()?;

        Ok(state
            .log
            .iter()
            .filter(|e| e.committed && e.record.position().sequence() > after)
            .take(limit)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn head_position(&self) -> Result<u64, SourceError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        Ok(state.head)
    }

    async fn purged_through(&self) -> Result<u64, SourceError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        Ok(state.purged_through)
    }

    async fn horizon(&self) -> Result<TxHorizon, SourceError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        let xmax = state.next_txid;
        Ok(TxHorizon {
            xmin: state.running.first().copied().unwrap_or(xmax),
            xmax,
        })
    }

    async fn snapshot_page(
        &self,
        table: &SnapshotTable,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<SnapshotPage, SourceError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        let mut rows: Vec<SnapshotRow> = Vec::new();
        for row in state.relation_rows(table.relation())? {
            let key = Value::Array(key_values(&row, &table.key_columns, table.relation())?).to_string();
            if after_key.map_or(true, |after| key.as_str() > after) {
                rows.push(SnapshotRow { key, row });
            }
        }

        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows.truncate(limit);
        let is_last = rows.len() < limit;

        Ok(SnapshotPage { rows, is_last })
    }

    async fn fetch_rows(
        &self,
        table: &SnapshotTable,
        keys: &[PrimaryKey],
    ) -> Result<Vec<RowPayload>, SourceError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        let wanted: Vec<Vec<Value>> = keys
            .iter()
            .map(|key| {
                table
                    .key_columns
                    .iter()
                    .map(|c| key.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        let mut found = Vec::new();
        for row in state.relation_rows(table.relation())? {
            let values = key_values(&row, &table.key_columns, table.relation())?;
            if wanted.contains(&values) {
                found.push(row);
            }
        }
        Ok(found)
    }

    async fn lookup(
        &self,
        link: &LinkLookup,
        value: &Value,
        columns: &[String],
    ) -> Result<Vec<Vec<Value>>, SourceError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        let mut found: Vec<Vec<Value>> = Vec::new();
        for row in state.relation_rows(&link.table)? {
            if row.get(&link.column) != Some(value) {
                continue;
            }
            let values = key_values(&row, columns, &link.table)?;
            if !found.contains(&values) {
                found.push(values);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64) -> RowPayload {
        let mut row = RowPayload::new();
        row.insert("id".to_string(), json!(id));
        row
    }

    fn key(id: i64) -> PrimaryKey {
        PrimaryKey::new().with("id", id)
    }

    fn table() -> SnapshotTable {
        SnapshotTable::new("t", vec!["id".to_string()])
    }

    fn sequences(records: &[ChangeRecord]) -> Vec<u64> {
        records.iter().map(|r| r.position().sequence()).collect()
    }

    #[tokio::test]
    async fn test_changes_are_sequenced() {
        let source = MemoryChangeSource::new();
        source.insert("t", key(1), row(1)).await;
        source.delete("t", key(1)).await;
        source.insert("t", key(2), row(2)).await;

        let records = source.fetch_changes(1, 10).await.unwrap();
        assert_eq!(sequences(&records), vec![2, 3]);
        let delete = records[0].event().unwrap();
        assert!(delete.is_delete());
        assert_eq!(delete.payload, Some(row(1)));
        assert_eq!(source.head_position().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_open_transaction_hides_entry_and_holds_horizon() {
        let source = MemoryChangeSource::new();
        let open = source.begin_insert("t", key(1), row(1)).await;
        source.insert("t", key(2), row(2)).await;

        assert_eq!(sequences(&source.fetch_changes(0, 10).await.unwrap()), vec![2]);
        assert_eq!(source.head_position().await.unwrap(), 2);
        let taken = source.horizon().await.unwrap();
        assert_eq!(taken, TxHorizon { xmin: 1, xmax: 3 });

        source.commit(open).await;
        assert_eq!(sequences(&source.fetch_changes(0, 10).await.unwrap()), vec![1, 2]);
        assert!(source.horizon().await.unwrap().has_passed(&taken));
        assert_eq!(source.fetch_rows(&table(), &[key(1)]).await.unwrap(), vec![row(1)]);
    }

    #[tokio::test]
    async fn test_roll_back_leaves_gap() {
        let source = MemoryChangeSource::new();
        let open = source.begin_insert("t", key(1), row(1)).await;
        source.insert("t", key(2), row(2)).await;
        source.roll_back(open).await;

        assert_eq!(sequences(&source.fetch_changes(0, 10).await.unwrap()), vec![2]);
        let horizon = source.horizon().await.unwrap();
        assert_eq!(horizon.xmin, horizon.xmax);
        assert!(source.fetch_rows(&table(), &[key(1)]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_pages_in_key_order() {
        let source = MemoryChangeSource::new();
        for id in [3, 1, 2] {
            source.seed_row("t", key(id), row(id)).await;
        }

        let first = source.snapshot_page(&table(), None, 2).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        assert!(!first.is_last);

        let second = source
            .snapshot_page(&table(), Some(&first.rows[1].key), 2)
            .await
            .unwrap();
        assert_eq!(second.rows.len(), 1);
        assert_eq!(second.rows[0].row["id"], json!(3));
        assert!(second.is_last);
    }

    #[tokio::test]
    async fn test_views_and_link_lookup() {
        let source = MemoryChangeSource::new();
        source.seed_row("t", key(1), row(1)).await;
        for (id, parent) in [(10, 1), (11, 1)] {
            let mut link = RowPayload::new();
            link.insert("id".to_string(), json!(id));
            link.insert("t_id".to_string(), json!(parent));
            link.insert("tag".to_string(), json!("x"));
            source.seed_row("link", key(id), link).await;
        }
        source
            .define_view("t_view", |tables: &TableRows<'_>| {
                tables
                    .rows("t")
                    .into_iter()
                    .map(|t| {
                        let mut row = t.clone();
                        row.insert("links".to_string(), json!(tables.rows("link").len()));
                        row
                    })
                    .collect()
            })
            .await;

        let view = table().with_view("t_view");
        let rows = source.fetch_rows(&view, &[key(1), key(2)]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["links"], json!(2));

        let link = LinkLookup {
            table: "link".to_string(),
            column: "tag".to_string(),
        };
        let parents = source.lookup(&link, &json!("x"), &["t_id".to_string()]).await.unwrap();
        assert_eq!(parents, vec![vec![json!(1)]]);
    }

    #[tokio::test]
    async fn test_purge_and_failure_injection() {
        let source = MemoryChangeSource::new();
        for id in 1..=4 {
            source.insert("t", key(id), row(id)).await;
        }
        source.purge_through(2).await;
        assert_eq!(source.purged_through().await.unwrap(), 2);
        assert_eq!(source.fetch_changes(0, 10).await.unwrap().len(), 2);

        source.fail_next(1).await;
        assert!(source.fetch_changes(0, 10).await.unwrap_err().is_retryable());
        assert!(source.fetch_changes(0, 10).await.is_ok());
    }
}
