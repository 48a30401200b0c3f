//! Change reader.
//!
//! Turns the pull-based [`ChangeSource`] into an ordered, restartable stream
//! of change records: an optional keyset snapshot of every configured table,
//! followed by the change log after the snapshot's watermark.
//!
//! Sequence numbers are taken before their transaction commits, so the log
//! can show a gap that a running transaction fills later. A gap is only
//! passed once every transaction that was running when it was seen has
//! finished; until then the reader holds back the entries after it.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::PipelineError;
use pg_to_es_repository::{ChangeRecord, ChangeSource, RelatedTable, SnapshotTable, TxHorizon};
use pg_to_es_shared::{ChangeEvent, PrimaryKey, ResumePosition, RowPayload};

/// Where a pipeline without a checkpoint starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialPosition {
    /// Only changes made after startup.
    FromNow,
    /// Snapshot every configured table, then stream.
    #[default]
    FullBackfill,
}

impl FromStr for InitialPosition {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "from_now" | "fromnow" => Ok(Self::FromNow),
            "full_backfill" | "fullbackfill" => Ok(Self::FullBackfill),
            other => Err(PipelineError::configuration(format!(
                "Unknown initial position '{}', expected from_now or full_backfill",
                other
            ))),
        }
    }
}

/// Configuration for the change reader.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Change-log entries or snapshot rows fetched per request.
    pub fetch_size: usize,
    /// Wait after a poll that returned nothing.
    pub poll_interval: Duration,
    /// Start policy when there is no checkpoint.
    pub initial_position: InitialPosition,
    /// Tables to snapshot during backfill, in order. Changes of a table with
    /// a view carry the view row instead of the bare table row.
    pub tables: Vec<SnapshotTable>,
    /// Tables whose changes refresh the documents of another table.
    pub related: Vec<RelatedTable>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            fetch_size: 100,
            poll_interval: Duration::from_secs(1),
            initial_position: InitialPosition::FullBackfill,
            tables: Vec::new(),
            related: Vec::new(),
        }
    }
}

/// Opens change streams over a source.
pub struct ChangeReader {
    source: Arc<dyn ChangeSource>,
    config: ReaderConfig,
}

impl ChangeReader {
    /// Create a new reader.
    pub fn new(source: Arc<dyn ChangeSource>, config: ReaderConfig) -> Self {
        Self { source, config }
    }

    /// Most recent change-log sequence of the source.
    pub async fn head_position(&self) -> Result<u64, PipelineError> {
        Ok(self.source.head_position().await?)
    }

    /// Open a stream resuming after `start`, or at the initial position when
    /// there is no checkpoint.
    ///
    /// Without a checkpoint, waits until no transaction can still commit an
    /// entry at or below the starting head.
    ///
    /// # Returns
    ///
    /// * `Ok(ChangeStream)` - Stream yielding every record after the start position
    /// * `Err(PipelineError::PositionInvalid)` - If the source purged changes after `start`
    /// * `Err(PipelineError::SourceUnavailable)` - If the source cannot be reached
    #[instrument(skip(self, cancel))]
    pub async fn open(
        &self,
        start: Option<ResumePosition>,
        cancel: CancellationToken,
    ) -> Result<ChangeStream, PipelineError> {
        let cursor = match start {
            Some(position) => {
                let purged = self.source.purged_through().await?;
                if position.sequence() < purged {
                    return Err(PipelineError::position_invalid(&position, purged));
                }
                info!(position = %position, "Resuming from checkpoint");
                position
            }
            None => {
                let head = self.settled_head().await?;
                match self.config.initial_position {
                    InitialPosition::FromNow => {
                        info!(head = head, "No checkpoint, streaming changes from now");
                        ResumePosition::stream(head)
                    }
                    InitialPosition::FullBackfill => {
                        info!(
                            watermark = head,
                            tables = self.config.tables.len(),
                            "No checkpoint, starting full backfill"
                        );
                        ResumePosition::backfill(head, 0, None)
                    }
                }
            }
        };

        Ok(ChangeStream {
            source: self.source.clone(),
            config: self.config.clone(),
            cursor,
            buffer: VecDeque::new(),
            barrier: None,
            settled_through: 0,
            cancel,
        })
    }

    /// Head sequence, returned once every transaction that was running when
    /// it was read has finished.
    async fn settled_head(&self) -> Result<u64, PipelineError> {
        let head = self.source.head_position().await?;
        let taken = self.source.horizon().await?;
        loop {
            let now = self.source.horizon().await?;
            if now.has_passed(&taken) {
                return Ok(head);
            }
            debug!(head = head, xmin = now.xmin, until = taken.xmax, "Waiting for running transactions");
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

/// A sequence gap waiting on the transactions that were running when it
/// was seen.
#[derive(Debug, Clone, Copy)]
struct GapBarrier {
    horizon: TxHorizon,
    // Highest sequence seen with the gap; every gap below it is final once
    // the horizon passes
    through: u64,
}

/// A lazy, unbounded stream of change records.
///
/// Records are yielded in position order. A failed read leaves the stream
/// where it was, so calling it again retries the same read.
pub struct ChangeStream {
    source: Arc<dyn ChangeSource>,
    config: ReaderConfig,
    // Position of the last record read from the source
    cursor: ResumePosition,
    buffer: VecDeque<ChangeRecord>,
    barrier: Option<GapBarrier>,
    // Gaps at or below this sequence will never be filled
    settled_through: u64,
    cancel: CancellationToken,
}

impl ChangeStream {
    /// Next record, or `None` once the stream is cancelled.
    pub async fn next(&mut self) -> Result<Option<ChangeRecord>, PipelineError> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }
            match self.next_page().await? {
                Some(page) => self.buffer.extend(page),
                None => return Ok(None),
            }
        }
    }

    /// Result of one read from the source: a possibly empty page of records,
    /// or `None` once the stream is cancelled.
    ///
    /// An empty page is returned after waiting out the poll interval.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ChangeRecord>>, PipelineError> {
        if !self.buffer.is_empty() {
            return Ok(Some(self.buffer.drain(..).collect()));
        }

        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            page = self.read_page() => page.map(Some),
        }
    }

    /// Position of the last record read from the source.
    pub fn position(&self) -> &ResumePosition {
        &self.cursor
    }

    /// Read the next page after the cursor.
    ///
    /// The cursor only moves after the last await of a successful read, so
    /// the future can be dropped at any point.
    async fn read_page(&mut self) -> Result<Vec<ChangeRecord>, PipelineError> {
        match self.cursor.clone() {
            ResumePosition::Backfill {
                watermark,
                table,
                last_key,
            } => self.read_snapshot(watermark, table, last_key).await,
            ResumePosition::Stream { sequence } => self.read_stream(sequence).await,
        }
    }

    async fn read_snapshot(
        &mut self,
        watermark: u64,
        table_index: usize,
        last_key: Option<String>,
    ) -> Result<Vec<ChangeRecord>, PipelineError> {
        let table = match self.config.tables.get(table_index) {
            Some(table) => table.clone(),
            None => {
                info!(watermark = watermark, "Backfill complete, streaming changes");
                self.cursor = ResumePosition::stream(watermark);
                return Ok(Vec::new());
            }
        };

        let page = self
            .source
            .snapshot_page(&table, last_key.as_deref(), self.config.fetch_size)
            .await?;

        let mut records = Vec::with_capacity(page.rows.len());
        let mut last_position = None;
        for row in page.rows {
            let key = PrimaryKey::from_row(&row.row, &table.key_columns).ok_or_else(|| {
                PipelineError::source(format!(
                    "Snapshot row of {} has no value for key columns {:?}",
                    table.relation(),
                    table.key_columns
                ))
            })?;
            let position = ResumePosition::backfill(watermark, table_index, Some(row.key));
            last_position = Some(position.clone());
            records.push(ChangeRecord::Event(ChangeEvent::insert(
                table.name.clone(),
                key,
                row.row,
                position,
            )));
        }

        debug!(table = %table.name, rows = records.len(), "Read snapshot page");

        self.cursor = match last_position {
            Some(position) if !page.is_last => position,
            _ => {
                info!(table = %table.name, "Finished table snapshot");
                ResumePosition::backfill(watermark, table_index + 1, None)
            }
        };
        Ok(records)
    }

    async fn read_stream(&mut self, after: u64) -> Result<Vec<ChangeRecord>, PipelineError> {
        if let Some(barrier) = self.barrier {
            let now = self.source.horizon().await?;
            if now.has_passed(&barrier.horizon) {
                debug!(through = barrier.through, "Sequence gaps are final");
                self.settled_through = self.settled_through.max(barrier.through);
                self.barrier = None;
            }
        }

        let records = self
            .source
            .fetch_changes(after, self.config.fetch_size)
            .await?;

        let mut sequences = Vec::with_capacity(records.len());
        let mut previous = after;
        for record in &records {
            let sequence = match record.position() {
                ResumePosition::Stream { sequence } => sequence,
                other => {
                    return Err(PipelineError::source(format!(
                        "Change log returned non-stream position {}",
                        other
                    )))
                }
            };
            if sequence <= previous {
                return Err(PipelineError::position_invalid(
                    format!("{} (after {})", sequence, previous),
                    0,
                ));
            }
            sequences.push(sequence);
            previous = sequence;
        }

        // A gap right after the cursor may hide purged entries
        if sequences.first().is_some_and(|first| *first > after + 1) {
            let purged = self.source.purged_through().await?;
            if purged > after {
                return Err(PipelineError::position_invalid(after, purged));
            }
        }

        // Deliver up to the first gap that may still be filled
        let mut last = after;
        let mut deliverable = 0;
        for sequence in &sequences {
            if *sequence != last + 1 && *sequence > self.settled_through {
                break;
            }
            last = *sequence;
            deliverable += 1;
        }

        if deliverable < sequences.len() && self.barrier.is_none() {
            let horizon = self.source.horizon().await?;
            let through = sequences.last().copied().unwrap_or(after);
            debug!(
                after = last,
                through = through,
                xmax = horizon.xmax,
                "Sequence gap, waiting for running transactions"
            );
            self.barrier = Some(GapBarrier { horizon, through });
        }

        if deliverable == 0 {
            tokio::time::sleep(self.config.poll_interval).await;
            return Ok(Vec::new());
        }

        let mut records = records;
        records.truncate(deliverable);
        let records = self.refresh_related(records).await?;

        debug!(count = records.len(), after = after, "Read change-log page");
        self.cursor = ResumePosition::stream(last);
        Ok(records)
    }

    /// Swap in view rows for tables read through a view, and follow each
    /// change of a related table with a refresh of the documents it alters.
    ///
    /// Refreshes carry the position of the change that caused them.
    async fn refresh_related(&self, records: Vec<ChangeRecord>) -> Result<Vec<ChangeRecord>, PipelineError> {
        let has_views = self.config.tables.iter().any(|t| t.view.is_some());
        if !has_views && self.config.related.is_empty() {
            return Ok(records);
        }

        // Rows to re-read for each record, as (table index, key)
        let mut plans: Vec<Vec<(usize, PrimaryKey)>> = Vec::with_capacity(records.len());
        for record in &records {
            let mut plan = Vec::new();
            if let ChangeRecord::Event(event) = record {
                if let Some(index) = self.view_table(&event.table).filter(|_| !event.is_delete()) {
                    plan.push((index, event.primary_key.clone()));
                }
                for related in self.config.related.iter().filter(|r| r.table == event.table) {
                    let Some(parent) = self.table_index(&related.parent) else {
                        continue;
                    };
                    for key in self.parent_keys(related, parent, event).await? {
                        plan.push((parent, key));
                    }
                }
            }
            plans.push(plan);
        }

        let mut wanted: HashMap<usize, Vec<PrimaryKey>> = HashMap::new();
        for (index, key) in plans.iter().flatten() {
            let keys = wanted.entry(*index).or_default();
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        let mut rows: HashMap<(usize, String), RowPayload> = HashMap::new();
        for (index, keys) in wanted {
            let table = &self.config.tables[index];
            for chunk in keys.chunks(self.config.fetch_size.max(1)) {
                for row in self.source.fetch_rows(table, chunk).await? {
                    if let Some(key) = PrimaryKey::from_row(&row, &table.key_columns) {
                        rows.insert((index, key_text(&key)), row);
                    }
                }
            }
        }

        let mut expanded = Vec::with_capacity(records.len());
        for (record, plan) in records.into_iter().zip(plans) {
            let mut event = match record {
                ChangeRecord::Event(event) => event,
                other => {
                    expanded.push(other);
                    continue;
                }
            };

            let own = self.view_table(&event.table).filter(|_| !event.is_delete());
            let mut refreshes = Vec::new();
            for (index, key) in plan {
                let Some(row) = rows.get(&(index, key_text(&key))) else {
                    continue;
                };
                if Some(index) == own && key == event.primary_key {
                    event.payload = Some(row.clone());
                    continue;
                }
                let table = &self.config.tables[index];
                refreshes.push(ChangeRecord::Event(ChangeEvent::update(
                    table.name.clone(),
                    key,
                    row.clone(),
                    event.position.clone(),
                )));
            }

            if !refreshes.is_empty() {
                debug!(table = %event.table, refreshed = refreshes.len(), "Refreshing related documents");
            }
            expanded.push(ChangeRecord::Event(event));
            expanded.extend(refreshes);
        }
        Ok(expanded)
    }

    /// Keys of the parent documents a change of a related table alters.
    async fn parent_keys(
        &self,
        related: &RelatedTable,
        parent: usize,
        event: &ChangeEvent,
    ) -> Result<Vec<PrimaryKey>, PipelineError> {
        let found: Vec<Vec<Value>> = match &related.link {
            None => {
                let Some(row) = event.payload.as_ref() else {
                    warn!(
                        table = %event.table,
                        position = %event.position,
                        "Change carries no row, cannot refresh related documents"
                    );
                    return Ok(Vec::new());
                };
                related
                    .parent_columns
                    .iter()
                    .map(|c| row.get(c).cloned())
                    .collect::<Option<Vec<_>>>()
                    .into_iter()
                    .collect()
            }
            Some(link) => {
                let Some(value) = event.primary_key.single_value() else {
                    warn!(
                        table = %event.table,
                        link = %link.table,
                        "Link lookup needs a single-column key"
                    );
                    return Ok(Vec::new());
                };
                self.source.lookup(link, value, &related.parent_columns).await?
            }
        };

        let key_columns = &self.config.tables[parent].key_columns;
        Ok(found
            .into_iter()
            .filter(|values| values.iter().all(|v| !v.is_null()))
            .map(|values| {
                key_columns
                    .iter()
                    .zip(values)
                    .fold(PrimaryKey::new(), |key, (column, value)| key.with(column.clone(), value))
            })
            .collect())
    }

    fn table_index(&self, name: &str) -> Option<usize> {
        self.config.tables.iter().position(|t| t.name == name)
    }

    fn view_table(&self, name: &str) -> Option<usize> {
        self.table_index(name)
            .filter(|index| self.config.tables[*index].view.is_some())
    }
}

fn key_text(key: &PrimaryKey) -> String {
    serde_json::to_string(key).unwrap_or_default()
}
