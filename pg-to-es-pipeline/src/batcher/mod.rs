//! Change buffer and batcher.
//!
//! Accumulates change events into batches bounded by size and by the time
//! since the first unflushed event. Change-log entries the reader could not
//! decode ride along as dead letters in the batch that covers their position.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::PipelineError;
use pg_to_es_shared::{Batch, ChangeEvent, DeadLetterRecord, ResumePosition};

/// Messages from the reader pump to the batcher.
#[derive(Debug)]
pub enum ReaderMessage {
    /// Next change event.
    Event(ChangeEvent),
    /// A change-log entry that could not be decoded.
    Rejected(DeadLetterRecord),
    /// The reader stopped on a fatal error.
    Failed(PipelineError),
}

/// Messages from the batcher to the orchestrator.
#[derive(Debug)]
pub enum BatchMessage {
    /// A batch ready to be applied.
    Ready(Batch<ChangeEvent>),
    /// The reader stopped on a fatal error; every earlier event was batched.
    Failed(PipelineError),
}

/// Configuration for the batcher.
#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    /// Emit a batch once this many events are buffered.
    pub max_batch_size: usize,
    /// Emit a partial batch this long after its first event arrived.
    pub max_batch_latency: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            max_batch_latency: Duration::from_secs(1),
        }
    }
}

/// Buffer of events not yet emitted.
#[derive(Debug)]
pub struct BatchBuffer {
    max_batch_size: usize,
    pending: Vec<ChangeEvent>,
    rejected: Vec<DeadLetterRecord>,
    // Position of the last entry pushed
    position: Option<ResumePosition>,
    next_id: u64,
}

impl BatchBuffer {
    /// Create an empty buffer.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            pending: Vec::new(),
            rejected: Vec::new(),
            position: None,
            next_id: 1,
        }
    }

    /// Add an event, returning a full batch if the size bound was reached.
    pub fn push(&mut self, event: ChangeEvent) -> Option<Batch<ChangeEvent>> {
        self.position = Some(event.position.clone());
        self.pending.push(event);
        self.flush_if_full()
    }

    /// Add an undecodable entry, returning a full batch if the size bound
    /// was reached.
    pub fn push_rejected(&mut self, record: DeadLetterRecord) -> Option<Batch<ChangeEvent>> {
        self.position = Some(record.position.clone());
        self.rejected.push(record);
        self.flush_if_full()
    }

    fn flush_if_full(&mut self) -> Option<Batch<ChangeEvent>> {
        if self.len() >= self.max_batch_size {
            self.flush()
        } else {
            None
        }
    }

    /// Emit whatever is buffered.
    pub fn flush(&mut self) -> Option<Batch<ChangeEvent>> {
        let position = self.position.take()?;
        let events = std::mem::take(&mut self.pending);
        let rejected = std::mem::take(&mut self.rejected);
        let batch = Batch::new(self.next_id, events, position).with_dead_letters(rejected);
        self.next_id += 1;
        Some(batch)
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.pending.len() + self.rejected.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.position.is_none()
    }
}

/// Groups the event stream into batches.
pub struct Batcher {
    config: BatcherConfig,
}

impl Batcher {
    /// Create a new batcher.
    pub fn new(config: BatcherConfig) -> Self {
        Self { config }
    }

    /// Batch events until the event channel closes or the reader fails.
    ///
    /// The partial batch is always flushed first, so nothing read is dropped.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<ReaderMessage>,
        batches: mpsc::Sender<BatchMessage>,
    ) {
        let mut buffer = BatchBuffer::new(self.config.max_batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            let message = match deadline {
                Some(at) => {
                    tokio::select! {
                        message = events.recv() => message,
                        _ = tokio::time::sleep_until(at) => {
                            deadline = None;
                            if !Self::emit(&batches, buffer.flush()).await {
                                return;
                            }
                            continue;
                        }
                    }
                }
                None => events.recv().await,
            };

            let full = match message {
                Some(ReaderMessage::Event(event)) => {
                    if buffer.is_empty() {
                        deadline = Some(Instant::now() + self.config.max_batch_latency);
                    }
                    buffer.push(event)
                }
                Some(ReaderMessage::Rejected(record)) => {
                    if buffer.is_empty() {
                        deadline = Some(Instant::now() + self.config.max_batch_latency);
                    }
                    buffer.push_rejected(record)
                }
                Some(ReaderMessage::Failed(err)) => {
                    Self::emit(&batches, buffer.flush()).await;
                    let _ = batches.send(BatchMessage::Failed(err)).await;
                    return;
                }
                None => {
                    Self::emit(&batches, buffer.flush()).await;
                    debug!("Event channel closed, batcher stopped");
                    return;
                }
            };

            if let Some(batch) = full {
                deadline = None;
                if !Self::emit(&batches, Some(batch)).await {
                    return;
                }
            }
        }
    }

    /// Send a batch downstream. Returns `false` if the receiver is gone.
    async fn emit(batches: &mpsc::Sender<BatchMessage>, batch: Option<Batch<ChangeEvent>>) -> bool {
        match batch {
            Some(batch) => {
                debug!(
                    batch = batch.id(),
                    events = batch.len(),
                    rejected = batch.dead_letters().len(),
                    position = %batch.position(),
                    "Batch ready"
                );
                batches.send(BatchMessage::Ready(batch)).await.is_ok()
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_to_es_shared::{PrimaryKey, ResumePosition};

    fn event(sequence: u64) -> ChangeEvent {
        ChangeEvent::delete(
            "film_work",
            PrimaryKey::new().with("id", sequence),
            ResumePosition::stream(sequence),
        )
    }

    #[test]
    fn test_buffer_emits_at_size() {
        let mut buffer = BatchBuffer::new(2);
        assert!(buffer.push(event(1)).is_none());
        let batch = buffer.push(event(2)).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.position(), &ResumePosition::stream(2));
        assert!(buffer.is_empty());
        assert!(buffer.flush().is_none());

        buffer.push(event(3));
        assert_eq!(buffer.flush().unwrap().id(), 2);
    }

    #[test]
    fn test_rejected_entry_moves_batch_position() {
        let mut buffer = BatchBuffer::new(10);
        buffer.push(event(1));
        let record = DeadLetterRecord::from_source_entry(
            "film_work",
            "",
            ResumePosition::stream(2),
            "Unknown operation 'TRUNCATE' at sequence 2",
            serde_json::Value::Null,
        );
        buffer.push_rejected(record);
        assert_eq!(buffer.len(), 2);

        let batch = buffer.flush().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.dead_letters().len(), 1);
        assert_eq!(batch.position(), &ResumePosition::stream(2));
    }

    #[test]
    fn test_rejected_only_batch() {
        let mut buffer = BatchBuffer::new(1);
        let record = DeadLetterRecord::from_source_entry(
            "film_work",
            "",
            ResumePosition::stream(7),
            "Missing primary key at sequence 7",
            serde_json::Value::Null,
        );

        let batch = buffer.push_rejected(record).unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.position(), &ResumePosition::stream(7));
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_after_latency() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(16);
        let batcher = Batcher::new(BatcherConfig {
            max_batch_size: 10,
            max_batch_latency: Duration::from_millis(500),
        });
        tokio::spawn(batcher.run(event_rx, batch_tx));

        let start = Instant::now();
        event_tx.send(ReaderMessage::Event(event(1))).await.unwrap();
        event_tx.send(ReaderMessage::Event(event(2))).await.unwrap();

        match batch_rx.recv().await {
            Some(BatchMessage::Ready(batch)) => assert_eq!(batch.len(), 2),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_preserves_order_and_flushes_on_close() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(16);
        let batcher = Batcher::new(BatcherConfig {
            max_batch_size: 2,
            max_batch_latency: Duration::from_secs(60),
        });
        let handle = tokio::spawn(batcher.run(event_rx, batch_tx));

        for sequence in 1..=5 {
            event_tx.send(ReaderMessage::Event(event(sequence))).await.unwrap();
        }
        drop(event_tx);
        handle.await.unwrap();

        let mut positions = Vec::new();
        let mut sizes = Vec::new();
        while let Some(BatchMessage::Ready(batch)) = batch_rx.recv().await {
            sizes.push(batch.len());
            positions.extend(batch.items().iter().map(|e| e.position.sequence()));
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(positions, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_failure_follows_partial_batch() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(16);
        tokio::spawn(Batcher::new(BatcherConfig::default()).run(event_rx, batch_tx));

        event_tx.send(ReaderMessage::Event(event(1))).await.unwrap();
        event_tx
            .send(ReaderMessage::Failed(PipelineError::position_invalid(1, 4)))
            .await
            .unwrap();

        assert!(matches!(batch_rx.recv().await, Some(BatchMessage::Ready(_))));
        assert!(matches!(batch_rx.recv().await, Some(BatchMessage::Failed(_))));
        assert!(batch_rx.recv().await.is_none());
    }
}
