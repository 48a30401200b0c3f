//! Orchestrator module for the sync pipeline.
//!
//! Coordinates the reader, batcher, transformer, writer and checkpoint, and
//! owns the retry and shutdown policy.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::{BackoffPolicy, RetryState};
use crate::batcher::{BatchMessage, Batcher, BatcherConfig, ReaderMessage};
use crate::checkpoint::Checkpointer;
use crate::errors::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::reader::{ChangeReader, ChangeStream};
use crate::transformer::{TransformOutput, Transformer};
use crate::writer::IndexWriter;
use pg_to_es_repository::{ChangeRecord, CheckpointStore, DeadLetterSink};
use pg_to_es_shared::{Batch, ChangeEvent, DeadLetterRecord, ResumePosition};

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Loading the checkpoint and opening the reader.
    Starting,
    /// Applying batches.
    Running,
    /// Waiting out a transient failure.
    Backoff { attempt: u32 },
    /// Shutdown requested, resolving in-flight batches.
    Draining,
    /// Shut down cleanly.
    Stopped,
    /// Stopped on a fatal error.
    Failed,
}

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Capacity of the reader to batcher channel.
    pub event_buffer_size: usize,
    /// Capacity of the batcher to orchestrator channel.
    pub batch_buffer_size: usize,
    /// Batch bounds.
    pub batcher: BatcherConfig,
    /// Backoff for transient source, index and storage failures.
    pub backoff: BackoffPolicy,
    /// How long a shutdown may wait for in-flight batches.
    pub drain_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            batch_buffer_size: 4,
            batcher: BatcherConfig::default(),
            backoff: BackoffPolicy::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Orchestrator that coordinates the pipeline components.
///
/// The orchestrator:
/// - Loads the checkpoint and opens the change stream
/// - Runs the reader pump and the batcher as background tasks
/// - Transforms, writes and checkpoints one batch at a time
/// - Retries transient failures and stops on fatal ones
/// - Drains in-flight batches on shutdown
pub struct Orchestrator {
    reader: ChangeReader,
    transformer: Transformer,
    writer: IndexWriter,
    checkpoint_store: Arc<dyn CheckpointStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: OrchestratorConfig,
    state: Arc<watch::Sender<PipelineState>>,
    checkpoint: Arc<watch::Sender<Option<ResumePosition>>>,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Create a new orchestrator with the given components.
    pub fn new(
        reader: ChangeReader,
        transformer: Transformer,
        writer: IndexWriter,
        checkpoint_store: Arc<dyn CheckpointStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self::with_config(
            reader,
            transformer,
            writer,
            checkpoint_store,
            dead_letters,
            OrchestratorConfig::default(),
        )
    }

    /// Create a new orchestrator with custom configuration.
    pub fn with_config(
        reader: ChangeReader,
        transformer: Transformer,
        writer: IndexWriter,
        checkpoint_store: Arc<dyn CheckpointStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Starting);
        let (checkpoint, _) = watch::channel(None);

        Self {
            reader,
            transformer,
            writer,
            checkpoint_store,
            dead_letters,
            config,
            state: Arc::new(state),
            checkpoint: Arc::new(checkpoint),
            metrics: Arc::new(PipelineMetrics::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Observe the durable checkpoint.
    pub fn checkpoints(&self) -> watch::Receiver<Option<ResumePosition>> {
        self.checkpoint.subscribe()
    }

    /// Cumulative counters.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Token that starts a graceful shutdown when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Trigger a graceful shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run the orchestrator.
    ///
    /// Blocks until a shutdown completes (`Ok`) or a fatal error stops the
    /// pipeline (`Err`).
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), PipelineError> {
        info!("Starting sync orchestrator");
        self.state.send_replace(PipelineState::Starting);

        let result = self.run_pipeline().await;
        match &result {
            Ok(()) => {
                self.state.send_replace(PipelineState::Stopped);
                info!("Orchestrator shutdown complete");
            }
            Err(e) => {
                self.state.send_replace(PipelineState::Failed);
                error!(error = %e, action = e.operator_action(), "Pipeline failed");
            }
        }
        result
    }

    async fn run_pipeline(&self) -> Result<(), PipelineError> {
        let stop = self.shutdown.child_token();

        let started = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            started = self.start(stop.clone()) => Some(started?),
        };
        let (mut checkpointer, stream) = match started {
            Some(started) => started,
            None => {
                info!("Shutdown requested before start");
                return Ok(());
            }
        };

        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer_size.max(1));
        let (batch_tx, mut batch_rx) = mpsc::channel(self.config.batch_buffer_size.max(1));

        let pump_handle = tokio::spawn(pump(
            stream,
            event_tx,
            stop.clone(),
            self.config.backoff,
            self.state.clone(),
        ));
        let batcher_handle = tokio::spawn(Batcher::new(self.config.batcher).run(event_rx, batch_tx));

        self.state.send_replace(PipelineState::Running);
        info!("Pipeline running");

        let outcome = self.process(&mut batch_rx, &mut checkpointer).await;

        // Stop the background tasks whatever the outcome
        stop.cancel();
        drop(batch_rx);
        let _ = pump_handle.await;
        let _ = batcher_handle.await;

        outcome
    }

    /// Load the checkpoint and open the change stream, retrying transient failures.
    async fn start(&self, stop: CancellationToken) -> Result<(Checkpointer, ChangeStream), PipelineError> {
        let mut retry = RetryState::new(self.config.backoff);

        let checkpointer = loop {
            match Checkpointer::load(self.checkpoint_store.clone(), self.checkpoint.clone()).await {
                Ok(checkpointer) => break checkpointer,
                Err(e) if e.is_retryable() => pause(&self.state, &mut retry, &e).await?,
                Err(e) => return Err(e),
            }
        };

        retry.reset();
        let stream = loop {
            match self.reader.open(checkpointer.current().cloned(), stop.clone()).await {
                Ok(stream) => break stream,
                Err(e) if e.is_retryable() => pause(&self.state, &mut retry, &e).await?,
                Err(e) => return Err(e),
            }
        };

        Ok((checkpointer, stream))
    }

    /// Resolve batches until the batch channel closes.
    async fn process(
        &self,
        batches: &mut mpsc::Receiver<BatchMessage>,
        checkpointer: &mut Checkpointer,
    ) -> Result<(), PipelineError> {
        let mut drain_deadline: Option<Instant> = None;

        loop {
            let message = match self.bounded(batches.recv(), &mut drain_deadline).await {
                Some(message) => message,
                None => {
                    warn!("Drain timeout reached while waiting for batches");
                    return Ok(());
                }
            };

            match message {
                Some(BatchMessage::Ready(batch)) => {
                    let id = batch.id();
                    match self.bounded(self.resolve(batch, checkpointer), &mut drain_deadline).await {
                        Some(resolved) => resolved?,
                        None => {
                            warn!(
                                batch = id,
                                "Drain timeout reached, stopping without checkpointing the in-flight batch"
                            );
                            return Ok(());
                        }
                    }
                }
                Some(BatchMessage::Failed(e)) => return Err(e),
                None => {
                    debug!("Batch channel closed");
                    return Ok(());
                }
            }
        }
    }

    /// Await `work`; once shutdown is requested, give up on it at the drain
    /// deadline and return `None`.
    async fn bounded<F: Future>(&self, work: F, deadline: &mut Option<Instant>) -> Option<F::Output> {
        tokio::pin!(work);

        if deadline.is_none() {
            tokio::select! {
                biased;
                output = &mut work => return Some(output),
                _ = self.shutdown.cancelled() => {
                    *deadline = Some(Instant::now() + self.config.drain_timeout);
                    self.state.send_replace(PipelineState::Draining);
                    info!(
                        drain_timeout_ms = self.config.drain_timeout.as_millis() as u64,
                        "Shutdown requested, draining in-flight batches"
                    );
                }
            }
        }

        let at = (*deadline)?;
        tokio::time::timeout_at(at, work).await.ok()
    }

    /// Transform, write, dead-letter and checkpoint one batch.
    #[instrument(skip(self, batch, checkpointer), fields(batch = batch.id(), events = batch.len()))]
    async fn resolve(
        &self,
        batch: Batch<ChangeEvent>,
        checkpointer: &mut Checkpointer,
    ) -> Result<(), PipelineError> {
        let events = batch.len();
        let mut dead_letters: Vec<DeadLetterRecord> = batch.dead_letters().to_vec();
        for record in &dead_letters {
            error!(
                table = %record.table,
                position = %record.position,
                reason = %record.reason,
                "Undecodable change-log entry, dead-lettering"
            );
        }

        let TransformOutput {
            batch: mutations,
            failures,
            skipped,
        } = self.transformer.transform(batch);

        dead_letters.extend(failures.iter().map(|failure| {
            error!(
                table = %failure.event.table,
                position = %failure.event.position,
                reason = %failure.reason,
                "Projection failed, dead-lettering event"
            );
            DeadLetterRecord::from_event(&failure.event, &failure.reason)
        }));

        let mut retry = RetryState::new(self.config.backoff);
        let written = loop {
            match self.writer.write(&mutations).await {
                Ok(written) => break written,
                Err(e) if e.is_retryable() => pause(&self.state, &mut retry, &e).await?,
                Err(e) => return Err(e),
            }
        };

        for (mutation, reason) in &written.dead_lettered {
            error!(
                index = %mutation.index,
                document_id = %mutation.document_id,
                position = %mutation.position,
                reason = %reason,
                "Index rejected mutation, dead-lettering"
            );
            dead_letters.push(DeadLetterRecord::from_mutation(mutation, reason));
        }

        if !dead_letters.is_empty() {
            retry.reset();
            loop {
                match self
                    .dead_letters
                    .record(&dead_letters)
                    .await
                    .map_err(PipelineError::dead_letter)
                {
                    Ok(()) => break,
                    Err(e) if e.is_retryable() => pause(&self.state, &mut retry, &e).await?,
                    Err(e) => return Err(e),
                }
            }
        }

        let position = mutations.position();
        retry.reset();
        loop {
            match checkpointer.commit(position).await {
                Ok(_) => break,
                Err(e) if e.is_retryable() => pause(&self.state, &mut retry, &e).await?,
                Err(e) => return Err(e),
            }
        }
        recover(&self.state);

        self.metrics.record_batch(
            events,
            written.applied,
            dead_letters.len(),
            written.retried,
            skipped,
        );
        let lag = match self.reader.head_position().await {
            Ok(head) => {
                let lag = position.lag_behind(head);
                self.metrics.set_lag(lag);
                Some(lag)
            }
            Err(e) => {
                debug!(error = %e, "Could not read source head for lag");
                None
            }
        };

        info!(
            applied = written.applied,
            dead_lettered = dead_letters.len(),
            retried = written.retried,
            skipped = skipped,
            position = %position,
            lag = ?lag,
            "Batch resolved"
        );
        Ok(())
    }
}

/// Pull records from the stream into the batcher until cancelled or failed.
async fn pump(
    mut stream: ChangeStream,
    events: mpsc::Sender<ReaderMessage>,
    stop: CancellationToken,
    backoff: BackoffPolicy,
    state: Arc<watch::Sender<PipelineState>>,
) {
    let mut retry = RetryState::new(backoff);

    loop {
        match stream.next_page().await {
            Ok(Some(page)) => {
                if retry.attempt() > 0 {
                    info!(attempts = retry.attempt(), "Source reachable again");
                    retry.reset();
                    recover(&state);
                }
                for record in page {
                    let message = match record {
                        ChangeRecord::Event(event) => ReaderMessage::Event(event),
                        ChangeRecord::Undecodable(entry) => ReaderMessage::Rejected(entry.to_dead_letter()),
                    };
                    if events.send(message).await.is_err() {
                        debug!("Event channel closed, reader pump stopped");
                        return;
                    }
                }
            }
            Ok(None) => break,
            Err(e) if e.is_retryable() => {
                let paused = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    paused = pause(&state, &mut retry, &e) => paused,
                };
                if let Err(fatal) = paused {
                    let _ = events.send(ReaderMessage::Failed(fatal)).await;
                    break;
                }
            }
            Err(e) => {
                let _ = events.send(ReaderMessage::Failed(e)).await;
                break;
            }
        }
    }

    debug!(position = %stream.position(), "Reader pump stopped");
}

/// Wait out a transient failure, or fail once the downtime limit is exceeded.
async fn pause(
    state: &watch::Sender<PipelineState>,
    retry: &mut RetryState,
    err: &PipelineError,
) -> Result<(), PipelineError> {
    let delay = match retry.next_delay() {
        Some(delay) => delay,
        None => {
            return Err(PipelineError::downtime_exceeded(
                retry.max_downtime().unwrap_or_default(),
                err,
            ))
        }
    };

    let attempt = retry.attempt();
    state.send_if_modified(|current| {
        if *current == PipelineState::Draining {
            return false;
        }
        *current = PipelineState::Backoff { attempt };
        true
    });
    warn!(
        attempt = attempt,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "Transient failure, backing off"
    );

    tokio::time::sleep(delay).await;
    Ok(())
}

/// Leave the backoff state after a success.
fn recover(state: &watch::Sender<PipelineState>) {
    state.send_if_modified(|current| {
        if matches!(current, PipelineState::Backoff { .. }) {
            *current = PipelineState::Running;
            return true;
        }
        false
    });
}
