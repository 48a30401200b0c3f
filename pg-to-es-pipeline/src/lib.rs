//! # pg-to-es Pipeline
//!
//! This crate provides the pipeline components for reading row changes from
//! PostgreSQL and applying them to a search index.
//!
//! ## Architecture
//!
//! The pipeline follows the Reader-Batcher-Transformer-Writer pattern:
//!
//! 1. **Reader**: Streams change events from the source, backfilling first if needed
//! 2. **Batcher**: Groups events into batches bounded by size and latency
//! 3. **Transformer**: Projects events into coalesced document mutations
//! 4. **Writer**: Applies mutations with bulk requests, retrying transient item failures
//! 5. **Orchestrator**: Coordinates the flow, checkpoints resolved batches and
//!    owns the retry and shutdown policy

pub mod backoff;
pub mod batcher;
pub mod checkpoint;
pub mod errors;
pub mod metrics;
pub mod orchestrator;
pub mod reader;
pub mod transformer;
pub mod writer;

pub use backoff::BackoffPolicy;
pub use batcher::BatcherConfig;
pub use errors::PipelineError;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use orchestrator::{Orchestrator, OrchestratorConfig, PipelineState};
pub use reader::{ChangeReader, InitialPosition, ReaderConfig};
pub use transformer::{FieldMapping, RelatedMapping, TableMapping, TransformConfig, Transformer};
pub use writer::{IndexWriter, WriteResult, WriterConfig};
