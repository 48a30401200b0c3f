//! Dependency initialization and wiring for the sync.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::SyncError;
use pg_to_es_pipeline::{
    BatcherConfig, ChangeReader, IndexWriter, Orchestrator, OrchestratorConfig, ReaderConfig,
    TransformConfig, Transformer, WriterConfig,
};
use pg_to_es_repository::{
    BulkLimits, ChangeLogConfig, FileCheckpointStore, JsonlDeadLetterSink, OpenSearchClient,
    PostgresChangeSource, SearchIndexClient,
};

/// Container for all initialized dependencies.
pub struct Dependencies {
    /// The configured orchestrator ready to run.
    pub orchestrator: Orchestrator,
}

impl Dependencies {
    /// Build the pipeline described by `config`.
    ///
    /// Configuration problems are fatal. An unreachable database or search
    /// engine is not: the orchestrator keeps retrying once it runs.
    ///
    /// # Returns
    ///
    /// * `Ok(Dependencies)` - Initialized dependencies
    /// * `Err(SyncError)` - If the configuration is invalid
    pub async fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        info!(
            elastic_url = %config.elastic_url,
            change_log_table = %config.change_log_table,
            mapping_file = %config.mapping_file.display(),
            checkpoint_dir = %config.checkpoint_dir.display(),
            "Initializing dependencies"
        );

        let mapping = load_mapping(config).await?;
        info!(
            tables = mapping.tables().len(),
            related = mapping.related_tables().len(),
            "Mapping loaded"
        );

        // Source connects lazily so a database outage at startup is retried
        let source = PostgresChangeSource::new(
            config.postgres_dsn.clone(),
            ChangeLogConfig {
                table: config.change_log_table.clone(),
                retention_table: config.retention_table.clone(),
            },
        );
        let reader = ChangeReader::new(
            Arc::new(source),
            ReaderConfig {
                fetch_size: config.fetch_size,
                poll_interval: config.poll_interval,
                initial_position: config.initial_position,
                tables: mapping.snapshot_tables(),
                related: mapping.related_tables(),
            },
        );

        let search_client = OpenSearchClient::new(&config.elastic_url)
            .await
            .map_err(|e| SyncError::config(format!("Failed to create search client: {}", e)))?;
        let client = SearchIndexClient::with_limits(
            Arc::new(search_client),
            BulkLimits {
                max_mutations: config.max_batch_size,
            },
        );

        match client.health_check().await {
            Ok(true) => info!("Search engine connection verified"),
            Ok(false) => warn!("Search engine reports an unhealthy cluster"),
            Err(e) => warn!(error = %e, "Search engine not reachable yet"),
        }

        let writer = IndexWriter::with_config(
            client,
            WriterConfig {
                max_retries: config.max_retries,
                backoff: config.backoff,
            },
        );

        let checkpoint_store =
            FileCheckpointStore::new(config.checkpoint_dir.clone(), config.checkpoint_key.clone())?;
        let dead_letters = JsonlDeadLetterSink::new(config.dead_letter_path.clone());

        let orchestrator = Orchestrator::with_config(
            reader,
            Transformer::new(Arc::new(mapping)),
            writer,
            Arc::new(checkpoint_store),
            Arc::new(dead_letters),
            OrchestratorConfig {
                batcher: BatcherConfig {
                    max_batch_size: config.max_batch_size,
                    max_batch_latency: config.max_batch_latency,
                },
                backoff: config.backoff,
                drain_timeout: config.drain_timeout,
                ..OrchestratorConfig::default()
            },
        );

        Ok(Self { orchestrator })
    }
}

/// Read and validate the mapping file.
async fn load_mapping(config: &SyncConfig) -> Result<TransformConfig, SyncError> {
    let json = tokio::fs::read_to_string(&config.mapping_file)
        .await
        .map_err(|e| {
            SyncError::config(format!(
                "Failed to read mapping file {}: {}",
                config.mapping_file.display(),
                e
            ))
        })?;

    Ok(TransformConfig::from_json(&json)?)
}
