//! Shared setup for the end-to-end pipeline tests.

#![allow(dead_code)]

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use pg_to_es_pipeline::{
    BackoffPolicy, BatcherConfig, ChangeReader, FieldMapping, IndexWriter, InitialPosition,
    Orchestrator, OrchestratorConfig, PipelineError, ReaderConfig, RelatedMapping, TableMapping,
    TransformConfig, Transformer, WriterConfig,
};
use pg_to_es_repository::memory::{
    MemoryChangeSource, MemoryCheckpointStore, MemoryDeadLetterSink, MemorySearchIndex, TableRows,
};
use pg_to_es_repository::{LinkLookup, SearchIndexClient};
use pg_to_es_shared::{PrimaryKey, ResumePosition, RowPayload};

pub const FILMS: &str = "content.film_work";
pub const GENRES: &str = "content.genre";
pub const FILM_GENRES: &str = "content.genre_film_work";
pub const FILM_DOCUMENTS: &str = "content.film_work_documents";

/// In-memory collaborators of one pipeline.
pub struct Harness {
    pub source: Arc<MemoryChangeSource>,
    pub index: Arc<MemorySearchIndex>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub dead_letters: Arc<MemoryDeadLetterSink>,
    pub initial_position: InitialPosition,
    pub batch_size: usize,
    pub backoff: BackoffPolicy,
    pub drain_timeout: Duration,
    pub mapping: TransformConfig,
}

impl Harness {
    /// A pipeline without a checkpoint.
    pub fn new(initial_position: InitialPosition) -> Self {
        Self {
            source: Arc::new(MemoryChangeSource::new()),
            index: Arc::new(MemorySearchIndex::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            dead_letters: Arc::new(MemoryDeadLetterSink::new()),
            initial_position,
            batch_size: 10,
            backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
            drain_timeout: Duration::from_secs(5),
            mapping: mapping(),
        }
    }

    /// A pipeline resuming after the start of the change log.
    pub fn streaming() -> Self {
        let mut harness = Self::new(InitialPosition::FromNow);
        harness.checkpoints = Arc::new(MemoryCheckpointStore::with_position(ResumePosition::stream(0)));
        harness
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        let mapping = Arc::new(self.mapping.clone());

        let reader = ChangeReader::new(
            self.source.clone(),
            ReaderConfig {
                fetch_size: 10,
                poll_interval: Duration::from_millis(10),
                initial_position: self.initial_position,
                tables: mapping.snapshot_tables(),
                related: mapping.related_tables(),
            },
        );
        let writer = IndexWriter::with_config(
            SearchIndexClient::new(self.index.clone()),
            WriterConfig {
                max_retries: 3,
                backoff: self.backoff,
            },
        );

        Arc::new(Orchestrator::with_config(
            reader,
            Transformer::new(mapping),
            writer,
            self.checkpoints.clone(),
            self.dead_letters.clone(),
            OrchestratorConfig {
                event_buffer_size: 100,
                batch_buffer_size: 2,
                batcher: BatcherConfig {
                    max_batch_size: self.batch_size,
                    max_batch_latency: Duration::from_millis(50),
                },
                backoff: self.backoff,
                drain_timeout: self.drain_timeout,
            },
        ))
    }
}

pub fn mapping() -> TransformConfig {
    TransformConfig::new(vec![
        TableMapping::new(
            FILMS,
            "movies",
            vec!["id".to_string()],
            vec![
                FieldMapping::required("id", "id"),
                FieldMapping::required("title", "title"),
                FieldMapping::new("rating", "imdb_rating"),
            ],
        ),
        TableMapping::new(
            GENRES,
            "genres",
            vec!["id".to_string()],
            vec![FieldMapping::required("name", "name")],
        ),
    ])
    .expect("valid mapping")
}

/// Films indexed with their genres nested, read through a view.
pub fn movies_mapping() -> TransformConfig {
    let mut films = TableMapping::new(
        FILMS,
        "movies",
        vec!["id".to_string()],
        vec![
            FieldMapping::required("id", "id"),
            FieldMapping::required("title", "title"),
            FieldMapping::new("genres", "genres"),
        ],
    );
    films.view = Some(FILM_DOCUMENTS.to_string());
    films.related = vec![
        RelatedMapping {
            table: FILM_GENRES.to_string(),
            parent_columns: vec!["film_work_id".to_string()],
            link: None,
        },
        RelatedMapping {
            table: GENRES.to_string(),
            parent_columns: vec!["film_work_id".to_string()],
            link: Some(LinkLookup {
                table: FILM_GENRES.to_string(),
                column: "genre_id".to_string(),
            }),
        },
    ];

    TransformConfig::new(vec![
        films,
        TableMapping::new(
            GENRES,
            "genres",
            vec!["id".to_string()],
            vec![FieldMapping::required("name", "name")],
        ),
    ])
    .expect("valid mapping")
}

/// Define the film documents view: each film row with a `genres` array of
/// `{id, name}` objects.
pub async fn define_film_documents(source: &MemoryChangeSource) {
    source
        .define_view(FILM_DOCUMENTS, |tables: &TableRows<'_>| {
            tables
                .rows(FILMS)
                .into_iter()
                .map(|film| {
                    let genres: Vec<Value> = tables
                        .rows(FILM_GENRES)
                        .into_iter()
                        .filter(|link| link.get("film_work_id") == film.get("id"))
                        .filter_map(|link| {
                            tables
                                .rows(GENRES)
                                .into_iter()
                                .find(|genre| genre.get("id") == link.get("genre_id"))
                        })
                        .map(|genre| json!({"id": genre["id"], "name": genre["name"]}))
                        .collect();
                    let mut row = film.clone();
                    row.insert("genres".to_string(), Value::Array(genres));
                    row
                })
                .collect()
        })
        .await;
}

pub fn genre(id: &str, name: &str) -> RowPayload {
    let mut row = RowPayload::new();
    row.insert("id".to_string(), json!(id));
    row.insert("name".to_string(), json!(name));
    row
}

pub fn film_genre(id: &str, film_work_id: &str, genre_id: &str) -> RowPayload {
    let mut row = RowPayload::new();
    row.insert("id".to_string(), json!(id));
    row.insert("film_work_id".to_string(), json!(film_work_id));
    row.insert("genre_id".to_string(), json!(genre_id));
    row
}

pub fn key(id: &str) -> PrimaryKey {
    PrimaryKey::new().with("id", id)
}

pub fn film(id: &str, title: &str) -> RowPayload {
    let mut row = RowPayload::new();
    row.insert("id".to_string(), json!(id));
    row.insert("title".to_string(), json!(title));
    row.insert("rating".to_string(), json!(7.1));
    row.insert("file_path".to_string(), json!("/films/x.mp4"));
    row
}

/// The document a film row projects to.
pub fn film_document(id: &str, title: &str) -> Map<String, Value> {
    let mut doc = Map::new();
    doc.insert("id".to_string(), json!(id));
    doc.insert("title".to_string(), json!(title));
    doc.insert("imdb_rating".to_string(), json!(7.1));
    doc
}

/// Start the orchestrator in the background.
pub fn spawn(orchestrator: &Arc<Orchestrator>) -> JoinHandle<Result<(), PipelineError>> {
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move { orchestrator.run().await })
}

/// Wait until the published checkpoint reaches `target`.
pub async fn wait_for_checkpoint(orchestrator: &Orchestrator, target: &ResumePosition) {
    let mut checkpoints = orchestrator.checkpoints();
    tokio::time::timeout(
        Duration::from_secs(600),
        checkpoints.wait_for(|position| position.as_ref().is_some_and(|p| p >= target)),
    )
    .await
    .expect("checkpoint not reached in time")
    .expect("orchestrator dropped");
}

/// Run until the checkpoint reaches `target`, then shut down cleanly.
pub async fn sync_until(orchestrator: &Arc<Orchestrator>, target: ResumePosition) {
    let handle = spawn(orchestrator);
    wait_for_checkpoint(orchestrator, &target).await;
    orchestrator.shutdown();
    handle.await.expect("orchestrator task panicked").expect("orchestrator failed");
}
