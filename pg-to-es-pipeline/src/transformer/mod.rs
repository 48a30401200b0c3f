//! Transformer for the sync pipeline.
//!
//! Projects change events into document mutations and coalesces them so each
//! document is written at most once per batch.

mod mapping;

pub use mapping::{FieldMapping, RelatedMapping, TableMapping, TransformConfig};

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use pg_to_es_shared::{Batch, ChangeEvent, DocumentMutation, RowPayload};

/// An event that could not be projected into a document.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionFailure {
    /// The offending event.
    pub event: ChangeEvent,
    /// Why projection failed.
    pub reason: String,
}

/// Result of transforming one batch.
#[derive(Debug)]
pub struct TransformOutput {
    /// Coalesced mutations; carries the position of the input batch.
    pub batch: Batch<DocumentMutation>,
    /// Events routed to the dead-letter sink.
    pub failures: Vec<ProjectionFailure>,
    /// Events of tables without a mapping.
    pub skipped: usize,
}

/// Maps change events into document mutations.
///
/// Pure and deterministic: the same batch always yields the same output.
#[derive(Debug, Clone)]
pub struct Transformer {
    config: Arc<TransformConfig>,
}

impl Transformer {
    /// Create a new transformer.
    pub fn new(config: Arc<TransformConfig>) -> Self {
        Self { config }
    }

    /// Transform a batch of change events.
    pub fn transform(&self, batch: Batch<ChangeEvent>) -> TransformOutput {
        let mut mutations = Vec::with_capacity(batch.len());
        let mut failures = Vec::new();
        let mut skipped = 0;

        let id = batch.id();
        let position = batch.position().clone();

        for event in batch.into_items() {
            let mapping = match self.config.table(&event.table) {
                Some(mapping) => mapping,
                None => {
                    debug!(table = %event.table, "Skipping change of unmapped table");
                    skipped += 1;
                    continue;
                }
            };

            match project(mapping, &event) {
                Ok(mutation) => mutations.push(mutation),
                Err(reason) => failures.push(ProjectionFailure { event, reason }),
            }
        }

        TransformOutput {
            batch: Batch::new(id, coalesce(mutations), position),
            failures,
            skipped,
        }
    }
}

/// Build the mutation of one event.
fn project(mapping: &TableMapping, event: &ChangeEvent) -> Result<DocumentMutation, String> {
    let document_id = event
        .primary_key
        .document_id(&mapping.key_columns)
        .ok_or_else(|| {
            format!(
                "Primary key has no usable value for key columns {:?}",
                mapping.key_columns
            )
        })?;

    if event.is_delete() {
        return Ok(DocumentMutation::delete(
            mapping.index.clone(),
            document_id,
            event.table.clone(),
            event.position.clone(),
        ));
    }

    let payload = event
        .payload
        .as_ref()
        .ok_or_else(|| "Insert or update without a row payload".to_string())?;
    let body = project_row(mapping, payload)?;

    Ok(DocumentMutation::upsert(
        mapping.index.clone(),
        document_id,
        body,
        event.table.clone(),
        event.position.clone(),
    ))
}

/// Copy mapped columns into a document body.
fn project_row(mapping: &TableMapping, row: &RowPayload) -> Result<Map<String, Value>, String> {
    let mut body = Map::new();
    for field in &mapping.columns {
        let value = match row.get(&field.column) {
            Some(Value::Null) | None if field.required => {
                return Err(format!("Required column {} is missing", field.column));
            }
            None => continue,
            Some(value) => value.clone(),
        };
        insert_path(&mut body, &field.field, value)?;
    }
    Ok(body)
}

/// Insert `value` at a dotted path, creating intermediate objects.
fn insert_path(body: &mut Map<String, Value>, path: &str, value: Value) -> Result<(), String> {
    let mut segments = path.split('.').peekable();
    let mut current = body;

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return Ok(());
        }

        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(object) => object,
            _ => return Err(format!("Field {} is not an object", segment)),
        };
    }
    Ok(())
}

/// Reduce mutations to one per document.
///
/// The mutation with the highest source position wins; at equal positions a
/// delete wins. Survivors are ordered by the last occurrence of their document.
pub fn coalesce(mutations: Vec<DocumentMutation>) -> Vec<DocumentMutation> {
    let mut latest: HashMap<(String, String), (usize, DocumentMutation)> = HashMap::new();

    for (occurrence, mutation) in mutations.into_iter().enumerate() {
        let key = (mutation.index.clone(), mutation.document_id.clone());
        match latest.get_mut(&key) {
            Some((last, current)) => {
                *last = occurrence;
                let newer = mutation.position > current.position
                    || (mutation.position == current.position && mutation.is_delete());
                if newer {
                    *current = mutation;
                }
            }
            None => {
                latest.insert(key, (occurrence, mutation));
            }
        }
    }

    let mut survivors: Vec<(usize, DocumentMutation)> = latest.into_values().collect();
    survivors.sort_by_key(|(occurrence, _)| *occurrence);
    survivors.into_iter().map(|(_, mutation)| mutation).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_to_es_shared::{PrimaryKey, ResumePosition};
    use serde_json::json;

    fn config() -> Arc<TransformConfig> {
        Arc::new(
            TransformConfig::new(vec![TableMapping::new(
                "content.film_work",
                "movies",
                vec!["id".to_string()],
                vec![
                    FieldMapping::required("title", "title"),
                    FieldMapping::new("rating", "imdb_rating"),
                    FieldMapping::new("type", "meta.type"),
                    FieldMapping::new("created", "meta.created"),
                ],
            )])
            .unwrap(),
        )
    }

    fn row(title: &str) -> RowPayload {
        let mut row = RowPayload::new();
        row.insert("id".to_string(), json!("fw1"));
        row.insert("title".to_string(), json!(title));
        row.insert("rating".to_string(), json!(7.5));
        row.insert("type".to_string(), json!("movie"));
        row.insert("file_path".to_string(), json!("/tmp/x"));
        row
    }

    fn key(id: &str) -> PrimaryKey {
        PrimaryKey::new().with("id", id)
    }

    fn batch(events: Vec<ChangeEvent>) -> Batch<ChangeEvent> {
        Batch::from_events(1, events).unwrap()
    }

    #[test]
    fn test_projection_builds_nested_fields() {
        let transformer = Transformer::new(config());
        let event = ChangeEvent::insert("content.film_work", key("fw1"), row("Alien"), ResumePosition::stream(1));

        let output = transformer.transform(batch(vec![event]));

        let mutation = &output.batch.items()[0];
        assert_eq!(mutation.document_id, "fw1");
        assert_eq!(
            Value::Object(mutation.body().unwrap().clone()),
            json!({"title": "Alien", "imdb_rating": 7.5, "meta": {"type": "movie"}})
        );
    }

    #[test]
    fn test_two_updates_coalesce_to_latest() {
        let transformer = Transformer::new(config());
        let output = transformer.transform(batch(vec![
            ChangeEvent::update("content.film_work", key("fw1"), row("Draft"), ResumePosition::stream(1)),
            ChangeEvent::update("content.film_work", key("fw1"), row("Final"), ResumePosition::stream(2)),
        ]));

        assert_eq!(output.batch.len(), 1);
        assert_eq!(output.batch.items()[0].body().unwrap()["title"], json!("Final"));
        assert_eq!(output.batch.position(), &ResumePosition::stream(2));
    }

    #[test]
    fn test_insert_update_delete_leaves_delete() {
        let transformer = Transformer::new(config());
        let output = transformer.transform(batch(vec![
            ChangeEvent::insert("content.film_work", key("fw1"), row("A"), ResumePosition::stream(1)),
            ChangeEvent::update("content.film_work", key("fw1"), row("B"), ResumePosition::stream(2)),
            ChangeEvent::delete("content.film_work", key("fw1"), ResumePosition::stream(3)),
        ]));

        assert_eq!(output.batch.len(), 1);
        assert!(output.batch.items()[0].is_delete());
    }

    #[test]
    fn test_reinsert_after_delete_survives() {
        let transformer = Transformer::new(config());
        let output = transformer.transform(batch(vec![
            ChangeEvent::delete("content.film_work", key("fw1"), ResumePosition::stream(1)),
            ChangeEvent::insert("content.film_work", key("fw1"), row("Back"), ResumePosition::stream(2)),
        ]));

        assert_eq!(output.batch.len(), 1);
        assert!(!output.batch.items()[0].is_delete());
    }

    #[test]
    fn test_stale_upsert_does_not_resurrect() {
        let delete = DocumentMutation::delete("movies", "fw1", "t", ResumePosition::stream(5));
        let stale = DocumentMutation::upsert("movies", "fw1", Map::new(), "t", ResumePosition::stream(4));
        let same = DocumentMutation::upsert("movies", "fw1", Map::new(), "t", ResumePosition::stream(5));

        let result = coalesce(vec![delete.clone(), stale, same]);
        assert_eq!(result, vec![delete]);
    }

    #[test]
    fn test_order_follows_last_occurrence() {
        let a1 = DocumentMutation::delete("movies", "a", "t", ResumePosition::stream(1));
        let b = DocumentMutation::delete("movies", "b", "t", ResumePosition::stream(2));
        let a2 = DocumentMutation::delete("movies", "a", "t", ResumePosition::stream(3));

        let ids: Vec<String> = coalesce(vec![a1, b, a2])
            .into_iter()
            .map(|m| m.document_id)
            .collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_missing_required_field_fails_only_that_event() {
        let transformer = Transformer::new(config());
        let mut broken = row("x");
        broken.remove("title");

        let output = transformer.transform(batch(vec![
            ChangeEvent::insert("content.film_work", key("fw1"), broken, ResumePosition::stream(1)),
            ChangeEvent::insert("content.film_work", key("fw2"), row("Ok"), ResumePosition::stream(2)),
        ]));

        assert_eq!(output.failures.len(), 1);
        assert!(output.failures[0].reason.contains("title"));
        assert_eq!(output.batch.len(), 1);
        assert_eq!(output.batch.items()[0].document_id, "fw2");
    }

    #[test]
    fn test_empty_string_key_is_a_projection_failure() {
        let transformer = Transformer::new(config());
        let output = transformer.transform(batch(vec![
            ChangeEvent::insert("content.film_work", key(""), row("Blank"), ResumePosition::stream(1)),
            ChangeEvent::insert("content.film_work", key("fw2"), row("Ok"), ResumePosition::stream(2)),
        ]));

        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].event.primary_key, key(""));
        assert_eq!(output.batch.len(), 1);
        assert_eq!(output.batch.items()[0].document_id, "fw2");
    }

    #[test]
    fn test_unmapped_table_and_missing_key() {
        let transformer = Transformer::new(config());
        let output = transformer.transform(batch(vec![
            ChangeEvent::insert("content.person", key("p1"), row("x"), ResumePosition::stream(1)),
            ChangeEvent::delete("content.film_work", PrimaryKey::new(), ResumePosition::stream(2)),
        ]));

        assert_eq!(output.skipped, 1);
        assert_eq!(output.failures.len(), 1);
        assert!(output.batch.is_empty());
        assert_eq!(output.batch.position(), &ResumePosition::stream(2));
    }
}
