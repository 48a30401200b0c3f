//! Dead-letter records for changes that could not be applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::ChangeEvent;
use crate::mutation::DocumentMutation;
use crate::position::ResumePosition;

/// Pipeline stage that gave up on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStage {
    /// The change-log entry could not be decoded.
    Source,
    /// Projection of the change event into a document failed.
    Transform,
    /// The search index rejected the document mutation.
    Index,
}

/// A durable record of a change that was skipped.
///
/// Holds enough context to replay the change by hand: the original entry,
/// event or mutation as JSON, the reason, and where in the stream it sat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Unique record id.
    pub id: Uuid,
    /// Stage that produced the record.
    pub stage: DeadLetterStage,
    /// Source table.
    pub table: String,
    /// Document id, or the primary key as JSON when no id could be derived.
    pub key: String,
    /// Source position of the change.
    pub position: ResumePosition,
    /// Why the change was skipped.
    pub reason: String,
    /// Raw change-log entry, change event or document mutation.
    pub payload: Value,
    /// When the record was created.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Record a change event that failed projection.
    pub fn from_event(event: &ChangeEvent, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage: DeadLetterStage::Transform,
            table: event.table.clone(),
            key: serde_json::to_string(&event.primary_key).unwrap_or_default(),
            position: event.position.clone(),
            reason: reason.into(),
            payload: serde_json::to_value(event).unwrap_or(Value::Null),
            failed_at: Utc::now(),
        }
    }

    /// Record a change-log entry that could not be decoded.
    pub fn from_source_entry(
        table: impl Into<String>,
        key: impl Into<String>,
        position: ResumePosition,
        reason: impl Into<String>,
        raw: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage: DeadLetterStage::Source,
            table: table.into(),
            key: key.into(),
            position,
            reason: reason.into(),
            payload: raw,
            failed_at: Utc::now(),
        }
    }

    /// Record a document mutation rejected by the index.
    pub fn from_mutation(mutation: &DocumentMutation, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage: DeadLetterStage::Index,
            table: mutation.table.clone(),
            key: mutation.document_id.clone(),
            position: mutation.position.clone(),
            reason: reason.into(),
            payload: serde_json::to_value(mutation).unwrap_or(Value::Null),
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PrimaryKey;

    #[test]
    fn test_from_event_keeps_context() {
        let event = ChangeEvent::delete(
            "content.genre",
            PrimaryKey::new().with("id", "g1"),
            ResumePosition::stream(5),
        );

        let record = DeadLetterRecord::from_event(&event, "missing field name");

        assert_eq!(record.stage, DeadLetterStage::Transform);
        assert_eq!(record.table, "content.genre");
        assert_eq!(record.key, r#"{"id":"g1"}"#);
        assert_eq!(record.position, ResumePosition::stream(5));
        assert_eq!(record.payload["operation"], "delete");
    }

    #[test]
    fn test_source_stage_serializes_snake_case() {
        let record = DeadLetterRecord::from_source_entry(
            "content.genre",
            r#"{"id": "g1"}"#,
            ResumePosition::stream(3),
            "Unknown operation 'TRUNCATE'",
            serde_json::json!({"operation": "TRUNCATE"}),
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["stage"], "source");
        assert_eq!(json["position"], serde_json::to_value(ResumePosition::stream(3)).unwrap());
    }

    #[test]
    fn test_from_mutation_uses_document_id() {
        let mutation = DocumentMutation::delete("genres", "g1", "content.genre", ResumePosition::stream(8));

        let record = DeadLetterRecord::from_mutation(&mutation, "mapper_parsing_exception");

        assert_eq!(record.stage, DeadLetterStage::Index);
        assert_eq!(record.key, "g1");
        assert_eq!(record.payload["kind"], "delete");
    }
}
