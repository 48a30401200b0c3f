//! Document mutations applied to the search index.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::position::ResumePosition;

/// What to do with a search document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationKind {
    /// Create or fully replace the document with `body`.
    Upsert {
        /// Projected document body.
        body: Map<String, Value>,
    },
    /// Remove the document.
    Delete,
}

/// A single write against the search index.
///
/// The document id is derived from the source primary key, so applying the
/// same mutation twice leaves the index in the same state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMutation {
    /// Target index (or alias).
    pub index: String,
    /// Document id.
    pub document_id: String,
    /// Upsert or delete.
    #[serde(flatten)]
    pub kind: MutationKind,
    /// Source table the mutation came from.
    pub table: String,
    /// Position of the change event that produced it.
    pub position: ResumePosition,
}

impl DocumentMutation {
    /// Create an upsert mutation.
    pub fn upsert(
        index: impl Into<String>,
        document_id: impl Into<String>,
        body: Map<String, Value>,
        table: impl Into<String>,
        position: ResumePosition,
    ) -> Self {
        Self {
            index: index.into(),
            document_id: document_id.into(),
            kind: MutationKind::Upsert { body },
            table: table.into(),
            position,
        }
    }

    /// Create a delete mutation.
    pub fn delete(
        index: impl Into<String>,
        document_id: impl Into<String>,
        table: impl Into<String>,
        position: ResumePosition,
    ) -> Self {
        Self {
            index: index.into(),
            document_id: document_id.into(),
            kind: MutationKind::Delete,
            table: table.into(),
            position,
        }
    }

    /// Whether this mutation removes the document.
    pub fn is_delete(&self) -> bool {
        matches!(self.kind, MutationKind::Delete)
    }

    /// Document body for upserts.
    pub fn body(&self) -> Option<&Map<String, Value>> {
        match &self.kind {
            MutationKind::Upsert { body } => Some(body),
            MutationKind::Delete => None,
        }
    }
}
