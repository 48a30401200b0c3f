//! Row-level change events read from the relational source.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::position::ResumePosition;

/// Column name to value mapping for one row.
pub type RowPayload = Map<String, Value>;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Row was inserted (also used for backfilled rows).
    Insert,
    /// Row was updated.
    Update,
    /// Row was deleted.
    Delete,
}

impl OperationKind {
    /// Parse the operation column of a change-log entry.
    ///
    /// Accepts the trigger's `TG_OP` spelling as well as single letters.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INSERT" | "I" => Some(Self::Insert),
            "UPDATE" | "U" => Some(Self::Update),
            "DELETE" | "D" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Primary key column values of a row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(BTreeMap<String, Value>);

impl PrimaryKey {
    /// Create an empty key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key column.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    /// Value of a key column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Number of key columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key has no columns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The value of a single-column key.
    pub fn single_value(&self) -> Option<&Value> {
        match self.0.len() {
            1 => self.0.values().next(),
            _ => None,
        }
    }

    /// Build a key from the `columns` of a row payload.
    ///
    /// Returns `None` if any column is absent or null.
    pub fn from_row(row: &RowPayload, columns: &[String]) -> Option<Self> {
        let mut key = Self::new();
        for column in columns {
            match row.get(column) {
                Some(Value::Null) | None => return None,
                Some(value) => {
                    key.0.insert(column.clone(), value.clone());
                }
            }
        }
        Some(key)
    }

    /// Derive the search document id from the key.
    ///
    /// Values are joined with `_` in `columns` order; strings are used
    /// verbatim and other values in their compact JSON form. Returns `None`
    /// when a column is missing or null, or when the id would be empty.
    pub fn document_id(&self, columns: &[String]) -> Option<String> {
        let mut parts = Vec::with_capacity(columns.len());
        for column in columns {
            match self.0.get(column)? {
                Value::Null => return None,
                Value::String(s) => parts.push(s.clone()),
                other => parts.push(other.to_string()),
            }
        }
        let id = parts.join("_");
        if id.is_empty() {
            return None;
        }
        Some(id)
    }
}

impl From<BTreeMap<String, Value>> for PrimaryKey {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

/// A single row change emitted by the change reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Source table, `schema.table` or bare table name as configured.
    pub table: String,
    /// Primary key of the changed row.
    pub primary_key: PrimaryKey,
    /// What happened to the row.
    pub operation: OperationKind,
    /// New row contents for inserts and updates; the old row for deletes
    /// when the source recorded it.
    pub payload: Option<RowPayload>,
    /// Where in the change stream this event sits.
    pub position: ResumePosition,
}

impl ChangeEvent {
    /// Create an insert event.
    pub fn insert(
        table: impl Into<String>,
        primary_key: PrimaryKey,
        payload: RowPayload,
        position: ResumePosition,
    ) -> Self {
        Self {
            table: table.into(),
            primary_key,
            operation: OperationKind::Insert,
            payload: Some(payload),
            position,
        }
    }

    /// Create an update event.
    pub fn update(
        table: impl Into<String>,
        primary_key: PrimaryKey,
        payload: RowPayload,
        position: ResumePosition,
    ) -> Self {
        Self {
            table: table.into(),
            primary_key,
            operation: OperationKind::Update,
            payload: Some(payload),
            position,
        }
    }

    /// Create a delete event.
    pub fn delete(table: impl Into<String>, primary_key: PrimaryKey, position: ResumePosition) -> Self {
        Self {
            table: table.into(),
            primary_key,
            operation: OperationKind::Delete,
            payload: None,
            position,
        }
    }

    /// Whether the event removes the row.
    pub fn is_delete(&self) -> bool {
        self.operation == OperationKind::Delete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_parse() {
        assert_eq!(OperationKind::parse("INSERT"), Some(OperationKind::Insert));
        assert_eq!(OperationKind::parse("u"), Some(OperationKind::Update));
        assert_eq!(OperationKind::parse(" delete "), Some(OperationKind::Delete));
        assert_eq!(OperationKind::parse("TRUNCATE"), None);
    }

    #[test]
    fn test_document_id_single_column() {
        let key = PrimaryKey::new().with("id", "3d8f1b9e-1f9a-4c1e-9d0a-0d1a4e6f9b21");
        assert_eq!(
            key.document_id(&["id".to_string()]),
            Some("3d8f1b9e-1f9a-4c1e-9d0a-0d1a4e6f9b21".to_string())
        );
    }

    #[test]
    fn test_document_id_follows_column_order() {
        let key = PrimaryKey::new().with("film_work_id", 7).with("genre_id", "drama");
        let columns = vec!["genre_id".to_string(), "film_work_id".to_string()];
        assert_eq!(key.document_id(&columns), Some("drama_7".to_string()));
    }

    #[test]
    fn test_document_id_missing_column() {
        let key = PrimaryKey::new().with("id", json!(null));
        assert_eq!(key.document_id(&["id".to_string()]), None);
        assert_eq!(key.document_id(&["other".to_string()]), None);
        assert_eq!(key.document_id(&[]), None);
    }

    #[test]
    fn test_document_id_empty_string_key() {
        let columns = vec!["id".to_string()];
        assert_eq!(PrimaryKey::new().with("id", "").document_id(&columns), None);

        let composite = PrimaryKey::new().with("a", "").with("b", "x");
        assert_eq!(
            composite.document_id(&["a".to_string(), "b".to_string()]),
            Some("_x".to_string())
        );
    }

    #[test]
    fn test_key_from_row() {
        let mut row = RowPayload::new();
        row.insert("id".to_string(), json!(1));
        row.insert("title".to_string(), json!("Alien"));

        let key = PrimaryKey::from_row(&row, &["id".to_string()]).unwrap();
        assert_eq!(key.len(), 1);
        assert_eq!(key.get("id"), Some(&json!(1)));
        assert!(PrimaryKey::from_row(&row, &["missing".to_string()]).is_none());
        assert_eq!(key.single_value(), Some(&json!(1)));
        assert_eq!(PrimaryKey::new().with("a", 1).with("b", 2).single_value(), None);
    }
}
