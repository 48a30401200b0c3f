//! Table to index mapping configuration.

use serde::Deserialize;
use std::collections::HashSet;

use crate::errors::PipelineError;
use pg_to_es_repository::{LinkLookup, RelatedTable, SnapshotTable};

/// One source column copied into the document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldMapping {
    /// Column name in the row payload.
    pub column: String,
    /// Document field path; dots build nested objects.
    pub field: String,
    /// Whether a row without this column is a projection error.
    #[serde(default)]
    pub required: bool,
}

impl FieldMapping {
    /// Create an optional field mapping.
    pub fn new(column: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            field: field.into(),
            required: false,
        }
    }

    /// Create a required field mapping.
    pub fn required(column: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            required: true,
            ..Self::new(column, field)
        }
    }
}

/// A table whose changes refresh the documents of the mapped table.
///
/// ```json
/// {"table": "content.genre_film_work", "parent_columns": ["film_work_id"]}
/// {"table": "content.genre", "parent_columns": ["film_work_id"],
///  "link": {"table": "content.genre_film_work", "column": "genre_id"}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelatedMapping {
    /// Related table, as reported by the change log.
    pub table: String,
    /// Columns holding the mapped table's key, in key column order. Read from
    /// the changed row, or from the link rows when `link` is set.
    pub parent_columns: Vec<String>,
    /// Link table whose `column` references the changed row's key.
    #[serde(default)]
    pub link: Option<LinkLookup>,
}

/// How rows of one source table become documents of one index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableMapping {
    /// Source table, as reported by the change log.
    pub table: String,
    /// Target index.
    pub index: String,
    /// Primary key columns, in document id order.
    pub key_columns: Vec<String>,
    /// Projected columns, in document order.
    pub columns: Vec<FieldMapping>,
    /// Relation documents are built from instead of the table row, typically
    /// a view aggregating related rows into JSON columns.
    #[serde(default)]
    pub view: Option<String>,
    /// Tables whose changes re-read and re-index these documents.
    #[serde(default)]
    pub related: Vec<RelatedMapping>,
}

impl TableMapping {
    /// A mapping read straight from `table`, without related tables.
    pub fn new(
        table: impl Into<String>,
        index: impl Into<String>,
        key_columns: Vec<String>,
        columns: Vec<FieldMapping>,
    ) -> Self {
        Self {
            table: table.into(),
            index: index.into(),
            key_columns,
            columns,
            view: None,
            related: Vec::new(),
        }
    }
}

/// Mapping for every synced table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct TransformConfig {
    tables: Vec<TableMapping>,
}

impl TransformConfig {
    /// Create a validated configuration.
    pub fn new(tables: Vec<TableMapping>) -> Result<Self, PipelineError> {
        let config = Self { tables };
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON list of table mappings.
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PipelineError::configuration(format!("Invalid mapping: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Mapping of `table`, if it is synced.
    pub fn table(&self, table: &str) -> Option<&TableMapping> {
        self.tables.iter().find(|t| t.table == table)
    }

    /// Every table mapping, in configuration order.
    pub fn tables(&self) -> &[TableMapping] {
        &self.tables
    }

    /// Tables to read during backfill, in configuration order.
    pub fn snapshot_tables(&self) -> Vec<SnapshotTable> {
        self.tables
            .iter()
            .map(|t| SnapshotTable {
                name: t.table.clone(),
                key_columns: t.key_columns.clone(),
                view: t.view.clone(),
            })
            .collect()
    }

    /// Every related-table rule, in configuration order.
    pub fn related_tables(&self) -> Vec<RelatedTable> {
        self.tables
            .iter()
            .flat_map(|t| {
                t.related.iter().map(move |r| RelatedTable {
                    table: r.table.clone(),
                    parent: t.table.clone(),
                    parent_columns: r.parent_columns.clone(),
                    link: r.link.clone(),
                })
            })
            .collect()
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.tables.is_empty() {
            return Err(PipelineError::configuration("Mapping has no tables"));
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if table.table.is_empty() {
                return Err(PipelineError::configuration("Mapping entry without a table name"));
            }
            if !seen.insert(table.table.as_str()) {
                return Err(PipelineError::configuration(format!(
                    "Table {} is mapped twice",
                    table.table
                )));
            }
            if table.index.is_empty() {
                return Err(PipelineError::configuration(format!(
                    "Table {} has no target index",
                    table.table
                )));
            }
            if table.key_columns.is_empty() || table.key_columns.iter().any(|c| c.is_empty()) {
                return Err(PipelineError::configuration(format!(
                    "Table {} needs at least one named key column",
                    table.table
                )));
            }
            if table.view.as_deref().is_some_and(str::is_empty) {
                return Err(PipelineError::configuration(format!(
                    "Table {} has an empty view name",
                    table.table
                )));
            }
            validate_fields(table)?;
            validate_related(table)?;
        }
        Ok(())
    }
}

/// Related rules must name their table and produce a full key of the
/// mapped table.
fn validate_related(table: &TableMapping) -> Result<(), PipelineError> {
    for related in &table.related {
        if related.table.is_empty() || related.table == table.table {
            return Err(PipelineError::configuration(format!(
                "Table {} has a related rule with table {:?}",
                table.table, related.table
            )));
        }
        if related.parent_columns.len() != table.key_columns.len()
            || related.parent_columns.iter().any(|c| c.is_empty())
        {
            return Err(PipelineError::configuration(format!(
                "Related table {} must name {} parent column(s) for {}",
                related.table,
                table.key_columns.len(),
                table.table
            )));
        }
        if let Some(link) = &related.link {
            if link.table.is_empty() || link.column.is_empty() {
                return Err(PipelineError::configuration(format!(
                    "Related table {} of {} has an incomplete link",
                    related.table, table.table
                )));
            }
        }
    }
    Ok(())
}

/// Field paths must be well formed and must not place a value where another
/// path needs an object.
fn validate_fields(table: &TableMapping) -> Result<(), PipelineError> {
    let mut fields: HashSet<&str> = HashSet::new();
    for mapping in &table.columns {
        if mapping.column.is_empty() || mapping.field.split('.').any(|s| s.is_empty()) {
            return Err(PipelineError::configuration(format!(
                "Table {} has an invalid mapping {:?} -> {:?}",
                table.table, mapping.column, mapping.field
            )));
        }
        if !fields.insert(mapping.field.as_str()) {
            return Err(PipelineError::configuration(format!(
                "Table {} maps field {} twice",
                table.table, mapping.field
            )));
        }
    }

    for field in &fields {
        let prefix = format!("{}.", field);
        if let Some(nested) = fields.iter().find(|other| other.starts_with(&prefix)) {
            return Err(PipelineError::configuration(format!(
                "Table {} maps both {} and {}",
                table.table, field, nested
            )));
        }
    }
    Ok(())
}
