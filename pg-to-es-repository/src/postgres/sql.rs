//! SQL text for the change log and snapshot reads.

use crate::types::{LinkLookup, SnapshotTable};

/// Quote a single identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified relation name.
pub(crate) fn quote_relation(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Change-log entries after `$1`, at most `$2`.
pub(crate) fn changes_query(change_log: &str) -> String {
    format!(
        "SELECT sequence, table_name, operation, primary_key::text, payload::text \
         FROM {} WHERE sequence > $1 ORDER BY sequence LIMIT $2",
        quote_relation(change_log)
    )
}

/// Most recent change-log sequence.
pub(crate) fn head_query(change_log: &str) -> String {
    format!(
        "SELECT COALESCE(MAX(sequence), 0)::bigint FROM {}",
        quote_relation(change_log)
    )
}

/// Highest purged change-log sequence.
pub(crate) fn purged_query(retention: &str) -> String {
    format!(
        "SELECT COALESCE(MAX(purged_through), 0)::bigint FROM {}",
        quote_relation(retention)
    )
}

/// Oldest running and next transaction id.
pub(crate) fn horizon_query() -> &'static str {
    "SELECT txid_snapshot_xmin(s)::bigint, txid_snapshot_xmax(s)::bigint \
     FROM txid_current_snapshot() AS s"
}

/// Comparable text of a column value: its `jsonb` rendering, which for
/// strings and integers matches compact JSON on the client.
fn value_text(alias: &str, column: &str) -> String {
    format!("to_jsonb({}.{})::text", alias, quote_ident(column))
}

/// Rows of a table whose key columns match one of the keys bound as
/// parallel text arrays `$1..$n`, one array per key column.
pub(crate) fn rows_query(table: &SnapshotTable) -> String {
    let columns = table
        .key_columns
        .iter()
        .map(|c| value_text("t", c))
        .collect::<Vec<_>>()
        .join(", ");
    let arrays = (1..=table.key_columns.len())
        .map(|i| format!("${}::text[]", i))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT row_to_json(t)::text FROM {relation} t \
         WHERE ({columns}) IN (SELECT * FROM unnest({arrays}))",
        relation = quote_relation(table.relation()),
        columns = columns,
        arrays = arrays
    )
}

/// Distinct `columns` of the link rows whose link column matches `$1`.
pub(crate) fn lookup_query(link: &LinkLookup, columns: &[String]) -> String {
    let selected = columns
        .iter()
        .map(|c| format!("l.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT DISTINCT json_build_array({selected})::text FROM {relation} l WHERE {column} = $1",
        selected = selected,
        relation = quote_relation(&link.table),
        column = value_text("l", &link.column)
    )
}

/// Pagination key expression of a snapshot table.
///
/// The JSON array text is injective over key tuples and compared under the
/// "C" collation, so ordering matches plain byte order on the client.
fn snapshot_key(table: &SnapshotTable) -> String {
    let columns = table
        .key_columns
        .iter()
        .map(|c| format!("t.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("json_build_array({})::text COLLATE \"C\"", columns)
}

/// One keyset page of a table, optionally after the key bound to `$1`.
pub(crate) fn snapshot_query(table: &SnapshotTable, after_key: bool, limit: usize) -> String {
    let key = snapshot_key(table);
    let filter = if after_key {
        format!("WHERE {} > $1 ", key)
    } else {
        String::new()
    };
    format!(
        "SELECT {key} AS sync_key, row_to_json(t)::text AS sync_row \
         FROM {relation} t {filter}ORDER BY 1 LIMIT {limit}",
        key = key,
        relation = quote_relation(table.relation()),
        filter = filter,
        limit = limit
    )
}
