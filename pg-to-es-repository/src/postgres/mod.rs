//! PostgreSQL implementation of the change source.
//!
//! Changes are read from a trigger-maintained change-log table; backfill reads
//! the configured tables directly with keyset pagination.

mod change_log;
mod sql;

pub use change_log::{ChangeLogConfig, PostgresChangeSource};
