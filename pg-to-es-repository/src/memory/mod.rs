//! In-memory implementations of every interface.
//!
//! Used to run the pipeline without PostgreSQL or a search cluster, with
//! hooks to inject the failures the pipeline has to survive.

mod change_source;
mod search_index;
mod stores;

pub use change_source::{MemoryChangeSource, TableRows};
pub use search_index::MemorySearchIndex;
pub use stores::{MemoryCheckpointStore, MemoryDeadLetterSink};
