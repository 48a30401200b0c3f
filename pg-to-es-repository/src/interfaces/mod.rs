//! Interface definitions for the systems the sync talks to.
//!
//! Each trait is a narrow seam to one external collaborator so that the
//! pipeline can be wired against PostgreSQL and OpenSearch in production and
//! against in-memory implementations in tests.

mod change_source;
mod checkpoint_store;
mod dead_letter_sink;
mod search_index_provider;

pub use change_source::ChangeSource;
pub use checkpoint_store::CheckpointStore;
pub use dead_letter_sink::DeadLetterSink;
pub use search_index_provider::SearchIndexProvider;
