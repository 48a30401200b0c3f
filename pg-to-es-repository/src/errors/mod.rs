//! Error types for the sync repository.

mod search_index_error;
mod source_error;
mod store_error;

pub use search_index_error::SearchIndexError;
pub use source_error::SourceError;
pub use store_error::StoreError;
