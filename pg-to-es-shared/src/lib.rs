//! # pg-to-es Shared
//!
//! Data types that flow between the stages of the postgres to search index
//! sync: change events read from the source, the resume positions that order
//! them, the document mutations derived from them and the dead-letter records
//! kept for anything that could not be applied.

pub mod batch;
pub mod dead_letter;
pub mod event;
pub mod mutation;
pub mod position;

pub use batch::Batch;
pub use dead_letter::{DeadLetterRecord, DeadLetterStage};
pub use event::{ChangeEvent, OperationKind, PrimaryKey, RowPayload};
pub use mutation::{DocumentMutation, MutationKind};
pub use position::ResumePosition;
