//! Local filesystem implementations of the checkpoint store and dead-letter sink.

mod checkpoint_store;
mod dead_letter_sink;

pub use checkpoint_store::FileCheckpointStore;
pub use dead_letter_sink::JsonlDeadLetterSink;
