//! # pg-to-es
//!
//! Main library for the postgres to search index sync.
//!
//! This crate provides the configuration and dependency wiring for running
//! the sync pipeline.

pub mod config;

pub use config::{Dependencies, SyncConfig};

use thiserror::Error;

/// Errors that can occur during sync initialization or execution.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Pipeline error.
    #[error("Pipeline error: {0}")]
    PipelineError(#[from] pg_to_es_pipeline::PipelineError),

    /// Search index error.
    #[error("Search index error: {0}")]
    SearchIndexError(#[from] pg_to_es_repository::SearchIndexError),

    /// Checkpoint store error.
    #[error("Store error: {0}")]
    StoreError(#[from] pg_to_es_repository::StoreError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SyncError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Hint for the operator, shown next to a fatal error.
    pub fn operator_action(&self) -> &'static str {
        match self {
            Self::PipelineError(e) => e.operator_action(),
            Self::ConfigError(_) => "fix the configuration and restart",
            Self::SearchIndexError(_) => "check the search index and restart",
            Self::StoreError(_) | Self::IoError(_) => "check the state directory and restart",
        }
    }
}
