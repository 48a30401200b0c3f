//! Error types for the sync pipeline.

use pg_to_es_repository::{SearchIndexError, SourceError, StoreError};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the sync pipeline.
///
/// Every variant is either transient (retried with backoff by the
/// orchestrator) or fatal (the pipeline stops in the `Failed` state).
/// Per-document problems never surface here: they are dead-lettered.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// The source database could not be reached.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The source rejected a query or returned data that could not be decoded.
    #[error("Source error: {0}")]
    SourceError(String),

    /// The requested resume position is no longer retained by the source.
    #[error("Resume position {position} is no longer retained by the source (purged through {purged_through})")]
    PositionInvalid {
        position: String,
        purged_through: u64,
    },

    /// The search engine could not serve a bulk request.
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    /// The search engine refused a bulk request as a whole.
    #[error("Index error: {0}")]
    IndexError(String),

    /// Invalid mapping or pipeline settings.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The checkpoint could not be loaded or saved.
    #[error("Checkpoint error: {message}")]
    CheckpointError { message: String, retryable: bool },

    /// Dead-letter records could not be persisted.
    #[error("Dead-letter error: {message}")]
    DeadLetterError { message: String, retryable: bool },

    /// Transient failures lasted longer than the configured maximum downtime.
    #[error("Transient failures exceeded maximum downtime of {limit:?}: {last_error}")]
    DowntimeExceeded { limit: Duration, last_error: String },
}

impl PipelineError {
    /// Create a source error.
    pub fn source(msg: impl Into<String>) -> Self {
        Self::SourceError(msg.into())
    }

    /// Create a position invalid error.
    pub fn position_invalid(position: impl ToString, purged_through: u64) -> Self {
        Self::PositionInvalid {
            position: position.to_string(),
            purged_through,
        }
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::ConfigurationError(msg.into())
    }

    /// Wrap a checkpoint store failure.
    pub fn checkpoint(err: StoreError) -> Self {
        Self::CheckpointError {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }

    /// Wrap a dead-letter sink failure.
    pub fn dead_letter(err: StoreError) -> Self {
        Self::DeadLetterError {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }

    /// Create a downtime exceeded error.
    pub fn downtime_exceeded(limit: Duration, last_error: &PipelineError) -> Self {
        Self::DowntimeExceeded {
            limit,
            last_error: last_error.to_string(),
        }
    }

    /// Whether the failed operation should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceUnavailable(_) | Self::IndexUnavailable(_) => true,
            Self::CheckpointError { retryable, .. } | Self::DeadLetterError { retryable, .. } => {
                *retryable
            }
            Self::SourceError(_)
            | Self::PositionInvalid { .. }
            | Self::IndexError(_)
            | Self::ConfigurationError(_)
            | Self::DowntimeExceeded { .. } => false,
        }
    }

    /// Whether the pipeline has to stop.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    /// What an operator has to do before the pipeline can run again.
    pub fn operator_action(&self) -> &'static str {
        match self {
            Self::PositionInvalid { .. } => {
                "delete the checkpoint and restart with INITIAL_POSITION=full_backfill to resync"
            }
            Self::ConfigurationError(_) => "fix the configuration and restart",
            Self::SourceError(_) => "check the change log schema and database permissions",
            Self::IndexError(_) => "check the search cluster settings and request limits",
            Self::DowntimeExceeded { .. } => "restore connectivity to the source and the search cluster",
            Self::CheckpointError { .. } | Self::DeadLetterError { .. } => {
                "check the state directory is writable"
            }
            Self::SourceUnavailable(_) | Self::IndexUnavailable(_) => "restart the sync",
        }
    }
}

impl From<SourceError> for PipelineError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable(msg) => Self::SourceUnavailable(msg),
            other => Self::SourceError(other.to_string()),
        }
    }
}

impl From<SearchIndexError> for PipelineError {
    fn from(err: SearchIndexError) -> Self {
        if err.is_retryable() {
            Self::IndexUnavailable(err.to_string())
        } else {
            Self::IndexError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_conversion() {
        let transient: PipelineError = SourceError::unavailable("connection reset").into();
        assert!(transient.is_retryable());

        let fatal: PipelineError = SourceError::query("relation cdc.change_log does not exist").into();
        assert!(fatal.is_fatal());
    }

    #[test]
    fn test_index_error_conversion() {
        let transient: PipelineError = SearchIndexError::unavailable("503").into();
        assert!(matches!(transient, PipelineError::IndexUnavailable(_)));

        let fatal: PipelineError = SearchIndexError::rejected("413 request too large").into();
        assert!(matches!(fatal, PipelineError::IndexError(_)));
    }

    #[test]
    fn test_store_error_classification() {
        let io = StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert!(PipelineError::checkpoint(io).is_retryable());
        assert!(PipelineError::dead_letter(StoreError::serialization("bad")).is_fatal());
    }

    #[test]
    fn test_position_invalid_names_action() {
        let err = PipelineError::position_invalid(3, 10);
        assert!(err.is_fatal());
        assert!(err.to_string().contains("purged through 10"));
        assert!(err.operator_action().contains("full_backfill"));
    }

    #[test]
    fn test_every_fatal_error_names_an_action() {
        let errors = [
            PipelineError::SourceUnavailable("down".to_string()),
            PipelineError::source("bad column"),
            PipelineError::position_invalid(1, 2),
            PipelineError::IndexUnavailable("503".to_string()),
            PipelineError::IndexError("413".to_string()),
            PipelineError::configuration("no tables"),
            PipelineError::checkpoint(StoreError::serialization("bad")),
            PipelineError::dead_letter(StoreError::serialization("bad")),
            PipelineError::downtime_exceeded(
                Duration::from_secs(60),
                &PipelineError::SourceUnavailable("down".to_string()),
            ),
        ];

        let fatal: Vec<&PipelineError> = errors.iter().filter(|e| e.is_fatal()).collect();
        assert_eq!(fatal.len(), 7);
        for err in fatal {
            assert_ne!(err.operator_action(), "restart the sync", "{}", err);
        }
    }
}
