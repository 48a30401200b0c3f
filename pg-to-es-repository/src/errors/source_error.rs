//! Change source error types.

use thiserror::Error;

/// Errors that can occur while reading from the relational source.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The source could not be reached or dropped the connection.
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// A query was rejected (missing relation, bad column, permissions).
    #[error("Query error: {0}")]
    QueryError(String),

    /// A change-log or snapshot row could not be decoded.
    #[error("Decode error: {0}")]
    DecodeError(String),
}

impl SourceError {
    /// Create an unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a query error.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::QueryError(msg.into())
    }

    /// Create a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::DecodeError(msg.into())
    }

    /// Whether reconnecting and retrying can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
