//! Error types for the hypersearch engine

use thiserror::Error;

use crate::types::{JobId, ModelId};

/// Result type for search operations
pub type SearchResult<T> = std::result::Result<T, SearchError>;

/// Errors that can occur while running a search
///
/// Lost races over model ownership are not errors: the store reports them
/// as `false` from its conditional updates and the losing worker drops its
/// work. Hitting `max_models` is likewise a normal termination signal.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Bad ranges, bounds or search options, reported at submission time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backing storage failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Job not found in the store
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Model not found in the store
    #[error("Model not found: {0}")]
    ModelNotFound(ModelId),

    /// Engine state could not be written after repeated version conflicts
    #[error("Engine state for job {job} kept changing under {attempts} attempts")]
    EngineStateConflict {
        job: JobId,
        attempts: usize,
    },

    /// JSON encoding of persisted values failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other errors
    #[error("Search error: {0}")]
    Other(#[from] anyhow::Error),
}

impl SearchError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        SearchError::Configuration(msg.into())
    }

    /// Shorthand for a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        SearchError::Storage(msg.into())
    }

    /// Whether the error was caused by the caller's configuration
    pub fn is_configuration(&self) -> bool {
        matches!(self, SearchError::Configuration(_))
    }
}

impl From<rusqlite::Error> for SearchError {
    fn from(err: rusqlite::Error) -> Self {
        SearchError::Storage(err.to_string())
    }
}

impl From<tokio_rusqlite::Error> for SearchError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        SearchError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_shorthand() {
        let err = SearchError::config("min > max");
        assert!(err.is_configuration());
        assert_eq!(err.to_string(), "Configuration error: min > max");
    }

    #[test]
    fn test_storage_errors_are_not_configuration() {
        let err = SearchError::storage("disk full");
        assert!(!err.is_configuration());
    }
}
