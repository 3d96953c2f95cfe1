//! # Query Errors
//!
//! Error types shared by every layer of query execution.

use thiserror::Error;

use crate::client::BackendFailure;

/// Result type for query execution
pub type QueryResult<T> = Result<T, QueryError>;

/// Query execution errors
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    // ==================
    // Continuation Errors
    // ==================
    /// Continuation token could not be parsed or does not match the query
    #[error("Malformed continuation token: {0}")]
    MalformedContinuationToken(String),

    /// Continuation token was produced by an unknown or newer version
    #[error("Unsupported continuation token: {0}")]
    UnsupportedContinuationToken(String),

    // ==================
    // Backend Errors
    // ==================
    /// A partition fetch failed
    #[error("Backend failure: {0}")]
    Backend(BackendFailure),

    // ==================
    // Request Errors
    // ==================
    /// Argument outside its contract
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The query plan needs a stage this engine does not run
    #[error("Unsupported query plan: {0}")]
    UnsupportedQueryPlan(String),

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    // ==================
    // Internal Errors
    // ==================
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueryError {
    /// Returns the HTTP-style status code surfaced to the caller
    pub fn status_code(&self) -> u16 {
        match self {
            QueryError::MalformedContinuationToken(_)
            | QueryError::UnsupportedContinuationToken(_)
            | QueryError::InvalidArgument(_)
            | QueryError::UnsupportedQueryPlan(_) => 400,
            QueryError::Backend(failure) => failure.status_code,
            QueryError::Cancelled => 499,
            QueryError::Internal(_) => 500,
        }
    }

    /// True for continuation token errors of either kind
    pub fn is_malformed_token(&self) -> bool {
        matches!(
            self,
            QueryError::MalformedContinuationToken(_) | QueryError::UnsupportedContinuationToken(_)
        )
    }

    /// True when the backend reported a stale collection cache
    pub fn is_name_cache_stale(&self) -> bool {
        matches!(self, QueryError::Backend(failure) if failure.is_name_cache_stale())
    }

    /// True when the backend reported the partition range was split
    pub fn is_partition_split(&self) -> bool {
        matches!(self, QueryError::Backend(failure) if failure.is_partition_split())
    }

    /// Request charge carried by the failure, if any
    pub fn request_charge(&self) -> f64 {
        match self {
            QueryError::Backend(failure) => failure.request_charge,
            _ => 0.0,
        }
    }

    /// Shorthand for a poisoned lock
    pub(crate) fn lock_poisoned() -> Self {
        QueryError::Internal("Lock poisoned".into())
    }
}

impl From<BackendFailure> for QueryError {
    fn from(failure: BackendFailure) -> Self {
        QueryError::Backend(failure)
    }
}
