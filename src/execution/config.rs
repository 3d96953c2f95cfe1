//! Query execution options

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::errors::{QueryError, QueryResult};

/// Fetch threshold ceiling: a prefetch is only issued while the free buffer
/// budget exceeds min(page size, this)
pub const PREFETCH_THRESHOLD_CAP: u64 = 4 * 1024 * 1024;

/// Factor the page size of a producer grows by after each completed fetch
pub const PAGE_SIZE_GROWTH_FACTOR: f64 = 1.6;

/// Options of one query execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Background fetches allowed in flight; 0 disables prefetch
    #[serde(default)]
    pub max_concurrency: usize,

    /// Soft budget of fetched items not yet consumed
    #[serde(default = "default_max_buffered_item_count")]
    pub max_buffered_item_count: u64,

    /// Items per page returned to the caller, and the backend page size
    #[serde(default = "default_max_item_count")]
    pub max_item_count: u32,

    /// Length limit of the continuation token in KiB
    #[serde(default)]
    pub response_continuation_token_limit_kb: Option<u32>,

    /// Keep only the continuations needed to resume exactly
    #[serde(default = "default_true")]
    pub return_results_in_deterministic_order: bool,

    /// Rebuild once when the collection cache turns out to be stale
    #[serde(default = "default_true")]
    pub enable_stale_cache_retry: bool,
}

fn default_max_buffered_item_count() -> u64 {
    1000
}
fn default_max_item_count() -> u32 {
    100
}
fn default_true() -> bool {
    true
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            max_buffered_item_count: default_max_buffered_item_count(),
            max_item_count: default_max_item_count(),
            response_continuation_token_limit_kb: None,
            return_results_in_deterministic_order: true,
            enable_stale_cache_retry: true,
        }
    }
}

impl QueryOptions {
    /// Load options from a JSON file
    pub fn from_file(path: &Path) -> QueryResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| QueryError::InvalidArgument(format!("Failed to read options: {}", e)))?;

        let options: QueryOptions = serde_json::from_str(&content)
            .map_err(|e| QueryError::InvalidArgument(format!("Invalid options JSON: {}", e)))?;

        options.validate()?;
        Ok(options)
    }

    /// Check every option against its contract
    pub fn validate(&self) -> QueryResult<()> {
        if self.max_item_count == 0 {
            return Err(QueryError::InvalidArgument("max_item_count must be > 0".into()));
        }
        if self.max_buffered_item_count == 0 {
            return Err(QueryError::InvalidArgument("max_buffered_item_count must be > 0".into()));
        }
        if self.response_continuation_token_limit_kb == Some(0) {
            return Err(QueryError::InvalidArgument(
                "response_continuation_token_limit_kb must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Buffer budget actually enforced: never less than one page
    pub fn effective_buffer_budget(&self, page_size: u32) -> u64 {
        self.max_buffered_item_count.max(page_size as u64)
    }

    /// Continuation length limit in bytes
    pub fn continuation_limit_bytes(&self) -> Option<usize> {
        self.response_continuation_token_limit_kb.map(|kb| kb as usize * 1024)
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_item_count(mut self, max_item_count: u32) -> Self {
        self.max_item_count = max_item_count;
        self
    }

    pub fn with_max_buffered_item_count(mut self, count: u64) -> Self {
        self.max_buffered_item_count = count;
        self
    }
}
