//! Parallel continuation tokens
//!
//! Wire form: `[{"token": "<backend token>" | null, "range": {"min": "..", "max": ".."}}, ...]`
//!
//! A range stopped partway through a backend page also carries
//! `"skipCount"`, the items of that page already returned.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::{QueryError, QueryResult};
use crate::routing::{Range, RangeToken};

/// Backend continuation for one partition range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeContinuationToken {
    /// Backend continuation; `null` means the range has not been read yet
    pub token: Option<String>,
    /// Range the backend continuation belongs to
    pub range: Range,
    /// Items of the page at `token` already returned
    #[serde(rename = "skipCount", default, skip_serializing_if = "is_zero")]
    pub skip_count: u64,
}

fn is_zero(count: &u64) -> bool {
    *count == 0
}

impl CompositeContinuationToken {
    /// Create a token
    pub fn new(token: Option<String>, range: Range) -> Self {
        Self {
            token,
            range,
            skip_count: 0,
        }
    }

    /// Same token, resuming `skip_count` items into its page
    pub fn with_skip_count(mut self, skip_count: u64) -> Self {
        self.skip_count = skip_count;
        self
    }

    /// Reject tokens whose range is empty or inverted
    pub fn validate(&self) -> QueryResult<()> {
        if !self.range.is_valid() {
            return Err(QueryError::MalformedContinuationToken(format!(
                "invalid range [{}, {})",
                self.range.min, self.range.max
            )));
        }
        Ok(())
    }

    /// Parse and validate a parallel continuation
    pub fn parse_list(value: &Value) -> QueryResult<Vec<Self>> {
        if !value.is_array() {
            return Err(QueryError::MalformedContinuationToken(
                "parallel continuation must be an array".into(),
            ));
        }
        let tokens: Vec<Self> = serde_json::from_value(value.clone())
            .map_err(|e| QueryError::MalformedContinuationToken(e.to_string()))?;
        if tokens.is_empty() {
            return Err(QueryError::MalformedContinuationToken(
                "parallel continuation is empty".into(),
            ));
        }
        for token in &tokens {
            token.validate()?;
        }
        Ok(tokens)
    }
}

impl RangeToken for CompositeContinuationToken {
    fn range(&self) -> &Range {
        &self.range
    }
}
