//! Versioned outer continuation token
//!
//! ```text
//! {"version": "1.1", "sourceContinuationToken": <json>, "queryPlan": <plan>}
//! ```
//!
//! Version 1.0 carries no plan. A token with no `version` field is the bare
//! source token of an older client and is treated as version 0.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::{PartitionedQueryExecutionInfo, QueryError, QueryResult};
use crate::observability::{log_event_with_fields, QueryEvent};

/// `major.minor` token version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokenVersion {
    pub major: u32,
    pub minor: u32,
}

impl TokenVersion {
    /// Bare source tokens
    pub const V0: TokenVersion = TokenVersion { major: 0, minor: 0 };
    /// Versioned, no query plan
    pub const V1_0: TokenVersion = TokenVersion { major: 1, minor: 0 };
    /// Versioned, optional query plan
    pub const V1_1: TokenVersion = TokenVersion { major: 1, minor: 1 };
    /// Version written by this crate
    pub const CURRENT: TokenVersion = TokenVersion::V1_1;

    /// Parse `"major.minor"`
    pub fn parse(text: &str) -> Option<Self> {
        let (major, minor) = text.split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    fn is_supported(&self) -> bool {
        *self == Self::V1_0 || *self == Self::V1_1
    }
}

impl fmt::Display for TokenVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Serialize, Deserialize)]
struct WireToken {
    version: String,
    #[serde(rename = "sourceContinuationToken")]
    source: Option<Value>,
    #[serde(rename = "queryPlan", default, skip_serializing_if = "Option::is_none")]
    query_plan: Option<Value>,
}

/// Continuation handed to the caller after each page
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineContinuationToken {
    pub version: TokenVersion,
    /// Continuation of the outermost pipeline stage
    pub source: Value,
    /// Plan cached from the first page, if it fit
    pub query_plan: Option<PartitionedQueryExecutionInfo>,
}

impl PipelineContinuationToken {
    /// Parse a caller supplied continuation
    pub fn parse(raw: &str) -> QueryResult<Self> {
        let value: Value = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;

        if !value.as_object().is_some_and(|o| o.contains_key("version")) {
            return Ok(Self {
                version: TokenVersion::V0,
                source: value,
                query_plan: None,
            });
        }

        let wire: WireToken = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
        let version = TokenVersion::parse(&wire.version).ok_or_else(|| {
            QueryError::UnsupportedContinuationToken(format!("unparsable version '{}'", wire.version))
        })?;
        if version.cmp(&TokenVersion::CURRENT) == Ordering::Greater {
            return Err(QueryError::UnsupportedContinuationToken(format!(
                "version {} is newer than {}",
                version,
                TokenVersion::CURRENT
            )));
        }
        if !version.is_supported() {
            return Err(QueryError::UnsupportedContinuationToken(format!("version {}", version)));
        }

        let source = wire
            .source
            .ok_or_else(|| malformed("missing sourceContinuationToken".to_string()))?;
        let query_plan = match (version, wire.query_plan) {
            (TokenVersion::V1_1, Some(plan)) => {
                Some(serde_json::from_value(plan).map_err(|e| malformed(format!("query plan: {}", e)))?)
            }
            _ => None,
        };

        Ok(Self {
            version,
            source,
            query_plan,
        })
    }

    /// Write the current version, dropping the plan if it would exceed `limit_bytes`
    pub fn serialize(
        source: Value,
        query_plan: Option<&PartitionedQueryExecutionInfo>,
        limit_bytes: Option<usize>,
    ) -> QueryResult<String> {
        let plan_value = query_plan
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| QueryError::Internal(e.to_string()))?;
        let has_plan = plan_value.is_some();

        let mut wire = WireToken {
            version: TokenVersion::CURRENT.to_string(),
            source: Some(source),
            query_plan: plan_value,
        };
        let text = serde_json::to_string(&wire).map_err(|e| QueryError::Internal(e.to_string()))?;

        match limit_bytes {
            Some(limit) if has_plan && text.len() > limit => {
                let length = text.len().to_string();
                log_event_with_fields(QueryEvent::QueryPlanDropped, &[("token_bytes", &length)]);
                wire.query_plan = None;
                serde_json::to_string(&wire).map_err(|e| QueryError::Internal(e.to_string()))
            }
            _ => Ok(text),
        }
    }
}

fn malformed(message: String) -> QueryError {
    log_event_with_fields(QueryEvent::MalformedContinuation, &[("reason", &message)]);
    QueryError::MalformedContinuationToken(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_with_plan() {
        let plan = PartitionedQueryExecutionInfo::passthrough();
        let text = PipelineContinuationToken::serialize(json!([1, 2]), Some(&plan), None).unwrap();
        let token = PipelineContinuationToken::parse(&text).unwrap();
        assert_eq!(token.version, TokenVersion::V1_1);
        assert_eq!(token.source, json!([1, 2]));
        assert_eq!(token.query_plan, Some(plan));
    }

    #[test]
    fn test_plan_dropped_over_limit() {
        let plan = PartitionedQueryExecutionInfo::passthrough();
        let text = PipelineContinuationToken::serialize(json!("src"), Some(&plan), Some(48)).unwrap();
        let token = PipelineContinuationToken::parse(&text).unwrap();
        assert!(token.query_plan.is_none());
        assert_eq!(token.source, json!("src"));
    }

    #[test]
    fn test_bare_source_is_version_zero() {
        let token = PipelineContinuationToken::parse(r#"[{"token":null,"range":{"min":"","max":"FF"}}]"#).unwrap();
        assert_eq!(token.version, TokenVersion::V0);
        assert!(token.source.is_array());
    }

    #[test]
    fn test_version_one_zero_ignores_plan() {
        let token = PipelineContinuationToken::parse(
            r#"{"version":"1.0","sourceContinuationToken":"x","queryPlan":{"bogus":true}}"#,
        )
        .unwrap();
        assert_eq!(token.version, TokenVersion::V1_0);
        assert!(token.query_plan.is_none());
    }

    #[test]
    fn test_future_version_rejected() {
        let err = PipelineContinuationToken::parse(r#"{"version":"2.0","sourceContinuationToken":"x"}"#).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedContinuationToken(_)));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(PipelineContinuationToken::parse("not json").unwrap_err().is_malformed_token());
        assert!(PipelineContinuationToken::parse(r#"{"version":"one"}"#).unwrap_err().is_malformed_token());
        assert!(PipelineContinuationToken::parse(r#"{"version":"1.1"}"#).unwrap_err().is_malformed_token());
    }
}
