//! Request and response types exchanged with the backend

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::execution::ResumeFilter;
use crate::routing::PartitionKeyRange;

/// Status of a request against a resource that moved
pub const STATUS_GONE: u16 = 410;

/// Substatus: the collection cache is stale
pub const SUBSTATUS_NAME_CACHE_STALE: u32 = 1000;

/// Substatus: the partition range was split or merged
pub const SUBSTATUS_PARTITION_RANGE_GONE: u32 = 1002;

/// Named query parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParameter {
    pub name: String,
    pub value: Value,
}

/// Query text plus parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(rename = "query")]
    pub query_text: String,
    #[serde(default)]
    pub parameters: Vec<QueryParameter>,
}

impl QuerySpec {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            parameters: Vec::new(),
        }
    }

    /// Add a parameter
    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.push(QueryParameter {
            name: name.into(),
            value,
        });
        self
    }

    /// Same parameters, `placeholder` in the text replaced by `with`
    pub fn replace_text(&self, placeholder: &str, with: &str) -> Self {
        Self {
            query_text: self.query_text.replace(placeholder, with),
            parameters: self.parameters.clone(),
        }
    }
}

/// One page request against one partition range
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub collection_rid: String,
    pub range: PartitionKeyRange,
    pub query: QuerySpec,
    /// Structured form of the resume filter already spliced into `query`
    pub resume_filter: Option<Arc<ResumeFilter>>,
    /// Backend continuation to resume from
    pub continuation: Option<String>,
    pub page_size: u32,
}

/// A successful page from one partition
#[derive(Debug, Clone)]
pub struct BackendPage {
    pub items: Vec<Value>,
    /// `None` once the partition has no more results
    pub continuation: Option<String>,
    pub request_charge: f64,
    pub activity_id: Uuid,
    pub response_length_bytes: u64,
}

/// A failed page from one partition
#[derive(Debug, Clone, PartialEq)]
pub struct BackendFailure {
    pub status_code: u16,
    pub sub_status_code: u32,
    pub message: String,
    pub request_charge: f64,
    pub activity_id: Option<Uuid>,
}

impl BackendFailure {
    pub fn new(status_code: u16, sub_status_code: u32, message: impl Into<String>) -> Self {
        Self {
            status_code,
            sub_status_code,
            message: message.into(),
            request_charge: 0.0,
            activity_id: None,
        }
    }

    /// The range was split; its children must be queried instead
    pub fn is_partition_split(&self) -> bool {
        self.status_code == STATUS_GONE && self.sub_status_code == SUBSTATUS_PARTITION_RANGE_GONE
    }

    /// The collection cache is stale; the whole query must be rebuilt
    pub fn is_name_cache_stale(&self) -> bool {
        self.status_code == STATUS_GONE && self.sub_status_code == SUBSTATUS_NAME_CACHE_STALE
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.status_code, self.sub_status_code, self.message)
    }
}

/// Per-fetch record handed to the caller with each page
#[derive(Debug, Clone, Serialize)]
pub struct FetchDiagnostics {
    pub range_id: String,
    pub activity_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub item_count: usize,
    pub request_charge: f64,
}

/// Resolved container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerProperties {
    pub id: String,
    pub rid: String,
}
