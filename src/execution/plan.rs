//! Query plan metadata
//!
//! The planner decides which stages a query needs and rewrites the query
//! that each partition runs. This module only carries its decisions.

use serde::{Deserialize, Serialize};

use crate::routing::Range;

/// Placeholder in an order-by rewritten query that receives the resume filter
pub const ORDER_BY_FILTER_PLACEHOLDER: &str = "{documentdb-formattableorderbyquery-filter}";

/// Direction of one sort column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    /// Applies the direction to an ascending comparison
    pub fn apply(self, ordering: std::cmp::Ordering) -> std::cmp::Ordering {
        match self {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }
}

/// Kind of DISTINCT the query asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistinctType {
    #[default]
    None,
    /// Duplicates are adjacent in the source stream
    Ordered,
    /// Duplicates can appear anywhere
    Unordered,
}

/// What the planner learned about a query
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryInfo {
    #[serde(default)]
    pub order_by: Vec<SortOrder>,
    #[serde(default)]
    pub order_by_expressions: Vec<String>,
    #[serde(default)]
    pub top: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub distinct_type: DistinctType,
    #[serde(default)]
    pub aggregates: Vec<String>,
    #[serde(default)]
    pub group_by_expressions: Vec<String>,
    /// Query each partition runs; the original query when empty
    #[serde(default)]
    pub rewritten_query: Option<String>,
}

impl QueryInfo {
    pub fn has_order_by(&self) -> bool {
        !self.order_by.is_empty()
    }

    pub fn has_aggregates(&self) -> bool {
        !self.aggregates.is_empty()
    }

    pub fn has_group_by(&self) -> bool {
        !self.group_by_expressions.is_empty()
    }

    pub fn has_distinct(&self) -> bool {
        self.distinct_type != DistinctType::None
    }
}

/// Query plan as returned by the planner
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionedQueryExecutionInfo {
    pub query_info: QueryInfo,
    /// Key ranges the query can touch
    pub query_ranges: Vec<Range>,
}

impl PartitionedQueryExecutionInfo {
    /// Plan for a query that needs no stages and touches every partition
    pub fn passthrough() -> Self {
        Self {
            query_info: QueryInfo::default(),
            query_ranges: vec![Range::full()],
        }
    }
}
