//! # Backend Client
//!
//! The boundary between query execution and the service. Execution only
//! needs four calls:
//!
//! 1. Run a query page against one partition range
//! 2. List the ranges overlapping a key range (after a split)
//! 3. Resolve a container to its rid
//! 4. Ask the planner for a query plan
//!
//! `InMemoryQueryClient` implements all four over an in-memory container.

mod memory;
mod types;

pub use memory::{uniform_ranges, InMemoryQueryClient};
pub use types::{
    BackendFailure, BackendPage, ContainerProperties, FetchDiagnostics, FetchRequest, QueryParameter,
    QuerySpec, STATUS_GONE, SUBSTATUS_NAME_CACHE_STALE, SUBSTATUS_PARTITION_RANGE_GONE,
};

use std::future::Future;
use std::pin::Pin;

use crate::execution::{PartitionedQueryExecutionInfo, QueryResult};
use crate::routing::{PartitionKeyRange, Range};

/// Boxed future returned by client calls
pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Service calls used by query execution
pub trait QueryClient: Send + Sync {
    /// Fetch one page of `request.query` from `request.range`
    fn execute_query(&self, request: FetchRequest) -> ClientFuture<'_, Result<BackendPage, BackendFailure>>;

    /// Current ranges overlapping `range`, sorted by position
    fn get_overlapping_ranges<'a>(
        &'a self,
        collection_rid: &'a str,
        range: &'a Range,
        force_refresh: bool,
    ) -> ClientFuture<'a, QueryResult<Vec<PartitionKeyRange>>>;

    /// Resolve a container link to its properties
    fn resolve_container<'a>(
        &'a self,
        container_link: &'a str,
        force_refresh: bool,
    ) -> ClientFuture<'a, QueryResult<ContainerProperties>>;

    /// Plan a query
    fn get_query_plan<'a>(
        &'a self,
        collection_rid: &'a str,
        query: &'a QuerySpec,
    ) -> ClientFuture<'a, QueryResult<PartitionedQueryExecutionInfo>>;
}
