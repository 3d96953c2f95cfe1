//! crossquery - Cross-partition query execution
//!
//! Fans a query out over the partition ranges of a container, prefetches
//! pages in the background and merges them into one stream of pages with
//! resumable continuation tokens.

pub mod client;
pub mod continuation;
pub mod execution;
pub mod observability;
pub mod producer;
pub mod routing;
pub mod scheduler;

pub use client::{InMemoryQueryClient, QueryClient, QuerySpec};
pub use execution::{QueryContextFactory, QueryError, QueryExecutionContext, QueryOptions, QueryPage, QueryResult};
