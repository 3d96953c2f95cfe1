//! # Cross-Partition Query Execution
//!
//! Drains a query over every partition range it touches and hands back
//! pages with resumable continuations.
//!
//! # Layers
//!
//! - `cross_partition`: the producer forest and prefetch coordination
//! - `parallel` / `order_by`: range-order concatenation and k-way merge
//! - `pipeline`: DISTINCT, OFFSET, LIMIT and TOP over either strategy
//! - `wrappers`: lazy build, stale cache retry, panic capture
//! - `factory`: composes all of the above from a query and its options
//!
//! # Guarantees
//!
//! - Every document of every range is returned exactly once, including
//!   across continuations and partition splits
//! - Order-by results are monotonic in the sort key, ties broken by range
//! - A page is returned either whole or not at all

mod config;
mod context;
mod cross_partition;
mod errors;
mod factory;
mod order_by;
mod parallel;
mod pipeline;
mod plan;
mod wrappers;

pub use config::{QueryOptions, PAGE_SIZE_GROWTH_FACTOR, PREFETCH_THRESHOLD_CAP};
pub use context::{ContextFuture, QueryExecutionContext, QueryPage};
pub use cross_partition::{
    resume_continuation, resume_skip_count, CrossPartitionContext, DrainPolicies, EngineSettings, FetchPriority, PageMetrics,
    ProducerFilterHook, ProducerTarget,
};
pub use errors::{QueryError, QueryResult};
pub use factory::QueryContextFactory;
pub use order_by::{compare_items, compare_sort_keys, FormattedFilters, OrderByColumn, OrderByContext, ResumeFilter};
pub use parallel::ParallelContext;
pub use pipeline::{
    DistinctStage, DistinctState, DocumentSource, PipelineParams, PipelinedContext, SkipStage, TakeKind, TakeStage,
};
pub use plan::{DistinctType, PartitionedQueryExecutionInfo, QueryInfo, SortOrder, ORDER_BY_FILTER_PLACEHOLDER};
pub use wrappers::{
    BuildFuture, BuildRequest, CatchAllQueryContext, ContextBuilder, LazyQueryContext, NameCacheStaleRetryQueryContext,
};
