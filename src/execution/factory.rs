//! Query context factory
//!
//! Composes the wrappers around a pipelined context:
//!
//! ```text
//! CatchAll -> NameCacheStaleRetry -> Lazy -> Pipelined -> (OrderBy | Parallel)
//! ```
//!
//! Nothing touches the service until the first `execute_next`.

use std::collections::HashSet;
use std::sync::Arc;

use super::config::QueryOptions;
use super::context::QueryExecutionContext;
use super::cross_partition::EngineSettings;
use super::errors::QueryResult;
use super::pipeline::{PipelineParams, PipelinedContext};
use super::plan::{PartitionedQueryExecutionInfo, QueryInfo};
use super::wrappers::{BuildFuture, BuildRequest, CatchAllQueryContext, ContextBuilder, LazyQueryContext, NameCacheStaleRetryQueryContext};
use crate::client::{QueryClient, QuerySpec};
use crate::continuation::PipelineContinuationToken;
use crate::routing::{PartitionKeyRange, Range};

/// Over-fetch factor of a TOP + ORDER BY page, since the first page of each
/// range must hold that range's share of the top items
const TOP_ORDER_BY_PAGE_FACTOR: u64 = 5;

/// Entry point for cross-partition queries
pub struct QueryContextFactory;

impl QueryContextFactory {
    /// Create the context of one query execution
    ///
    /// Validates `options` eagerly; everything else happens lazily on the
    /// first page.
    pub fn create(
        client: Arc<dyn QueryClient>,
        container_link: impl Into<String>,
        query: QuerySpec,
        options: QueryOptions,
        continuation: Option<String>,
    ) -> QueryResult<Box<dyn QueryExecutionContext>> {
        options.validate()?;
        let container_link = container_link.into();
        let stale_retry = options.enable_stale_cache_retry;

        let builder: ContextBuilder = Arc::new(move |request: BuildRequest| -> BuildFuture {
            let client = Arc::clone(&client);
            let container_link = container_link.clone();
            let query = query.clone();
            let options = options.clone();
            let continuation = continuation.clone();
            Box::pin(async move {
                let context = build(client, &container_link, query, &options, continuation.as_deref(), request).await?;
                Ok(Box::new(context) as Box<dyn QueryExecutionContext>)
            })
        });

        let lazy = LazyQueryContext::new(Arc::clone(&builder), false);
        let retry = NameCacheStaleRetryQueryContext::new(Box::new(lazy), builder, stale_retry);
        Ok(Box::new(CatchAllQueryContext::new(Box::new(retry))))
    }
}

async fn build(
    client: Arc<dyn QueryClient>,
    container_link: &str,
    query: QuerySpec,
    options: &QueryOptions,
    continuation: Option<&str>,
    request: BuildRequest,
) -> QueryResult<PipelinedContext> {
    let container = client.resolve_container(container_link, request.force_refresh).await?;

    let token = continuation.map(PipelineContinuationToken::parse).transpose()?;
    let (cached_plan, source) = match token {
        Some(token) => (token.query_plan, Some(token.source)),
        None => (None, None),
    };
    let plan = match cached_plan {
        Some(plan) => plan,
        None => client.get_query_plan(&container.rid, &query).await?,
    };

    let ranges = resolve_ranges(client.as_ref(), &container.rid, &plan, request.force_refresh).await?;
    let page_size = initial_page_size(&plan.query_info, options.max_item_count, ranges.len());

    let settings = EngineSettings {
        client,
        collection_rid: container.rid,
        initial_page_size: page_size,
        max_page_size: options.max_item_count.max(page_size),
        max_concurrency: options.max_concurrency,
        max_buffered_item_count: options.effective_buffer_budget(page_size),
        deterministic: options.return_results_in_deterministic_order,
    };
    let params = PipelineParams {
        settings,
        query,
        plan,
        ranges,
        max_item_count: options.max_item_count as usize,
        continuation_limit_bytes: options.continuation_limit_bytes(),
    };
    PipelinedContext::create(params, source, &request.cancel).await
}

/// Ranges overlapping the plan's key ranges, deduplicated and in position order
async fn resolve_ranges(
    client: &dyn QueryClient,
    collection_rid: &str,
    plan: &PartitionedQueryExecutionInfo,
    force_refresh: bool,
) -> QueryResult<Vec<PartitionKeyRange>> {
    let full = [Range::full()];
    let query_ranges: &[Range] = if plan.query_ranges.is_empty() {
        &full
    } else {
        &plan.query_ranges
    };

    let mut seen = HashSet::new();
    let mut ranges = Vec::new();
    for range in query_ranges {
        for pk_range in client.get_overlapping_ranges(collection_rid, range, force_refresh).await? {
            if seen.insert(pk_range.id.clone()) {
                ranges.push(pk_range);
            }
        }
    }
    ranges.sort_by(|a, b| a.cmp_position(b));
    Ok(ranges)
}

/// Backend page size of the first fetch of each range
fn initial_page_size(info: &QueryInfo, max_item_count: u32, range_count: usize) -> u32 {
    let max = max_item_count as u64;
    let size = match (info.top, info.has_order_by()) {
        (Some(top), true) => {
            let per_range = top.div_ceil(range_count.max(1) as u64);
            (per_range * TOP_ORDER_BY_PAGE_FACTOR).min(top)
        }
        (Some(top), false) => max.min(top),
        (None, _) => match info.limit {
            Some(limit) => max.min(limit.saturating_add(info.offset.unwrap_or(0))),
            None => max,
        },
    };
    size.clamp(1, u32::MAX as u64) as u32
}
