//! Pipeline Stage Tests
//!
//! Tests for plan-driven stages over the cross-partition sources:
//! - TOP, OFFSET and LIMIT hold across resumed pages
//! - DISTINCT drops duplicates with and without ORDER BY
//! - The query plan travels in the continuation unless it is too long
//! - Plans the engine cannot run are rejected

mod harness;

use crossquery::client::InMemoryQueryClient;
use crossquery::execution::{DistinctType, PartitionedQueryExecutionInfo, QueryError, QueryOptions, SortOrder};
use harness::*;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn set_plan(client: &InMemoryQueryClient, edit: impl FnOnce(&mut PartitionedQueryExecutionInfo)) {
    let mut plan = PartitionedQueryExecutionInfo::passthrough();
    edit(&mut plan);
    client.set_query_plan(plan);
}

fn drain_values(pages: Vec<crossquery::execution::QueryPage>) -> Vec<Value> {
    pages.into_iter().flat_map(|p| p.items).collect()
}

// =============================================================================
// TOP / OFFSET / LIMIT Tests
// =============================================================================

/// TOP stops after its count even across resumes.
#[tokio::test]
async fn test_top_across_resumes() {
    let client = populated(3, 4, |_, i| json!(i));
    set_plan(&client, |plan| plan.query_info.top = Some(5));

    let items = drain_resuming(&client, QueryOptions::default().with_max_item_count(2)).await;
    assert_eq!(ids(&items), vec!["r0-0", "r0-1", "r0-2", "r0-3", "r1-0"]);
}

/// OFFSET then LIMIT select a window of the range-ordered stream.
#[tokio::test]
async fn test_offset_limit_window() {
    let client = populated(2, 4, |_, i| json!(i));
    set_plan(&client, |plan| {
        plan.query_info.offset = Some(3);
        plan.query_info.limit = Some(4);
    });

    let items = drain_resuming(&client, QueryOptions::default().with_max_item_count(2)).await;
    assert_eq!(ids(&items), vec!["r0-3", "r1-0", "r1-1", "r1-2"]);
}

/// A LIMIT shorter than the backend page stops inside it; resuming after
/// every page neither repeats the offset rows nor loses the rest.
#[tokio::test]
async fn test_offset_limit_resumed_inside_backend_page() {
    let client = populated(1, 10, |_, i| json!(i));
    set_plan(&client, |plan| {
        plan.query_info.offset = Some(3);
        plan.query_info.limit = Some(4);
    });
    let options = QueryOptions::default().with_max_item_count(100);

    let single = drain_values(drain_pages(&client, options.clone()).await);
    assert_eq!(ids(&single), vec!["r0-3", "r0-4", "r0-5", "r0-6"]);

    let resumed = drain_resuming(&client, options).await;
    assert_eq!(ids(&resumed), ids(&single));
}

/// The resumed range finishes its page before the next range starts.
#[tokio::test]
async fn test_offset_limit_resumed_across_ranges() {
    let client = populated(2, 6, |_, i| json!(i));
    set_plan(&client, |plan| {
        plan.query_info.offset = Some(3);
        plan.query_info.limit = Some(5);
    });

    let items = drain_resuming(&client, QueryOptions::default().with_max_item_count(100)).await;
    assert_eq!(ids(&items), vec!["r0-3", "r0-4", "r0-5", "r1-0", "r1-1"]);
}

/// TOP over ORDER BY keeps the smallest keys.
#[tokio::test]
async fn test_top_order_by() {
    let client = populated(3, 5, |range, i| json!((i * 3 + range) as i64));
    use_order_by(&client, SortOrder::Descending);
    let mut plan = PartitionedQueryExecutionInfo::passthrough();
    plan.query_info.order_by = vec![SortOrder::Descending];
    plan.query_info.order_by_expressions = vec!["c.k".to_string()];
    plan.query_info.rewritten_query = Some(format!(
        "SELECT * FROM c WHERE {}",
        crossquery::execution::ORDER_BY_FILTER_PLACEHOLDER
    ));
    plan.query_info.top = Some(4);
    client.set_query_plan(plan);

    let pages = drain_pages(&client, QueryOptions::default().with_max_item_count(3)).await;
    let keys: Vec<i64> = drain_values(pages).iter().map(|v| v["k"].as_i64().unwrap()).collect();
    assert_eq!(keys, vec![14, 13, 12, 11]);
}

// =============================================================================
// DISTINCT Tests
// =============================================================================

/// Ordered DISTINCT over ORDER BY returns each key once.
#[tokio::test]
async fn test_ordered_distinct() {
    let client = std::sync::Arc::new(InMemoryQueryClient::with_uniform_ranges("items", 2));
    for (range, values) in [(0, [1, 1, 2]), (1, [1, 2, 3])] {
        for (i, v) in values.into_iter().enumerate() {
            client.insert(&epk(2, range, i), vec![json!(v)], json!({"k": v}));
        }
    }
    use_order_by(&client, SortOrder::Ascending);
    let mut plan = PartitionedQueryExecutionInfo::passthrough();
    plan.query_info.order_by = vec![SortOrder::Ascending];
    plan.query_info.order_by_expressions = vec!["c.k".to_string()];
    plan.query_info.distinct_type = DistinctType::Ordered;
    client.set_query_plan(plan);

    let items = drain_resuming(&client, QueryOptions::default().with_max_item_count(2)).await;
    assert_eq!(items, vec![json!({"k": 1}), json!({"k": 2}), json!({"k": 3})]);
}

/// Unordered DISTINCT remembers every value across resumes.
///
/// Scalar rows carry no `_rid`, so equal values hash equally.
#[tokio::test]
async fn test_unordered_distinct_across_resumes() {
    let client = std::sync::Arc::new(InMemoryQueryClient::with_uniform_ranges("items", 3));
    for range in 0..3 {
        for i in 0..4 {
            client.insert(&epk(3, range, i), vec![json!(i)], json!(i % 3));
        }
    }
    set_plan(&client, |plan| plan.query_info.distinct_type = DistinctType::Unordered);

    let items = drain_resuming(&client, QueryOptions::default().with_max_item_count(2)).await;
    assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
}

// =============================================================================
// Query Plan Tests
// =============================================================================

/// The plan is requested once and then read from the continuation.
#[tokio::test]
async fn test_plan_cached_in_continuation() {
    let client = populated(2, 4, |_, i| json!(i));
    let items = drain_resuming(&client, QueryOptions::default().with_max_item_count(3)).await;
    assert_exactly_once(&items, 2, 4);
    assert_eq!(client.plan_request_count(), 1);
}

/// A plan that would overflow the token limit is left out of the token.
#[tokio::test]
async fn test_plan_dropped_over_token_limit() {
    let client = populated(2, 4, |_, i| json!(i));
    set_plan(&client, |plan| plan.query_info.rewritten_query = Some(format!("SELECT * FROM c -- {}", "x".repeat(2048))));
    let mut options = QueryOptions::default().with_max_item_count(3);
    options.response_continuation_token_limit_kb = Some(1);

    let cancel = CancellationToken::new();
    let mut ctx = context(&client, options.clone(), None).unwrap();
    let token = ctx.execute_next(&cancel).await.unwrap().continuation_token.unwrap();
    assert!(!token.contains("queryPlan"));

    let mut resumed = context(&client, options, Some(token)).unwrap();
    resumed.execute_next(&cancel).await.unwrap();
    assert_eq!(client.plan_request_count(), 2);
}

/// Aggregates are rejected on the first page.
#[tokio::test]
async fn test_aggregate_plan_rejected() {
    let client = populated(2, 1, |_, i| json!(i));
    set_plan(&client, |plan| plan.query_info.aggregates = vec!["Count".to_string()]);

    let mut ctx = context(&client, QueryOptions::default(), None).unwrap();
    let err = ctx.execute_next(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, QueryError::UnsupportedQueryPlan(_)));
    assert!(ctx.is_done());
}
