//! Shared fixtures for the integration tests
//!
//! Containers are built on `InMemoryQueryClient` with uniform ranges.
//! Document keys are placed inside their range as `<range start + 1><index>`
//! so each range owns a known set of documents.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use crossquery::client::{InMemoryQueryClient, QueryClient, QuerySpec};
use crossquery::execution::{
    PartitionedQueryExecutionInfo, QueryContextFactory, QueryExecutionContext, QueryOptions, QueryPage,
    QueryResult, SortOrder, ORDER_BY_FILTER_PLACEHOLDER,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

pub const CONTAINER_LINK: &str = "dbs/test/colls/items";

/// Effective partition key of the `index`-th document of range `range`
pub fn epk(range_count: usize, range: usize, index: usize) -> String {
    let step = 256 / range_count;
    format!("{:02X}{:04}", range * step + 1, index)
}

/// Container with `per_range` documents in each of `range_count` ranges
///
/// Document `{"id": "r<range>-<i>", "range": range, "k": key}` where
/// `key(range, i)` supplies the sort value.
pub fn populated(
    range_count: usize,
    per_range: usize,
    key: impl Fn(usize, usize) -> Value,
) -> Arc<InMemoryQueryClient> {
    let client = Arc::new(InMemoryQueryClient::with_uniform_ranges("items", range_count));
    for range in 0..range_count {
        for i in 0..per_range {
            let k = key(range, i);
            client.insert(
                &epk(range_count, range, i),
                vec![k.clone()],
                json!({"id": format!("r{}-{}", range, i), "range": range, "k": k}),
            );
        }
    }
    client
}

/// Plan and backend shape of `SELECT * FROM c ORDER BY c.k <order>`
pub fn use_order_by(client: &InMemoryQueryClient, order: SortOrder) {
    client.set_sort_orders(vec![order]);
    let mut plan = PartitionedQueryExecutionInfo::passthrough();
    plan.query_info.order_by = vec![order];
    plan.query_info.order_by_expressions = vec!["c.k".to_string()];
    plan.query_info.rewritten_query = Some(format!(
        "SELECT c._rid, [{{\"item\": c.k}}] AS orderByItems, c AS payload FROM c WHERE {}",
        ORDER_BY_FILTER_PLACEHOLDER
    ));
    client.set_query_plan(plan);
}

pub fn query() -> QuerySpec {
    QuerySpec::new("SELECT * FROM c")
}

pub fn context(
    client: &Arc<InMemoryQueryClient>,
    options: QueryOptions,
    continuation: Option<String>,
) -> QueryResult<Box<dyn QueryExecutionContext>> {
    let client: Arc<dyn QueryClient> = client.clone();
    QueryContextFactory::create(client, CONTAINER_LINK, query(), options, continuation)
}

/// Every page of one context
pub async fn drain_pages(client: &Arc<InMemoryQueryClient>, options: QueryOptions) -> Vec<QueryPage> {
    let cancel = CancellationToken::new();
    let mut ctx = context(client, options, None).unwrap();
    let mut pages = Vec::new();
    while !ctx.is_done() {
        let page = ctx.execute_next(&cancel).await.unwrap();
        pages.push(page);
    }
    pages
}

/// Every item, building a fresh context from the continuation of each page
pub async fn drain_resuming(client: &Arc<InMemoryQueryClient>, options: QueryOptions) -> Vec<Value> {
    let cancel = CancellationToken::new();
    let mut items = Vec::new();
    let mut continuation = None;
    loop {
        let mut ctx = context(client, options.clone(), continuation.take()).unwrap();
        let page = ctx.execute_next(&cancel).await.unwrap();
        items.extend(page.items);
        match page.continuation_token {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }
    items
}

/// Ids of `items`, which are documents or parallel rows
pub fn ids(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.get("id").and_then(Value::as_str).map(str::to_string))
        .collect()
}

/// Occurrences of each id
pub fn id_counts(items: &[Value]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for id in ids(items) {
        *counts.entry(id).or_insert(0) += 1;
    }
    counts
}

/// Assert every document of the container appears exactly once
pub fn assert_exactly_once(items: &[Value], range_count: usize, per_range: usize) {
    let counts = id_counts(items);
    assert_eq!(counts.len(), range_count * per_range, "missing documents");
    for (id, count) in counts {
        assert_eq!(count, 1, "{} returned {} times", id, count);
    }
}
