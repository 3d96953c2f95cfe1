//! Order-by strategy: a k-way merge over partitions that each return rows
//! in sort order.
//!
//! Rows arrive as `{"_rid": .., "orderByItems": [{"item": ..}], "payload": ..}`.
//! The merge emits the payload of the smallest head row, ties broken by
//! range position. A resumed query re-runs each partition with a filter
//! admitting only keys at or after the last emitted one, then seeks every
//! producer that had a token past the rows it already emitted.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::comparer::compare_sort_keys;
use super::filter::{OrderByColumn, ResumeFilter};
use crate::client::QuerySpec;
use crate::continuation::{CompositeContinuationToken, OrderByContinuationToken, OrderByItem};
use crate::execution::cross_partition::{
    resume_continuation, CrossPartitionContext, DrainPolicies, EngineSettings, FilterHookFuture, PageMetrics,
    ProducerFilterHook, ProducerTarget,
};
use crate::execution::pipeline::{DocumentSource, SourceFuture};
use crate::execution::{QueryError, QueryResult, SortOrder, ORDER_BY_FILTER_PLACEHOLDER};
use crate::producer::{ItemProducer, PartitionFetcher, ProducerTree};
use crate::routing::{try_get_initialization_info, PartitionKeyRange, ResourceId};

/// Sort key of an order-by row; missing items are undefined
pub(crate) fn sort_key_of(row: &Value) -> Vec<Option<Value>> {
    row.get("orderByItems")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(|entry| entry.get("item").cloned()).collect())
        .unwrap_or_default()
}

fn rid_of(row: &Value) -> Option<&str> {
    row.get("_rid").and_then(Value::as_str)
}

/// Cross-partition source merging partitions in sort order
pub struct OrderByContext {
    engine: CrossPartitionContext,
    previous_rid: Option<String>,
    skip_count: u32,
}

impl OrderByContext {
    /// Build the context over `ranges`
    ///
    /// `query` is the rewritten query carrying the filter placeholder.
    pub async fn create(
        settings: EngineSettings,
        query: QuerySpec,
        ranges: Vec<PartitionKeyRange>,
        columns: Vec<OrderByColumn>,
        continuation: Option<&Value>,
        cancel: &CancellationToken,
    ) -> QueryResult<Self> {
        if columns.is_empty() {
            return Err(QueryError::InvalidArgument("order by needs at least one column".into()));
        }
        let sort_orders: Vec<SortOrder> = columns.iter().map(|c| c.sort_order).collect();
        let mut engine = CrossPartitionContext::new(settings, Self::policies(sort_orders.clone()));

        match continuation {
            None => {
                let spec = query.replace_text(ORDER_BY_FILTER_PLACEHOLDER, "true");
                let mut ranges = ranges;
                ranges.sort_by(|a, b| a.cmp_position(b));
                let targets = ranges
                    .into_iter()
                    .map(|range| ProducerTarget::fresh(range, spec.clone()))
                    .collect();
                engine.initialize(targets, false, None, cancel).await?;
            }
            Some(value) => {
                let (targets, seeks) = Self::resume_targets(&ranges, &query, &columns, value)?;
                let hook = SeekHook { seeks, sort_orders };
                engine.initialize(targets, false, Some(&hook), cancel).await?;
            }
        }

        Ok(Self {
            engine,
            previous_rid: None,
            skip_count: 0,
        })
    }

    fn policies(sort_orders: Vec<SortOrder>) -> DrainPolicies {
        let orders: Arc<[SortOrder]> = sort_orders.into();
        let ordering_orders = Arc::clone(&orders);
        DrainPolicies {
            ordering: Arc::new(move |a: &ItemProducer, b: &ItemProducer| {
                let by_key = match (a.current(), b.current()) {
                    (Some(x), Some(y)) => compare_sort_keys(&sort_key_of(x), &sort_key_of(y), &ordering_orders),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                by_key.then_with(|| a.range().cmp_position(b.range()))
            }),
            fetch_priority: Arc::new(|fetcher: &PartitionFetcher| fetcher.buffered_item_count() as i64),
            equality: Arc::new(move |a: &Value, b: &Value| {
                compare_sort_keys(&sort_key_of(a), &sort_key_of(b), &orders) == Ordering::Equal
            }),
        }
    }

    /// Targets for every current range with its filter, plus the token each
    /// one must seek past
    #[allow(clippy::type_complexity)]
    fn resume_targets(
        ranges: &[PartitionKeyRange],
        query: &QuerySpec,
        columns: &[OrderByColumn],
        value: &Value,
    ) -> QueryResult<(Vec<ProducerTarget>, Vec<Option<OrderByContinuationToken>>)> {
        let tokens = OrderByContinuationToken::parse_list(value, columns.len())?;
        let info = try_get_initialization_info(ranges, &tokens)?;

        if info.target.first().and_then(|(_, token)| token.as_ref()).is_none() {
            return Err(QueryError::MalformedContinuationToken("no token for the target range".into()));
        }
        // Every range still to emit is at or after the smallest token key
        let sort_orders: Vec<SortOrder> = columns.iter().map(|c| c.sort_order).collect();
        let key = tokens
            .iter()
            .map(OrderByContinuationToken::sort_key)
            .min_by(|a, b| compare_sort_keys(a, b, &sort_orders))
            .ok_or_else(|| QueryError::MalformedContinuationToken("order by continuation is empty".into()))?;
        let filters = ResumeFilter::formatted(columns, &key);

        let mut targets = Vec::new();
        let mut seeks = Vec::new();
        for (mapping, filter) in [
            (info.left_of_target, filters.left),
            (info.target, filters.target),
            (info.right_of_target, filters.right),
        ] {
            let text = filter.render();
            let spec = query.replace_text(ORDER_BY_FILTER_PLACEHOLDER, &text);
            let filter = Arc::new(filter);
            for (range, token) in mapping {
                targets.push(ProducerTarget {
                    range,
                    backend_continuation: token.as_ref().and_then(|t| t.composite_token.token.clone()),
                    query: spec.clone(),
                    resume_filter: Some(Arc::clone(&filter)),
                    filter_text: Some(text.clone()),
                    skip_count: 0,
                });
                seeks.push(token);
            }
        }
        Ok((targets, seeks))
    }

    /// A row repeating the previous rid past the start of its page is a
    /// join fan-out duplicate
    fn should_increment_skip_count(&self, producer: &ItemProducer) -> bool {
        !producer.is_at_beginning_of_page()
            && self.previous_rid.is_some()
            && producer.current().and_then(rid_of) == self.previous_rid.as_deref()
    }

    async fn drain(&mut self, max_elements: usize, cancel: &CancellationToken) -> QueryResult<Vec<Value>> {
        let mut items = Vec::new();
        while items.len() < max_elements {
            let Some(mut tree) = self.engine.pop_current()? else {
                break;
            };
            let Some(row) = tree.current().current().cloned() else {
                if tree.has_more_results() {
                    self.engine.push_back(tree)?;
                    break;
                }
                continue;
            };

            if self.should_increment_skip_count(tree.current()) {
                self.skip_count += 1;
            } else {
                self.skip_count = 0;
            }
            self.previous_rid = rid_of(&row).map(str::to_string);
            // A row without payload is an undefined projection
            if let Some(payload) = row.get("payload") {
                items.push(payload.clone());
            }

            if self.engine.move_next_helper(&mut tree, cancel).await? {
                self.engine.push_back(tree)?;
            }
        }
        Ok(items)
    }

    fn token_for(&self, producer: &ItemProducer) -> QueryResult<OrderByContinuationToken> {
        let row = producer.current().ok_or_else(|| {
            QueryError::Internal(format!("range {} has results but no current row", producer.range().id))
        })?;
        let order_by_items: Vec<OrderByItem> = row
            .get("orderByItems")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| QueryError::Internal(format!("order by items: {}", e)))?
            .unwrap_or_default();
        let rid = rid_of(row)
            .ok_or_else(|| QueryError::Internal("order by row without _rid".into()))?
            .to_string();
        let skip_count = if self.should_increment_skip_count(producer) {
            self.skip_count + 1
        } else {
            0
        };

        Ok(OrderByContinuationToken {
            composite_token: CompositeContinuationToken::new(
                resume_continuation(producer),
                producer.range().to_range(),
            ),
            order_by_items,
            rid,
            skip_count,
            filter: producer.filter().map(str::to_string),
        })
    }
}

impl DocumentSource for OrderByContext {
    fn drain_page<'a>(&'a mut self, max_elements: usize, cancel: &'a CancellationToken) -> SourceFuture<'a, Vec<Value>> {
        Box::pin(self.drain(max_elements, cancel))
    }

    fn is_done(&self) -> bool {
        self.engine.is_done()
    }

    fn continuation_token(&self) -> QueryResult<Option<Value>> {
        if self.engine.is_done() {
            return Ok(None);
        }
        let tokens = self
            .engine
            .visit_active_producers(|p| self.token_for(p))?
            .into_iter()
            .collect::<QueryResult<Vec<_>>>()?;
        if tokens.is_empty() {
            return Ok(None);
        }
        serde_json::to_value(tokens)
            .map(Some)
            .map_err(|e| QueryError::Internal(e.to_string()))
    }

    fn take_metrics(&mut self) -> PageMetrics {
        self.engine.take_metrics()
    }

    fn stop(&mut self) {
        self.engine.stop();
    }
}

/// Moves resumed producers past the rows emitted before the token was taken
struct SeekHook {
    seeks: Vec<Option<OrderByContinuationToken>>,
    sort_orders: Vec<SortOrder>,
}

impl ProducerFilterHook for SeekHook {
    fn filter<'a>(
        &'a self,
        target_index: usize,
        tree: &'a mut ProducerTree,
        cancel: &'a CancellationToken,
    ) -> FilterHookFuture<'a> {
        Box::pin(async move {
            match self.seeks.get(target_index) {
                Some(Some(token)) => seek(tree, token, &self.sort_orders, cancel).await,
                _ => Ok(()),
            }
        })
    }
}

fn invalid_rid(token: &OrderByContinuationToken) -> QueryError {
    QueryError::MalformedContinuationToken(format!(
        "invalid rid '{}' in order by continuation for range [{}, {})",
        token.rid, token.composite_token.range.min, token.composite_token.range.max
    ))
}

/// Skip rows sorting before the token, then rows at the token's key with a
/// smaller rid, then `skip_count` copies of the token's own row
async fn seek(
    tree: &mut ProducerTree,
    token: &OrderByContinuationToken,
    sort_orders: &[SortOrder],
    cancel: &CancellationToken,
) -> QueryResult<()> {
    let token_rid = ResourceId::parse(&token.rid).ok_or_else(|| invalid_rid(token))?;
    let token_key = token.sort_key();
    let rid_order = sort_orders.first().copied().unwrap_or(SortOrder::Ascending);
    let mut to_skip = token.skip_count;
    let mut rid_verified = false;

    loop {
        let Some(row) = tree.current().current() else {
            break;
        };

        let cmp = compare_sort_keys(&token_key, &sort_key_of(row), sort_orders);
        if cmp == Ordering::Less {
            break;
        }
        if cmp == Ordering::Equal {
            let row_rid = rid_of(row).and_then(ResourceId::parse).ok_or_else(|| invalid_rid(token))?;
            if !rid_verified {
                if !token_rid.same_collection(&row_rid) {
                    return Err(invalid_rid(token));
                }
                rid_verified = true;
            }

            match rid_order.apply(token_rid.document.cmp(&row_rid.document)) {
                Ordering::Less => break,
                Ordering::Equal => {
                    if to_skip == 0 {
                        break;
                    }
                    to_skip -= 1;
                }
                Ordering::Greater => {}
            }
        }

        if !tree.move_next(cancel).await? {
            break;
        }
    }
    Ok(())
}
