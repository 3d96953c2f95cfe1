//! Parallel strategy
//!
//! Drains partitions left to right, one backend page at a time, so
//! everything left of the leftmost producer is fully drained. A drain asked
//! for fewer items than its page holds stops inside the page; the token then
//! records the page's backend continuation and how many of its items were
//! returned.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::cross_partition::{
    resume_continuation, resume_skip_count, CrossPartitionContext, DrainPolicies, EngineSettings, PageMetrics,
    ProducerTarget,
};
use super::errors::{QueryError, QueryResult};
use super::pipeline::{DocumentSource, SourceFuture};
use crate::client::QuerySpec;
use crate::continuation::CompositeContinuationToken;
use crate::observability::{log_event_with_fields, QueryEvent};
use crate::producer::{never_equal, ItemProducer, PartitionFetcher};
use crate::routing::{try_get_initialization_info, PartitionKeyRange, Range};

/// Cross-partition source returning partitions in range order
pub struct ParallelContext {
    engine: CrossPartitionContext,
}

impl ParallelContext {
    /// Build the context over `ranges`, resuming from `continuation` if given
    pub async fn create(
        settings: EngineSettings,
        query: QuerySpec,
        ranges: Vec<PartitionKeyRange>,
        continuation: Option<&Value>,
        cancel: &CancellationToken,
    ) -> QueryResult<Self> {
        let targets = match continuation {
            Some(value) => Self::resume_targets(&ranges, &query, value)?,
            None => {
                let mut ranges = ranges;
                ranges.sort_by(|a, b| a.cmp_position(b));
                ranges
                    .into_iter()
                    .map(|range| ProducerTarget::fresh(range, query.clone()))
                    .collect()
            }
        };

        let mut engine = CrossPartitionContext::new(settings, Self::policies());
        engine.initialize(targets, true, None, cancel).await?;
        Ok(Self { engine })
    }

    fn policies() -> DrainPolicies {
        DrainPolicies {
            ordering: Arc::new(|a: &ItemProducer, b: &ItemProducer| a.range().cmp_position(b.range())),
            fetch_priority: Arc::new(|fetcher: &PartitionFetcher| fetcher.range().numeric_id()),
            equality: never_equal(),
        }
    }

    /// Ranges left of the leftmost token are done; the rest resume from
    /// the token covering them, or from scratch
    ///
    /// A skip count is honored only while its token covers one range. Once
    /// the range has split, the items it counted cannot be told apart among
    /// the children, which then re-read their whole first page.
    fn resume_targets(
        ranges: &[PartitionKeyRange],
        query: &QuerySpec,
        value: &Value,
    ) -> QueryResult<Vec<ProducerTarget>> {
        let tokens = CompositeContinuationToken::parse_list(value)?;
        let info = try_get_initialization_info(ranges, &tokens)?;
        let mapping: Vec<_> = info.target.into_iter().chain(info.right_of_target).collect();

        let covered = |range: &Range| {
            mapping
                .iter()
                .filter(|(_, token)| token.as_ref().is_some_and(|t| &t.range == range))
                .count()
        };

        Ok(mapping
            .iter()
            .map(|(range, token)| {
                let skip_count = match token {
                    Some(t) if t.skip_count > 0 && covered(&t.range) > 1 => {
                        log_event_with_fields(
                            QueryEvent::ResumeSkipDropped,
                            &[("range_id", &range.id), ("skip_count", &t.skip_count.to_string())],
                        );
                        0
                    }
                    Some(t) => t.skip_count as usize,
                    None => 0,
                };
                ProducerTarget {
                    range: range.clone(),
                    backend_continuation: token.as_ref().and_then(|t| t.token.clone()),
                    query: query.clone(),
                    resume_filter: None,
                    filter_text: None,
                    skip_count,
                }
            })
            .collect())
    }

    async fn drain(&mut self, max_elements: usize, cancel: &CancellationToken) -> QueryResult<Vec<Value>> {
        let mut items = Vec::new();
        if max_elements == 0 {
            return Ok(items);
        }

        while items.is_empty() {
            let Some(mut tree) = self.engine.pop_current()? else {
                break;
            };

            // First page of a range nobody has read yet
            if tree.current().current().is_none() && !self.engine.move_next_helper(&mut tree, cancel).await? {
                continue;
            }

            let count = tree.current().items_left_in_current_page().min(max_elements);
            if count == 0 {
                self.engine.push_back(tree)?;
                break;
            }
            for _ in 0..count {
                let Some(item) = tree.current().current().cloned() else {
                    break;
                };
                items.push(item);
                if !self.engine.move_next_helper(&mut tree, cancel).await? {
                    break;
                }
            }

            if tree.has_more_results() {
                self.engine.push_back(tree)?;
            }
        }
        Ok(items)
    }

    /// Charge of fetches completed since the last page
    pub fn take_metrics(&mut self) -> PageMetrics {
        self.engine.take_metrics()
    }

    pub fn buffered_item_count(&self) -> u64 {
        self.engine.buffered_item_count()
    }

    /// Ranges waiting for buffer budget before their next prefetch
    pub fn suppressed_prefetches(&self) -> usize {
        self.engine.suppressed_prefetches()
    }
}

impl DocumentSource for ParallelContext {
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
            .visit_active_producers(|p| {
                CompositeContinuationToken::new(resume_continuation(p), p.range().to_range())
                    .with_skip_count(resume_skip_count(p) as u64)
            })?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryQueryClient;
    use serde_json::json;

    fn settings(client: &Arc<InMemoryQueryClient>, page_size: u32) -> EngineSettings {
        EngineSettings {
            client: client.clone(),
            collection_rid: client.collection_rid(),
            initial_page_size: page_size,
            max_page_size: page_size,
            max_concurrency: 0,
            max_buffered_item_count: 1000,
            deterministic: true,
        }
    }

    fn populated(ranges: usize, rows: &[usize]) -> Arc<InMemoryQueryClient> {
        let client = Arc::new(InMemoryQueryClient::with_uniform_ranges("c", ranges));
        for (range, count) in client.ranges().iter().zip(rows) {
            let epk = if range.min_inclusive.is_empty() { "00".to_string() } else { range.min_inclusive.clone() };
            for i in 0..*count {
                client.insert(&epk, vec![], json!({"range": range.id, "i": i}));
            }
        }
        client
    }

    async fn create(client: &Arc<InMemoryQueryClient>, page_size: u32, token: Option<&Value>) -> ParallelContext {
        ParallelContext::create(
            settings(client, page_size),
            QuerySpec::new("SELECT * FROM c"),
            client.ranges(),
            token,
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    fn ranges_of(items: &[Value]) -> Vec<String> {
        items.iter().map(|i| i["range"].as_str().unwrap().to_string()).collect()
    }

    #[tokio::test]
    async fn test_drains_in_range_order() {
        let client = populated(3, &[2, 0, 3]);
        let mut context = create(&client, 10, None).await;
        let cancel = CancellationToken::new();

        let mut all = Vec::new();
        while !context.is_done() {
            all.extend(context.drain_page(10, &cancel).await.unwrap());
        }
        assert_eq!(ranges_of(&all), vec!["0", "0", "2", "2", "2"]);
        assert!(context.continuation_token().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_page_per_drain() {
        let client = populated(2, &[5, 5]);
        let mut context = create(&client, 3, None).await;
        let cancel = CancellationToken::new();

        let first = context.drain_page(100, &cancel).await.unwrap();
        assert_eq!(first.len(), 3);
        let second = context.drain_page(100, &cancel).await.unwrap();
        assert_eq!(ranges_of(&second), vec!["0", "0"]);
        let third = context.drain_page(100, &cancel).await.unwrap();
        assert_eq!(ranges_of(&third), vec!["1", "1", "1"]);
    }

    #[tokio::test]
    async fn test_continuation_covers_undrained_ranges() {
        let client = populated(3, &[4, 4, 4]);
        let mut context = create(&client, 2, None).await;
        context.drain_page(2, &CancellationToken::new()).await.unwrap();

        let token = context.continuation_token().unwrap().unwrap();
        let tokens = CompositeContinuationToken::parse_list(&token).unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].token.is_some());
        assert_eq!(tokens[0].range, client.ranges()[0].to_range());
    }

    #[tokio::test]
    async fn test_resume_drops_left_ranges() {
        let client = populated(3, &[4, 4, 4]);
        let mut context = create(&client, 4, None).await;
        context.drain_page(4, &CancellationToken::new()).await.unwrap();
        let token = context.continuation_token().unwrap().unwrap();

        let mut resumed = create(&client, 4, Some(&token)).await;
        let cancel = CancellationToken::new();
        let mut rest = Vec::new();
        while !resumed.is_done() {
            rest.extend(resumed.drain_page(4, &cancel).await.unwrap());
        }
        assert_eq!(rest.len(), 8);
        assert!(ranges_of(&rest).iter().all(|r| r != "0"));
    }

    #[tokio::test]
    async fn test_resume_inside_a_page() {
        let client = populated(2, &[5, 5]);
        let cancel = CancellationToken::new();
        let mut token: Option<Value> = None;
        let mut seen = Vec::new();
        loop {
            let mut context = create(&client, 5, token.as_ref()).await;
            for item in context.drain_page(2, &cancel).await.unwrap() {
                seen.push((item["range"].as_str().unwrap().to_string(), item["i"].as_u64().unwrap()));
            }
            token = context.continuation_token().unwrap();
            if token.is_none() {
                break;
            }
        }
        let expected: Vec<(String, u64)> = ["0", "1"]
            .iter()
            .flat_map(|r| (0..5).map(move |i| (r.to_string(), i)))
            .collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_token_counts_items_returned_from_page() {
        let client = populated(1, &[6]);
        let mut context = create(&client, 6, None).await;
        context.drain_page(4, &CancellationToken::new()).await.unwrap();

        let token = context.continuation_token().unwrap().unwrap();
        let tokens = CompositeContinuationToken::parse_list(&token).unwrap();
        assert!(tokens[0].token.is_none());
        assert_eq!(tokens[0].skip_count, 4);
    }

    #[tokio::test]
    async fn test_malformed_token() {
        let client = populated(2, &[1, 1]);
        let token = json!([{"token": "x", "range": {"min": "7F", "max": "FF"}}]);
        let result = ParallelContext::create(
            settings(&client, 2),
            QuerySpec::new("SELECT * FROM c"),
            client.ranges(),
            Some(&token),
            &CancellationToken::new(),
        )
        .await;
        assert!(result.err().unwrap().is_malformed_token());
    }
}
