//! The pipelined context: cross-partition source plus plan stages behind
//! one drain-a-page call

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::distinct::{DistinctStage, DistinctState};
use super::skip::SkipStage;
use super::take::{TakeKind, TakeStage};
use super::DocumentSource;
use crate::client::QuerySpec;
use crate::continuation::PipelineContinuationToken;
use crate::execution::context::{ContextFuture, QueryExecutionContext, QueryPage};
use crate::execution::cross_partition::EngineSettings;
use crate::execution::order_by::{OrderByColumn, OrderByContext};
use crate::execution::parallel::ParallelContext;
use crate::execution::{PartitionedQueryExecutionInfo, QueryError, QueryResult};
use crate::observability::{log_event_with_fields, QueryEvent};
use crate::routing::PartitionKeyRange;

/// Everything a pipeline needs besides the client
pub struct PipelineParams {
    pub settings: EngineSettings,
    pub query: QuerySpec,
    pub plan: PartitionedQueryExecutionInfo,
    pub ranges: Vec<PartitionKeyRange>,
    /// Items per returned page
    pub max_item_count: usize,
    pub continuation_limit_bytes: Option<usize>,
}

/// Stage continuations peeled off a resumed token, outermost first
#[derive(Default)]
struct ResumeState {
    top: Option<u64>,
    limit: Option<u64>,
    offset: Option<u64>,
    distinct: DistinctState,
    source: Option<Value>,
}

/// Source and stages composed from the query plan
pub struct PipelinedContext {
    pipeline: Box<dyn DocumentSource>,
    plan: PartitionedQueryExecutionInfo,
    max_item_count: usize,
    continuation_limit_bytes: Option<usize>,
    failed: bool,
}

impl PipelinedContext {
    /// Build the pipeline, resuming from the source token of a pipeline
    /// continuation if given
    pub async fn create(
        params: PipelineParams,
        continuation: Option<Value>,
        cancel: &CancellationToken,
    ) -> QueryResult<Self> {
        let info = &params.plan.query_info;
        if info.has_aggregates() || info.has_group_by() {
            return Err(QueryError::UnsupportedQueryPlan(
                "aggregates and GROUP BY are not supported".into(),
            ));
        }
        let resume = Self::peel(&params.plan, continuation)?;

        let query = match &info.rewritten_query {
            Some(text) => QuerySpec {
                query_text: text.clone(),
                parameters: params.query.parameters.clone(),
            },
            None => params.query.clone(),
        };

        let mut pipeline: Box<dyn DocumentSource> = if info.has_order_by() {
            if info.order_by_expressions.len() != info.order_by.len() {
                return Err(QueryError::UnsupportedQueryPlan(format!(
                    "{} order by expressions for {} sort orders",
                    info.order_by_expressions.len(),
                    info.order_by.len()
                )));
            }
            let columns = info
                .order_by_expressions
                .iter()
                .zip(&info.order_by)
                .map(|(expression, order)| OrderByColumn::new(expression.clone(), *order))
                .collect();
            Box::new(
                OrderByContext::create(
                    params.settings,
                    query,
                    params.ranges,
                    columns,
                    resume.source.as_ref(),
                    cancel,
                )
                .await?,
            )
        } else {
            Box::new(
                ParallelContext::create(params.settings, query, params.ranges, resume.source.as_ref(), cancel).await?,
            )
        };

        if info.has_distinct() {
            pipeline = Box::new(DistinctStage::new(pipeline, info.distinct_type, resume.distinct)?);
        }
        if let Some(offset) = resume.offset {
            pipeline = Box::new(SkipStage::new(pipeline, offset));
        }
        if let Some(limit) = resume.limit {
            pipeline = Box::new(TakeStage::new(pipeline, limit, TakeKind::Limit));
        }
        if let Some(top) = resume.top {
            pipeline = Box::new(TakeStage::new(pipeline, top, TakeKind::Top));
        }

        Ok(Self {
            pipeline,
            plan: params.plan,
            max_item_count: params.max_item_count.max(1),
            continuation_limit_bytes: params.continuation_limit_bytes,
            failed: false,
        })
    }

    /// Unwrap stage tokens in the reverse of the order stages are applied
    fn peel(plan: &PartitionedQueryExecutionInfo, continuation: Option<Value>) -> QueryResult<ResumeState> {
        let info = &plan.query_info;
        let mut state = ResumeState {
            top: info.top,
            limit: info.limit,
            offset: info.offset,
            ..ResumeState::default()
        };
        let Some(mut token) = continuation else {
            return Ok(state);
        };

        if info.top.is_some() {
            let (count, inner) = TakeStage::split_token(&token, TakeKind::Top)?;
            state.top = Some(count);
            token = inner;
        }
        if info.limit.is_some() {
            let (count, inner) = TakeStage::split_token(&token, TakeKind::Limit)?;
            state.limit = Some(count);
            token = inner;
        }
        if info.offset.is_some() {
            let (count, inner) = SkipStage::split_token(&token)?;
            state.offset = Some(count);
            token = inner;
        }
        if info.has_distinct() {
            let (distinct, inner) = DistinctStage::split_token(&token)?;
            state.distinct = distinct;
            token = inner;
        }
        state.source = Some(token);
        Ok(state)
    }

    async fn next_page(&mut self, cancel: &CancellationToken) -> QueryResult<QueryPage> {
        if self.is_done() {
            return Ok(QueryPage::empty());
        }

        let items = match self.pipeline.drain_page(self.max_item_count, cancel).await {
            Ok(items) => items,
            Err(err) => {
                self.failed = true;
                self.pipeline.stop();
                log_event_with_fields(
                    QueryEvent::QueryFailed,
                    &[("status", &err.status_code().to_string()), ("error", &err.to_string())],
                );
                return Err(err);
            }
        };

        let metrics = self.pipeline.take_metrics();
        let continuation_token = match self.pipeline.continuation_token()? {
            Some(source) => Some(PipelineContinuationToken::serialize(
                source,
                Some(&self.plan),
                self.continuation_limit_bytes,
            )?),
            None => None,
        };
        let activity_id = metrics
            .diagnostics
            .last()
            .map(|d| d.activity_id)
            .unwrap_or_else(Uuid::new_v4);

        log_event_with_fields(
            QueryEvent::PageComplete,
            &[
                ("item_count", &items.len().to_string()),
                ("request_charge", &format!("{:.2}", metrics.request_charge)),
                ("fetches", &metrics.diagnostics.len().to_string()),
                ("has_continuation", if continuation_token.is_some() { "true" } else { "false" }),
            ],
        );

        Ok(QueryPage {
            items,
            continuation_token,
            request_charge: metrics.request_charge,
            activity_id,
            response_length_bytes: metrics.response_length_bytes,
            diagnostics: metrics.diagnostics,
        })
    }
}

impl QueryExecutionContext for PipelinedContext {
    fn execute_next<'a>(&'a mut self, cancel: &'a CancellationToken) -> ContextFuture<'a, QueryPage> {
        Box::pin(self.next_page(cancel))
    }

    fn is_done(&self) -> bool {
        self.failed || self.pipeline.is_done()
    }

    fn stop(&mut self) {
        self.pipeline.stop();
    }
}
