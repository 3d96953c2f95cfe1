//! OFFSET stage

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{DocumentSource, SourceFuture};
use crate::execution::cross_partition::PageMetrics;
use crate::execution::{QueryError, QueryResult};

#[derive(Debug, Serialize, Deserialize)]
struct SkipToken {
    #[serde(rename = "offsetCount")]
    offset_count: u64,
    #[serde(rename = "sourceToken")]
    source_token: Value,
}

/// Drops the first `offset` documents of its source
pub struct SkipStage {
    source: Box<dyn DocumentSource>,
    remaining: u64,
}

impl SkipStage {
    pub fn new(source: Box<dyn DocumentSource>, remaining: u64) -> Self {
        Self { source, remaining }
    }

    /// Split a skip continuation into the offset left and the source token
    pub fn split_token(value: &Value) -> QueryResult<(u64, Value)> {
        let token: SkipToken = serde_json::from_value(value.clone())
            .map_err(|e| QueryError::MalformedContinuationToken(format!("offset continuation: {}", e)))?;
        Ok((token.offset_count, token.source_token))
    }

    async fn drain(&mut self, max_elements: usize, cancel: &CancellationToken) -> QueryResult<Vec<Value>> {
        loop {
            let mut items = self.source.drain_page(max_elements, cancel).await?;
            if self.remaining == 0 {
                return Ok(items);
            }
            let skipped = (self.remaining as usize).min(items.len());
            items.drain(..skipped);
            self.remaining -= skipped as u64;
            if !items.is_empty() || self.source.is_done() {
                return Ok(items);
            }
        }
    }
}

impl DocumentSource for SkipStage {
    fn drain_page<'a>(&'a mut self, max_elements: usize, cancel: &'a CancellationToken) -> SourceFuture<'a, Vec<Value>> {
        Box::pin(self.drain(max_elements, cancel))
    }

    fn is_done(&self) -> bool {
        self.source.is_done()
    }

    fn continuation_token(&self) -> QueryResult<Option<Value>> {
        let Some(source_token) = self.source.continuation_token()? else {
            return Ok(None);
        };
        let token = SkipToken {
            offset_count: self.remaining,
            source_token,
        };
        serde_json::to_value(token)
            .map(Some)
            .map_err(|e| QueryError::Internal(e.to_string()))
    }

    fn take_metrics(&mut self) -> PageMetrics {
        self.source.take_metrics()
    }

    fn stop(&mut self) {
        self.source.stop();
    }
}
