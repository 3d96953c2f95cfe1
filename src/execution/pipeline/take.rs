//! LIMIT and TOP stages

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{DocumentSource, SourceFuture};
use crate::execution::cross_partition::PageMetrics;
use crate::execution::{QueryError, QueryResult};

/// Which clause a take stage implements; only the token field differs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeKind {
    Limit,
    Top,
}

impl TakeKind {
    fn count_field(self) -> &'static str {
        match self {
            TakeKind::Limit => "limitCount",
            TakeKind::Top => "topCount",
        }
    }
}

/// Passes through at most `count` documents, then reports done
pub struct TakeStage {
    source: Box<dyn DocumentSource>,
    remaining: u64,
    kind: TakeKind,
}

impl TakeStage {
    pub fn new(source: Box<dyn DocumentSource>, remaining: u64, kind: TakeKind) -> Self {
        Self {
            source,
            remaining,
            kind,
        }
    }

    /// Split a take continuation into the count left and the source token
    pub fn split_token(value: &Value, kind: TakeKind) -> QueryResult<(u64, Value)> {
        let malformed = |what: &str| {
            QueryError::MalformedContinuationToken(format!("{} continuation: {}", kind.count_field(), what))
        };
        let object = value.as_object().ok_or_else(|| malformed("not an object"))?;
        let count = object
            .get(kind.count_field())
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("missing count"))?;
        let source = object
            .get("sourceToken")
            .cloned()
            .ok_or_else(|| malformed("missing sourceToken"))?;
        Ok((count, source))
    }

    async fn drain(&mut self, max_elements: usize, cancel: &CancellationToken) -> QueryResult<Vec<Value>> {
        if self.remaining == 0 {
            return Ok(Vec::new());
        }
        let request = (max_elements as u64).min(self.remaining) as usize;
        let mut items = self.source.drain_page(request, cancel).await?;
        items.truncate(self.remaining as usize);
        self.remaining -= items.len() as u64;
        if self.remaining == 0 {
            self.source.stop();
        }
        Ok(items)
    }
}

impl DocumentSource for TakeStage {
    fn drain_page<'a>(&'a mut self, max_elements: usize, cancel: &'a CancellationToken) -> SourceFuture<'a, Vec<Value>> {
        Box::pin(self.drain(max_elements, cancel))
    }

    fn is_done(&self) -> bool {
        self.remaining == 0 || self.source.is_done()
    }

    fn continuation_token(&self) -> QueryResult<Option<Value>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let Some(source_token) = self.source.continuation_token()? else {
            return Ok(None);
        };
        let mut token = Map::new();
        token.insert(self.kind.count_field().to_string(), Value::from(self.remaining));
        token.insert("sourceToken".to_string(), source_token);
        Ok(Some(Value::Object(token)))
    }

    fn take_metrics(&mut self) -> PageMetrics {
        self.source.take_metrics()
    }

    fn stop(&mut self) {
        self.source.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::pipeline::testing::VecSource;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_stops_at_count() {
        let source = VecSource::new((0..10).map(|i| json!(i)).collect(), 4);
        let stopped = source.stop_flag();
        let mut stage = TakeStage::new(Box::new(source), 6, TakeKind::Limit);
        let cancel = CancellationToken::new();

        assert_eq!(stage.drain_page(4, &cancel).await.unwrap().len(), 4);
        let token = stage.continuation_token().unwrap().unwrap();
        assert_eq!(token, json!({"limitCount": 2, "sourceToken": 4}));

        assert_eq!(stage.drain_page(4, &cancel).await.unwrap(), vec![json!(4), json!(5)]);
        assert!(stage.is_done());
        assert!(stage.continuation_token().unwrap().is_none());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_resumed_count() {
        let items: Vec<Value> = (0..10).map(|i| json!(i)).collect();
        let (count, inner) = TakeStage::split_token(&json!({"topCount": 3, "sourceToken": 5}), TakeKind::Top).unwrap();
        let source = VecSource::at(items, 10, inner.as_u64().unwrap() as usize);
        let mut stage = TakeStage::new(Box::new(source), count, TakeKind::Top);

        let out = stage.drain_page(10, &CancellationToken::new()).await.unwrap();
        assert_eq!(out, vec![json!(5), json!(6), json!(7)]);
    }

    #[test]
    fn test_wrong_field_is_malformed() {
        let err = TakeStage::split_token(&json!({"topCount": 3, "sourceToken": 1}), TakeKind::Limit).unwrap_err();
        assert!(err.is_malformed_token());
    }
}
