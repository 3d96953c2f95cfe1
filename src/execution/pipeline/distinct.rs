//! DISTINCT stage
//!
//! Documents are identified by the SHA-256 of their JSON text. Object keys
//! serialize in sorted order, so equal documents hash equally. An ordered
//! distinct only remembers the previous hash; an unordered one remembers
//! every hash seen and carries them in its continuation.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::{DocumentSource, SourceFuture};
use crate::execution::cross_partition::PageMetrics;
use crate::execution::{DistinctType, QueryError, QueryResult};

/// Hashes remembered between pages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistinctState {
    #[serde(rename = "lastHash", default, skip_serializing_if = "Option::is_none")]
    pub last_hash: Option<String>,
    #[serde(rename = "seenHashes", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub seen_hashes: BTreeSet<String>,
}

#[derive(Serialize, Deserialize)]
struct DistinctToken {
    #[serde(flatten)]
    state: DistinctState,
    #[serde(rename = "sourceToken")]
    source_token: Value,
}

/// Removes duplicate documents
pub struct DistinctStage {
    source: Box<dyn DocumentSource>,
    ordered: bool,
    state: DistinctState,
}

fn document_hash(document: &Value) -> QueryResult<String> {
    let text = serde_json::to_string(document).map_err(|e| QueryError::Internal(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let result = hasher.finalize();
    Ok(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result))
}

impl DistinctStage {
    /// Stage for `distinct`, which must not be `DistinctType::None`
    pub fn new(source: Box<dyn DocumentSource>, distinct: DistinctType, state: DistinctState) -> QueryResult<Self> {
        let ordered = match distinct {
            DistinctType::Ordered => true,
            DistinctType::Unordered => false,
            DistinctType::None => {
                return Err(QueryError::InvalidArgument("distinct stage without DISTINCT".into()));
            }
        };
        Ok(Self { source, ordered, state })
    }

    /// Split a distinct continuation into the remembered hashes and the source token
    pub fn split_token(value: &Value) -> QueryResult<(DistinctState, Value)> {
        let token: DistinctToken = serde_json::from_value(value.clone())
            .map_err(|e| QueryError::MalformedContinuationToken(format!("distinct continuation: {}", e)))?;
        Ok((token.state, token.source_token))
    }

    fn admit(&mut self, document: &Value) -> QueryResult<bool> {
        let hash = document_hash(document)?;
        if self.ordered {
            if self.state.last_hash.as_deref() == Some(hash.as_str()) {
                return Ok(false);
            }
            self.state.last_hash = Some(hash);
            Ok(true)
        } else {
            Ok(self.state.seen_hashes.insert(hash))
        }
    }

    async fn drain(&mut self, max_elements: usize, cancel: &CancellationToken) -> QueryResult<Vec<Value>> {
        loop {
            let batch = self.source.drain_page(max_elements, cancel).await?;
            let mut items = Vec::with_capacity(batch.len());
            for document in batch {
                if self.admit(&document)? {
                    items.push(document);
                }
            }
            if !items.is_empty() || self.source.is_done() {
                return Ok(items);
            }
        }
    }
}

impl DocumentSource for DistinctStage {
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
        let token = DistinctToken {
            state: self.state.clone(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::pipeline::testing::VecSource;
    use serde_json::json;

    #[tokio::test]
    async fn test_ordered_drops_adjacent_duplicates() {
        let items = vec![json!(1), json!(1), json!(2), json!(2), json!(1)];
        let mut stage = DistinctStage::new(
            Box::new(VecSource::new(items, 10)),
            DistinctType::Ordered,
            DistinctState::default(),
        )
        .unwrap();
        let out = stage.drain_page(10, &CancellationToken::new()).await.unwrap();
        assert_eq!(out, vec![json!(1), json!(2), json!(1)]);
    }

    #[tokio::test]
    async fn test_unordered_survives_resume() {
        let items = vec![json!({"a": 1, "b": 2}), json!(3), json!({"b": 2, "a": 1}), json!(3), json!(4)];
        let mut stage = DistinctStage::new(
            Box::new(VecSource::new(items.clone(), 2)),
            DistinctType::Unordered,
            DistinctState::default(),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(stage.drain_page(2, &cancel).await.unwrap().len(), 2);

        let token = stage.continuation_token().unwrap().unwrap();
        let (state, inner) = DistinctStage::split_token(&token).unwrap();
        assert_eq!(state.seen_hashes.len(), 2);

        let source = VecSource::at(items, 2, inner.as_u64().unwrap() as usize);
        let mut resumed = DistinctStage::new(Box::new(source), DistinctType::Unordered, state).unwrap();
        let rest = resumed.drain_page(2, &cancel).await.unwrap();
        assert_eq!(rest, vec![json!(4)]);
    }

    #[test]
    fn test_none_is_rejected() {
        let source = VecSource::new(Vec::new(), 1);
        assert!(DistinctStage::new(Box::new(source), DistinctType::None, DistinctState::default()).is_err());
    }

    #[test]
    fn test_bad_token() {
        assert!(DistinctStage::split_token(&json!({"lastHash": 5, "sourceToken": 1}))
            .unwrap_err()
            .is_malformed_token());
    }
}
