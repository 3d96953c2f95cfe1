//! # Query Pipeline
//!
//! A cross-partition source followed by the stages the query plan asks for:
//!
//! ```text
//! source -> distinct -> skip (OFFSET) -> take (LIMIT) -> take (TOP)
//! ```
//!
//! Every stage is itself a `DocumentSource` wrapping the previous one, and
//! its continuation wraps its source's continuation. Resuming peels the
//! wrappers in reverse order.

mod distinct;
mod pipelined;
mod skip;
mod take;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::context::ContextFuture;
use super::cross_partition::PageMetrics;
use super::errors::QueryResult;

pub use distinct::{DistinctStage, DistinctState};
pub use pipelined::{PipelineParams, PipelinedContext};
pub use skip::SkipStage;
pub use take::{TakeKind, TakeStage};

/// Future returned by document sources
pub type SourceFuture<'a, T> = ContextFuture<'a, T>;

/// A stream of documents drained a batch at a time
pub trait DocumentSource: Send {
    /// Up to `max_elements` documents
    ///
    /// An empty batch does not mean the source is done; ask `is_done`.
    fn drain_page<'a>(&'a mut self, max_elements: usize, cancel: &'a CancellationToken) -> SourceFuture<'a, Vec<Value>>;

    fn is_done(&self) -> bool;

    /// Resume state after the last drained batch; `None` when done
    fn continuation_token(&self) -> QueryResult<Option<Value>>;

    /// Charge, response length and diagnostics since the last call
    fn take_metrics(&mut self) -> PageMetrics;

    /// Cancel background work
    fn stop(&mut self);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Source over a fixed list, at most `batch` documents per drain
    pub(crate) struct VecSource {
        items: Vec<Value>,
        position: usize,
        batch: usize,
        stopped: Arc<AtomicBool>,
    }

    impl VecSource {
        pub(crate) fn new(items: Vec<Value>, batch: usize) -> Self {
            Self {
                items,
                position: 0,
                batch,
                stopped: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Flag raised once the source is stopped
        pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
            Arc::clone(&self.stopped)
        }

        /// Source resuming at `position`
        pub(crate) fn at(items: Vec<Value>, batch: usize, position: usize) -> Self {
            Self {
                position,
                ..Self::new(items, batch)
            }
        }
    }

    impl DocumentSource for VecSource {
        fn drain_page<'a>(&'a mut self, max_elements: usize, _cancel: &'a CancellationToken) -> SourceFuture<'a, Vec<Value>> {
            Box::pin(async move {
                let end = (self.position + max_elements.min(self.batch)).min(self.items.len());
                let out = self.items[self.position..end].to_vec();
                self.position = end;
                Ok(out)
            })
        }

        fn is_done(&self) -> bool {
            self.position >= self.items.len()
        }

        fn continuation_token(&self) -> QueryResult<Option<Value>> {
            Ok((!self.is_done()).then(|| Value::from(self.position)))
        }

        fn take_metrics(&mut self) -> PageMetrics {
            PageMetrics {
                request_charge: 1.0,
                ..PageMetrics::default()
            }
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }
}
