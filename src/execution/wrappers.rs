//! Context decorators
//!
//! - `LazyQueryContext` builds its inner context on the first page
//! - `NameCacheStaleRetryQueryContext` rebuilds once on a stale cache
//! - `CatchAllQueryContext` turns a panic into an error

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use super::context::{ContextFuture, QueryExecutionContext, QueryPage};
use super::errors::{QueryError, QueryResult};
use crate::observability::{log_event_with_fields, QueryEvent};

/// How a context is (re)built
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Bypass cached collection metadata
    pub force_refresh: bool,
    pub cancel: CancellationToken,
}

/// Future building a context
pub type BuildFuture = Pin<Box<dyn Future<Output = QueryResult<Box<dyn QueryExecutionContext>>> + Send>>;

/// Builds a context on demand
pub type ContextBuilder = Arc<dyn Fn(BuildRequest) -> BuildFuture + Send + Sync>;

enum LazyState {
    Pending,
    Ready(Box<dyn QueryExecutionContext>),
    Failed(QueryError),
}

/// Defers building its context until the first page is asked for
pub struct LazyQueryContext {
    builder: ContextBuilder,
    force_refresh: bool,
    state: LazyState,
}

impl LazyQueryContext {
    pub fn new(builder: ContextBuilder, force_refresh: bool) -> Self {
        Self {
            builder,
            force_refresh,
            state: LazyState::Pending,
        }
    }

    async fn next_page(&mut self, cancel: &CancellationToken) -> QueryResult<QueryPage> {
        if let LazyState::Pending = self.state {
            let request = BuildRequest {
                force_refresh: self.force_refresh,
                cancel: cancel.clone(),
            };
            self.state = match (self.builder)(request).await {
                Ok(inner) => LazyState::Ready(inner),
                Err(err) => LazyState::Failed(err),
            };
        }
        match &mut self.state {
            LazyState::Ready(inner) => inner.execute_next(cancel).await,
            LazyState::Failed(err) => Err(err.clone()),
            LazyState::Pending => Err(QueryError::Internal("lazy context was not built".into())),
        }
    }
}

impl QueryExecutionContext for LazyQueryContext {
    fn execute_next<'a>(&'a mut self, cancel: &'a CancellationToken) -> ContextFuture<'a, QueryPage> {
        Box::pin(self.next_page(cancel))
    }

    fn is_done(&self) -> bool {
        match &self.state {
            LazyState::Pending => false,
            LazyState::Ready(inner) => inner.is_done(),
            LazyState::Failed(_) => true,
        }
    }

    fn stop(&mut self) {
        if let LazyState::Ready(inner) = &mut self.state {
            inner.stop();
        }
    }
}

/// Rebuilds its context once when the collection cache was stale
///
/// Only before the first page: results of two collection generations
/// cannot be merged.
pub struct NameCacheStaleRetryQueryContext {
    inner: Box<dyn QueryExecutionContext>,
    builder: ContextBuilder,
    enabled: bool,
    retried: bool,
    returned_page: bool,
}

impl NameCacheStaleRetryQueryContext {
    pub fn new(inner: Box<dyn QueryExecutionContext>, builder: ContextBuilder, enabled: bool) -> Self {
        Self {
            inner,
            builder,
            enabled,
            retried: false,
            returned_page: false,
        }
    }

    async fn next_page(&mut self, cancel: &CancellationToken) -> QueryResult<QueryPage> {
        let result = match self.inner.execute_next(cancel).await {
            Err(err) if self.enabled && !self.retried && !self.returned_page && err.is_name_cache_stale() => {
                log_event_with_fields(QueryEvent::StaleCacheRetry, &[("error", &err.to_string())]);
                self.retried = true;
                self.inner.stop();
                self.inner = Box::new(LazyQueryContext::new(Arc::clone(&self.builder), true));
                self.inner.execute_next(cancel).await
            }
            other => other,
        };
        if result.is_ok() {
            self.returned_page = true;
        }
        result
    }
}

impl QueryExecutionContext for NameCacheStaleRetryQueryContext {
    fn execute_next<'a>(&'a mut self, cancel: &'a CancellationToken) -> ContextFuture<'a, QueryPage> {
        Box::pin(self.next_page(cancel))
    }

    fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    fn stop(&mut self) {
        self.inner.stop();
    }
}

/// Converts a panic of its context into `QueryError::Internal`
pub struct CatchAllQueryContext {
    inner: Box<dyn QueryExecutionContext>,
    panicked: bool,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl CatchAllQueryContext {
    pub fn new(inner: Box<dyn QueryExecutionContext>) -> Self {
        Self { inner, panicked: false }
    }

    async fn next_page(&mut self, cancel: &CancellationToken) -> QueryResult<QueryPage> {
        if self.panicked {
            return Err(QueryError::Internal("query context panicked earlier".into()));
        }
        match AssertUnwindSafe(self.inner.execute_next(cancel)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                self.panicked = true;
                let message = panic_message(payload.as_ref());
                log_event_with_fields(QueryEvent::QueryFailed, &[("panic", &message)]);
                Err(QueryError::Internal(format!("query execution panicked: {}", message)))
            }
        }
    }
}

impl QueryExecutionContext for CatchAllQueryContext {
    fn execute_next<'a>(&'a mut self, cancel: &'a CancellationToken) -> ContextFuture<'a, QueryPage> {
        Box::pin(self.next_page(cancel))
    }

    fn is_done(&self) -> bool {
        self.panicked || self.inner.is_done()
    }

    fn stop(&mut self) {
        self.inner.stop();
    }
}
