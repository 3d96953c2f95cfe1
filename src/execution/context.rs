//! The drain-one-page contract every query context honors

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::errors::QueryResult;
use crate::client::FetchDiagnostics;

/// Future returned by query contexts
pub type ContextFuture<'a, T> = Pin<Box<dyn Future<Output = QueryResult<T>> + Send + 'a>>;

/// One page of query results
#[derive(Debug, Clone)]
pub struct QueryPage {
    pub items: Vec<Value>,
    /// Opaque token resuming after this page; `None` once the query is done
    pub continuation_token: Option<String>,
    /// Charge of every fetch completed while producing this page
    pub request_charge: f64,
    pub activity_id: Uuid,
    pub response_length_bytes: u64,
    pub diagnostics: Vec<FetchDiagnostics>,
}

impl QueryPage {
    /// Page with no items, no continuation and no charge
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            continuation_token: None,
            request_charge: 0.0,
            activity_id: Uuid::new_v4(),
            response_length_bytes: 0,
            diagnostics: Vec::new(),
        }
    }
}

/// A query returning its results one page at a time
pub trait QueryExecutionContext: Send {
    /// Produce the next page
    ///
    /// After an error the context is done and must not be drained again.
    fn execute_next<'a>(&'a mut self, cancel: &'a CancellationToken) -> ContextFuture<'a, QueryPage>;

    /// True once no further page will be produced
    fn is_done(&self) -> bool;

    /// Cancel background work
    fn stop(&mut self);
}
