//! Fetch half of a partition producer
//!
//! A `PartitionFetcher` is shared between the consumer and background
//! prefetch tasks. It owns the backend continuation and a queue of fetched
//! pages. At most one fetch per partition is in flight: fetches serialize on
//! an async lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::client::{BackendFailure, BackendPage, FetchDiagnostics, FetchRequest, QueryClient, QuerySpec};
use crate::execution::ResumeFilter;
use crate::execution::{QueryError, QueryResult};
use crate::observability::{log_event_with_fields, QueryEvent};
use crate::routing::PartitionKeyRange;
use crate::scheduler::{ComparableTask, TaskFuture};

/// What a completed fetch reports to its observer
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub items_buffered: usize,
    pub request_charge: f64,
    pub response_length_bytes: u64,
    pub diagnostics: FetchDiagnostics,
}

/// Receives fetch lifecycle callbacks, from whichever task ran the fetch
pub trait FetchObserver: Send + Sync {
    /// A page was buffered
    fn on_fetch_complete(&self, fetcher: &Arc<PartitionFetcher>, outcome: FetchOutcome);

    /// The consumer took `count` buffered items
    fn on_items_consumed(&self, count: usize);

    /// A fetcher was created for a split child
    fn on_fetcher_created(&self, fetcher: &Arc<PartitionFetcher>);
}

/// Observer that ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFetchObserver;

impl FetchObserver for NoopFetchObserver {
    fn on_fetch_complete(&self, _fetcher: &Arc<PartitionFetcher>, _outcome: FetchOutcome) {}
    fn on_items_consumed(&self, _count: usize) {}
    fn on_fetcher_created(&self, _fetcher: &Arc<PartitionFetcher>) {}
}

/// Where a fetcher reads from
#[derive(Clone)]
pub struct FetchSource {
    pub client: Arc<dyn QueryClient>,
    pub collection_rid: String,
    pub query: QuerySpec,
    /// Structured resume filter matching the one spliced into `query`
    pub resume_filter: Option<Arc<ResumeFilter>>,
}

#[derive(Debug, Default)]
struct FetchState {
    pages: VecDeque<Result<BackendPage, BackendFailure>>,
    backend_continuation: Option<String>,
    started: bool,
    failed: bool,
}

impl FetchState {
    fn has_more_backend_results(&self) -> bool {
        !self.failed && (!self.started || self.backend_continuation.is_some())
    }
}

/// Fetches pages of one partition range into a queue
pub struct PartitionFetcher {
    range: PartitionKeyRange,
    source: FetchSource,
    observer: Weak<dyn FetchObserver>,
    fetch_lock: AsyncMutex<()>,
    state: Mutex<FetchState>,
    buffered_items: AtomicU64,
    page_size: AtomicU32,
}

impl PartitionFetcher {
    /// Fetcher over `range`, resuming from `initial_continuation` if given
    pub fn new(
        range: PartitionKeyRange,
        source: FetchSource,
        initial_continuation: Option<String>,
        page_size: u32,
        observer: Weak<dyn FetchObserver>,
    ) -> Arc<Self> {
        let started = initial_continuation.is_some();
        Arc::new(Self {
            range,
            source,
            observer,
            fetch_lock: AsyncMutex::new(()),
            state: Mutex::new(FetchState {
                pages: VecDeque::new(),
                backend_continuation: initial_continuation,
                started,
                failed: false,
            }),
            buffered_items: AtomicU64::new(0),
            page_size: AtomicU32::new(page_size.max(1)),
        })
    }

    /// Fetcher for a split child, resuming where this one stopped
    pub fn spawn_child(&self, range: PartitionKeyRange) -> Arc<Self> {
        let child = Self::new(
            range,
            self.source.clone(),
            self.backend_continuation(),
            self.page_size(),
            self.observer.clone(),
        );
        if let Some(observer) = self.observer.upgrade() {
            observer.on_fetcher_created(&child);
        }
        child
    }

    pub fn range(&self) -> &PartitionKeyRange {
        &self.range
    }

    pub fn client(&self) -> &Arc<dyn QueryClient> {
        &self.source.client
    }

    pub fn collection_rid(&self) -> &str {
        &self.source.collection_rid
    }

    /// Continuation of the next backend page; `None` before the first fetch
    /// or after the last one
    pub fn backend_continuation(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.backend_continuation.clone())
    }

    /// True while another backend page may exist
    pub fn has_more_backend_results(&self) -> bool {
        self.state.lock().map(|s| s.has_more_backend_results()).unwrap_or(false)
    }

    /// Items fetched but not yet taken by the consumer
    pub fn buffered_item_count(&self) -> u64 {
        self.buffered_items.load(Ordering::Relaxed)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.load(Ordering::Relaxed)
    }

    pub fn set_page_size(&self, page_size: u32) {
        self.page_size.store(page_size.max(1), Ordering::Relaxed);
    }

    /// Fetch one more page into the queue
    ///
    /// With `only_if_empty`, nothing is fetched when a page is already
    /// queued once the fetch lock is held. A result that arrives after
    /// cancellation is discarded.
    pub async fn buffer_more(self: &Arc<Self>, cancel: &CancellationToken, only_if_empty: bool) -> QueryResult<()> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        let _fetching = self.fetch_lock.lock().await;

        let continuation = {
            let state = self.state.lock().map_err(|_| QueryError::lock_poisoned())?;
            if only_if_empty && !state.pages.is_empty() {
                return Ok(());
            }
            if !state.has_more_backend_results() {
                return Ok(());
            }
            state.backend_continuation.clone()
        };

        let request = FetchRequest {
            collection_rid: self.source.collection_rid.clone(),
            range: self.range.clone(),
            query: self.source.query.clone(),
            resume_filter: self.source.resume_filter.clone(),
            continuation,
            page_size: self.page_size(),
        };
        let started_at = Utc::now();
        let timer = Instant::now();
        let result = self.source.client.execute_query(request).await;

        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        match result {
            Ok(page) => {
                let item_count = page.items.len();
                let outcome = FetchOutcome {
                    items_buffered: item_count,
                    request_charge: page.request_charge,
                    response_length_bytes: page.response_length_bytes,
                    diagnostics: FetchDiagnostics {
                        range_id: self.range.id.clone(),
                        activity_id: page.activity_id,
                        started_at,
                        elapsed_ms: timer.elapsed().as_millis() as u64,
                        item_count,
                        request_charge: page.request_charge,
                    },
                };
                {
                    let mut state = self.state.lock().map_err(|_| QueryError::lock_poisoned())?;
                    state.started = true;
                    state.backend_continuation = page.continuation.clone();
                    state.pages.push_back(Ok(page));
                }
                self.buffered_items.fetch_add(item_count as u64, Ordering::Relaxed);
                if let Some(observer) = self.observer.upgrade() {
                    observer.on_fetch_complete(self, outcome);
                }
            }
            Err(failure) => {
                log_event_with_fields(
                    QueryEvent::PartitionFetchFailed,
                    &[
                        ("range_id", &self.range.id),
                        ("status", &failure.status_code.to_string()),
                        ("substatus", &failure.sub_status_code.to_string()),
                    ],
                );
                // The backend continuation is kept: split children resume from it
                let mut state = self.state.lock().map_err(|_| QueryError::lock_poisoned())?;
                state.started = true;
                state.failed = true;
                state.pages.push_back(Err(failure));
            }
        }
        Ok(())
    }

    /// Take the oldest queued page
    pub fn take_page(&self) -> QueryResult<Option<Result<BackendPage, BackendFailure>>> {
        let page = {
            let mut state = self.state.lock().map_err(|_| QueryError::lock_poisoned())?;
            state.pages.pop_front()
        };
        if let Some(Ok(page)) = &page {
            let count = page.items.len();
            let _ = self
                .buffered_items
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(count as u64)));
            if let Some(observer) = self.observer.upgrade() {
                observer.on_items_consumed(count);
            }
        }
        Ok(page)
    }
}

impl ComparableTask for PartitionFetcher {
    fn task_key(&self) -> String {
        self.range.id.clone()
    }

    fn execute(self: Arc<Self>, cancel: CancellationToken) -> TaskFuture {
        Box::pin(async move {
            // Failures are queued as pages and surface to the consumer
            let _ = self.buffer_more(&cancel, false).await;
        })
    }
}
