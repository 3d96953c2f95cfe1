//! # Cross-Partition Engine
//!
//! Owns the forest of producer trees, one per target range, ordered by the
//! strategy's comparator. The consumer pops the head tree, advances it and
//! pushes it back. Background fetches run through the prefetch scheduler and
//! report to a shared coordinator, the single point where concurrently
//! completing fetches meet:
//!
//! 1. their charge, response length and diagnostics are accumulated
//! 2. the global buffered item count grows
//! 3. the producer's page size grows
//! 4. another fetch is scheduled while the buffer budget allows it
//!
//! Fetchers held back by the budget are remembered and rescheduled, in fetch
//! priority order, as soon as the consumer frees enough of it.
//!
//! The strategies plug in three policies: the drain ordering, the fetch
//! priority and the item equality deciding when a producer stops being
//! active.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::CancellationToken;

use super::config::{PAGE_SIZE_GROWTH_FACTOR, PREFETCH_THRESHOLD_CAP};
use super::errors::{QueryError, QueryResult};
use super::order_by::ResumeFilter;
use crate::client::{FetchDiagnostics, QueryClient, QuerySpec};
use crate::observability::{log_event_with_fields, QueryEvent};
use crate::producer::{
    EqualityComparer, FetchObserver, FetchOutcome, FetchSource, ItemProducer, PartitionFetcher, ProducerComparator,
    ProducerTree,
};
use crate::routing::PartitionKeyRange;
use crate::scheduler::{ComparableTaskScheduler, PriorityQueue, RequestChargeTracker};

/// Priority of a pending fetch; lower runs first
pub type FetchPriority = Arc<dyn Fn(&PartitionFetcher) -> i64 + Send + Sync>;

/// Future returned by a producer filter hook
pub type FilterHookFuture<'a> = Pin<Box<dyn Future<Output = QueryResult<()>> + Send + 'a>>;

/// Positions a freshly initialized tree before it joins the forest
pub trait ProducerFilterHook: Send + Sync {
    /// Called once per target, in target order
    fn filter<'a>(
        &'a self,
        target_index: usize,
        tree: &'a mut ProducerTree,
        cancel: &'a CancellationToken,
    ) -> FilterHookFuture<'a>;
}

/// Strategy policies
#[derive(Clone)]
pub struct DrainPolicies {
    /// Order in which producers are drained
    pub ordering: ProducerComparator,
    /// Order in which pending fetches run
    pub fetch_priority: FetchPriority,
    /// Equality keeping a resumed producer active
    pub equality: EqualityComparer,
}

/// Engine settings derived from the query options
#[derive(Clone)]
pub struct EngineSettings {
    pub client: Arc<dyn QueryClient>,
    pub collection_rid: String,
    pub initial_page_size: u32,
    pub max_page_size: u32,
    pub max_concurrency: usize,
    pub max_buffered_item_count: u64,
    pub deterministic: bool,
}

/// One range to create a producer for
#[derive(Clone)]
pub struct ProducerTarget {
    pub range: PartitionKeyRange,
    pub backend_continuation: Option<String>,
    pub query: QuerySpec,
    pub resume_filter: Option<Arc<ResumeFilter>>,
    /// Filter text recorded in continuations
    pub filter_text: Option<String>,
    /// Items at the start of `backend_continuation` already returned
    pub skip_count: usize,
}

impl ProducerTarget {
    /// Target starting `range` from scratch with `query`
    pub fn fresh(range: PartitionKeyRange, query: QuerySpec) -> Self {
        Self {
            range,
            backend_continuation: None,
            query,
            resume_filter: None,
            filter_text: None,
            skip_count: 0,
        }
    }
}

/// Per-page accounting handed to the caller
#[derive(Debug, Clone, Default)]
pub struct PageMetrics {
    pub request_charge: f64,
    pub response_length_bytes: u64,
    pub diagnostics: Vec<FetchDiagnostics>,
}

impl PageMetrics {
    /// Fold another page's metrics into this one
    pub fn merge(&mut self, other: PageMetrics) {
        self.request_charge += other.request_charge;
        self.response_length_bytes += other.response_length_bytes;
        self.diagnostics.extend(other.diagnostics);
    }
}

/// State shared with background fetches
struct FetchCoordinator {
    scheduler: ComparableTaskScheduler<PartitionFetcher>,
    charge: RequestChargeTracker,
    buffered_items: AtomicU64,
    response_length_bytes: AtomicU64,
    diagnostics: Mutex<Vec<FetchDiagnostics>>,
    /// Fetchers whose next fetch was suppressed by the budget
    suppressed: Mutex<Vec<Weak<PartitionFetcher>>>,
    max_buffered_item_count: u64,
    max_page_size: u32,
    fetch_priority: FetchPriority,
}

impl FetchCoordinator {
    fn can_prefetch(&self) -> bool {
        self.scheduler.is_enabled()
    }

    /// Queue a fetch regardless of the buffer budget
    fn schedule(&self, fetcher: &Arc<PartitionFetcher>) {
        if !self.can_prefetch() {
            return;
        }
        let priority = (self.fetch_priority)(fetcher);
        if let Ok(true) = self.scheduler.try_schedule(Arc::clone(fetcher), priority) {
            log_event_with_fields(
                QueryEvent::PrefetchScheduled,
                &[("range_id", &fetcher.range().id), ("priority", &priority.to_string())],
            );
        }
    }

    /// Queue another fetch if the producer has pages left and budget remains
    fn schedule_if_budget_allows(&self, fetcher: &Arc<PartitionFetcher>) {
        if !self.can_prefetch() || !fetcher.has_more_backend_results() {
            return;
        }
        let buffered = self.buffered_items.load(Ordering::Relaxed);
        let free = self.max_buffered_item_count.saturating_sub(buffered);
        let threshold = (fetcher.page_size() as u64).min(PREFETCH_THRESHOLD_CAP);
        if free > threshold {
            self.schedule(fetcher);
        } else {
            log_event_with_fields(
                QueryEvent::PrefetchSuppressed,
                &[("range_id", &fetcher.range().id), ("free_budget", &free.to_string())],
            );
            if let Ok(mut waiting) = self.suppressed.lock() {
                let weak = Arc::downgrade(fetcher);
                if !waiting.iter().any(|w| w.ptr_eq(&weak)) {
                    waiting.push(weak);
                }
            }
        }
    }

    /// Retry every suppressed fetcher against the current budget
    fn resume_suppressed(&self) {
        let waiting = match self.suppressed.lock() {
            Ok(mut waiting) => mem::take(&mut *waiting),
            Err(_) => return,
        };
        let mut fetchers: Vec<Arc<PartitionFetcher>> = waiting.iter().filter_map(Weak::upgrade).collect();
        fetchers.sort_by_key(|fetcher| (self.fetch_priority)(fetcher));
        for fetcher in &fetchers {
            self.schedule_if_budget_allows(fetcher);
        }
    }

    fn suppressed_count(&self) -> usize {
        self.suppressed.lock().map(|waiting| waiting.len()).unwrap_or(0)
    }

    fn take_metrics(&self) -> PageMetrics {
        let diagnostics = self
            .diagnostics
            .lock()
            .map(|mut bag| mem::take(&mut *bag))
            .unwrap_or_default();
        PageMetrics {
            request_charge: self.charge.get_and_reset(),
            response_length_bytes: self.response_length_bytes.swap(0, Ordering::AcqRel),
            diagnostics,
        }
    }
}

impl FetchObserver for FetchCoordinator {
    fn on_fetch_complete(&self, fetcher: &Arc<PartitionFetcher>, outcome: FetchOutcome) {
        self.charge.add_charge(outcome.request_charge);
        self.buffered_items
            .fetch_add(outcome.items_buffered as u64, Ordering::Relaxed);
        self.response_length_bytes
            .fetch_add(outcome.response_length_bytes, Ordering::Relaxed);
        if let Ok(mut bag) = self.diagnostics.lock() {
            bag.push(outcome.diagnostics);
        }

        let current = fetcher.page_size();
        let grown = ((current as f64 * PAGE_SIZE_GROWTH_FACTOR).ceil() as u64).min(self.max_page_size as u64) as u32;
        if grown > current {
            fetcher.set_page_size(grown);
        }

        self.schedule_if_budget_allows(fetcher);
    }

    fn on_items_consumed(&self, count: usize) {
        let _ = self
            .buffered_items
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(count as u64)));
        self.resume_suppressed();
    }

    fn on_fetcher_created(&self, fetcher: &Arc<PartitionFetcher>) {
        self.schedule(fetcher);
    }
}

/// The cross-partition engine shared by the parallel and order-by strategies
pub struct CrossPartitionContext {
    coordinator: Arc<FetchCoordinator>,
    forest: Mutex<PriorityQueue<ProducerTree>>,
    policies: DrainPolicies,
    settings: EngineSettings,
    failed: bool,
}

impl CrossPartitionContext {
    pub fn new(settings: EngineSettings, policies: DrainPolicies) -> Self {
        let ordering = Arc::clone(&policies.ordering);
        let forest = PriorityQueue::new(Arc::new(move |a: &ProducerTree, b: &ProducerTree| {
            ordering(a.current(), b.current())
        }));
        let coordinator = Arc::new(FetchCoordinator {
            scheduler: ComparableTaskScheduler::new(settings.max_concurrency),
            charge: RequestChargeTracker::new(),
            buffered_items: AtomicU64::new(0),
            response_length_bytes: AtomicU64::new(0),
            diagnostics: Mutex::new(Vec::new()),
            suppressed: Mutex::new(Vec::new()),
            max_buffered_item_count: settings.max_buffered_item_count.max(settings.initial_page_size as u64),
            max_page_size: settings.max_page_size.max(settings.initial_page_size),
            fetch_priority: Arc::clone(&policies.fetch_priority),
        });
        Self {
            coordinator,
            forest: Mutex::new(forest),
            policies,
            settings,
            failed: false,
        }
    }

    /// Create a producer tree per target and add them to the forest
    ///
    /// Every producer gets a background fetch when prefetch is enabled.
    /// Unless `defer_first_page`, each tree is then moved onto its first
    /// item, handed to `hook`, and kept only if it has results.
    pub async fn initialize(
        &mut self,
        targets: Vec<ProducerTarget>,
        defer_first_page: bool,
        hook: Option<&dyn ProducerFilterHook>,
        cancel: &CancellationToken,
    ) -> QueryResult<()> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        let observer: Weak<dyn FetchObserver> = {
            let strong: Arc<dyn FetchObserver> = self.coordinator.clone();
            Arc::downgrade(&strong)
        };
        let target_count = targets.len();
        let resumed = targets.iter().filter(|t| t.backend_continuation.is_some()).count();

        let mut trees = Vec::with_capacity(targets.len());
        for target in targets {
            let source = FetchSource {
                client: Arc::clone(&self.settings.client),
                collection_rid: self.settings.collection_rid.clone(),
                query: target.query,
                resume_filter: target.resume_filter,
            };
            let fetcher = PartitionFetcher::new(
                target.range,
                source,
                target.backend_continuation,
                self.settings.initial_page_size,
                observer.clone(),
            );
            self.coordinator.schedule(&fetcher);

            let mut producer = ItemProducer::new(fetcher, Arc::clone(&self.policies.equality));
            producer.set_filter(target.filter_text);
            producer.set_pending_skip(target.skip_count);
            trees.push(ProducerTree::new(producer, Arc::clone(&self.policies.ordering)));
        }

        // Every prefetch is queued before the first page is awaited
        for (index, mut tree) in trees.into_iter().enumerate() {
            if !defer_first_page {
                loop {
                    if !tree.try_move_next_page(cancel).await? {
                        break;
                    }
                    if tree.current().is_at_beginning_of_page() {
                        break;
                    }
                    if tree.try_move_next_document_within_page() {
                        break;
                    }
                }
            }
            if let Some(hook) = hook {
                hook.filter(index, &mut tree, cancel).await?;
            }
            if defer_first_page || tree.has_more_results() {
                self.push_back(tree)?;
            }
        }

        log_event_with_fields(
            QueryEvent::ContextInitialized,
            &[
                ("range_count", &target_count.to_string()),
                ("resumed_ranges", &resumed.to_string()),
                ("prefetch", if self.coordinator.can_prefetch() { "true" } else { "false" }),
            ],
        );
        Ok(())
    }

    /// Remove the head tree
    pub fn pop_current(&self) -> QueryResult<Option<ProducerTree>> {
        let mut forest = self.forest.lock().map_err(|_| QueryError::lock_poisoned())?;
        Ok(forest.pop())
    }

    /// Return a tree to the forest; its position reflects its new state
    pub fn push_back(&self, tree: ProducerTree) -> QueryResult<()> {
        let mut forest = self.forest.lock().map_err(|_| QueryError::lock_poisoned())?;
        forest.push(tree);
        Ok(())
    }

    /// Advance a popped tree; a failure stops the context
    pub async fn move_next_helper(&mut self, tree: &mut ProducerTree, cancel: &CancellationToken) -> QueryResult<bool> {
        match tree.move_next(cancel).await {
            Ok(moved) => Ok(moved),
            Err(err) => {
                self.fail();
                Err(err)
            }
        }
    }

    /// True while some tree still has results
    pub fn has_more_results(&self) -> bool {
        self.forest
            .lock()
            .map(|forest| forest.peek().is_some_and(|tree| tree.has_more_results()))
            .unwrap_or(false)
    }

    /// True once the results are exhausted or a page failed
    pub fn is_done(&self) -> bool {
        self.failed || !self.has_more_results()
    }

    /// Mark the context failed and stop background work
    pub fn fail(&mut self) {
        self.failed = true;
        self.stop();
    }

    /// Visit the producers whose continuation must be returned
    ///
    /// In deterministic mode these are the head producer unless it is still
    /// active, plus every active producer. Otherwise every leaf with more
    /// results.
    pub fn visit_active_producers<R>(&self, mut visit: impl FnMut(&ItemProducer) -> R) -> QueryResult<Vec<R>> {
        let forest = self.forest.lock().map_err(|_| QueryError::lock_poisoned())?;
        let mut out = Vec::new();
        if self.settings.deterministic {
            if let Some(head) = forest.peek() {
                let current = head.current();
                if current.has_more_results() && !current.is_active() {
                    out.push(visit(current));
                }
            }
            for tree in forest.iter() {
                for producer in tree.active_producers() {
                    out.push(visit(producer));
                }
            }
        } else {
            for tree in forest.iter() {
                for leaf in tree.leaves() {
                    if leaf.has_more_results() {
                        out.push(visit(leaf));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Charge, response length and diagnostics since the last call
    pub fn take_metrics(&self) -> PageMetrics {
        self.coordinator.take_metrics()
    }

    /// Items fetched and not yet consumed, across all producers
    pub fn buffered_item_count(&self) -> u64 {
        self.coordinator.buffered_items.load(Ordering::Relaxed)
    }

    /// Background fetches queued or running
    pub fn outstanding_prefetches(&self) -> usize {
        self.coordinator.scheduler.pending_count() + self.coordinator.scheduler.running_count()
    }

    /// Producers waiting for buffer budget before their next prefetch
    pub fn suppressed_prefetches(&self) -> usize {
        self.coordinator.suppressed_count()
    }

    pub fn initial_page_size(&self) -> u32 {
        self.settings.initial_page_size
    }

    /// Stop every background fetch
    pub fn stop(&self) {
        self.coordinator.scheduler.stop();
    }
}

impl Drop for CrossPartitionContext {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Backend continuation from which `producer` re-reads its current item
///
/// A producer on an item resumes from the start of that item's page. A
/// producer between pages, or not yet started, resumes from the next page.
pub fn resume_continuation(producer: &ItemProducer) -> Option<String> {
    if producer.current().is_some() {
        producer.previous_continuation().map(str::to_string)
    } else {
        producer.current_continuation().map(str::to_string)
    }
}

/// Items to drop after re-reading from [`resume_continuation`]
///
/// Those of the current page already moved past, or the skip the producer
/// has not applied yet.
pub fn resume_skip_count(producer: &ItemProducer) -> usize {
    if producer.current().is_some() {
        producer.consumed_in_current_page()
    } else {
        producer.pending_skip()
    }
}
