//! Bounded-concurrency scheduler for prioritized background tasks
//!
//! Pending tasks wait in a priority queue (lowest priority value first, FIFO
//! among equals) and are spawned onto the ambient Tokio runtime while fewer
//! than `max_concurrency` are running. A task is identified by its key: a key
//! already pending is not queued twice. A running task may be queued again.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::priority_queue::PriorityQueue;
use crate::execution::{QueryError, QueryResult};

/// Future returned by a task
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Work the scheduler can run
pub trait ComparableTask: Send + Sync + 'static {
    /// Identity of the task; equal keys are the same task
    fn task_key(&self) -> String;

    /// Run the task. The token is cancelled when the scheduler stops.
    fn execute(self: Arc<Self>, cancel: CancellationToken) -> TaskFuture;
}

struct PendingTask<T> {
    priority: i64,
    seq: u64,
    task: Arc<T>,
}

struct SchedulerState<T> {
    pending: PriorityQueue<PendingTask<T>>,
    pending_keys: HashSet<String>,
    running: usize,
    next_seq: u64,
    stopped: bool,
}

struct SchedulerInner<T> {
    state: Mutex<SchedulerState<T>>,
    max_concurrency: usize,
    cancel: CancellationToken,
}

/// Releases a running slot when a spawned task ends, even by panic
struct RunningSlot<T: ComparableTask> {
    inner: Arc<SchedulerInner<T>>,
}

impl<T: ComparableTask> Drop for RunningSlot<T> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.running = state.running.saturating_sub(1);
        }
        SchedulerInner::pump(&self.inner);
    }
}

impl<T: ComparableTask> SchedulerInner<T> {
    /// Start pending tasks while slots are free
    fn pump(inner: &Arc<Self>) {
        loop {
            let task = {
                let Ok(mut state) = inner.state.lock() else {
                    return;
                };
                if state.stopped || state.running >= inner.max_concurrency {
                    return;
                }
                let Some(next) = state.pending.pop() else {
                    return;
                };
                state.pending_keys.remove(&next.task.task_key());
                state.running += 1;
                next.task
            };

            let Ok(handle) = Handle::try_current() else {
                // No runtime to run on; the consumer fetches on demand instead
                if let Ok(mut state) = inner.state.lock() {
                    state.running = state.running.saturating_sub(1);
                }
                return;
            };
            let slot = RunningSlot {
                inner: Arc::clone(inner),
            };
            let cancel = inner.cancel.child_token();
            handle.spawn(async move {
                let _slot = slot;
                if !cancel.is_cancelled() {
                    task.execute(cancel).await;
                }
            });
        }
    }
}

/// Runs at most `max_concurrency` tasks at once, highest priority first
pub struct ComparableTaskScheduler<T: ComparableTask> {
    inner: Arc<SchedulerInner<T>>,
}

impl<T: ComparableTask> ComparableTaskScheduler<T> {
    /// A scheduler running at most `max_concurrency` tasks. Zero disables it.
    pub fn new(max_concurrency: usize) -> Self {
        let comparator = Arc::new(|a: &PendingTask<T>, b: &PendingTask<T>| {
            a.priority.cmp(&b.priority).then(a.seq.cmp(&b.seq))
        });
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState {
                    pending: PriorityQueue::new(comparator),
                    pending_keys: HashSet::new(),
                    running: 0,
                    next_seq: 0,
                    stopped: false,
                }),
                max_concurrency,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// True when the scheduler accepts work
    pub fn is_enabled(&self) -> bool {
        self.inner.max_concurrency > 0 && !self.is_stopped()
    }

    /// Queue `task` with `priority` (lower runs first)
    ///
    /// Returns `Ok(false)` when the scheduler is disabled or stopped, or when
    /// a task with the same key is already pending.
    pub fn try_schedule(&self, task: Arc<T>, priority: i64) -> QueryResult<bool> {
        if self.inner.max_concurrency == 0 {
            return Ok(false);
        }
        {
            let mut state = self.inner.state.lock().map_err(|_| QueryError::lock_poisoned())?;
            if state.stopped || !state.pending_keys.insert(task.task_key()) {
                return Ok(false);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(PendingTask { priority, seq, task });
        }
        SchedulerInner::pump(&self.inner);
        Ok(true)
    }

    /// Tasks waiting for a slot
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    /// Tasks currently running
    pub fn running_count(&self) -> usize {
        self.inner.state.lock().map(|s| s.running).unwrap_or(0)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Drop pending tasks and cancel running ones. Idempotent.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        if let Ok(mut state) = self.inner.state.lock() {
            state.stopped = true;
            state.pending.clear();
            state.pending_keys.clear();
        }
    }
}

impl<T: ComparableTask> Drop for ComparableTaskScheduler<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Sleeper {
        key: String,
        log: Arc<Mutex<Vec<String>>>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl ComparableTask for Sleeper {
        fn task_key(&self) -> String {
            self.key.clone()
        }

        fn execute(self: Arc<Self>, cancel: CancellationToken) -> TaskFuture {
            Box::pin(async move {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {
                        self.log.lock().unwrap().push(self.key.clone());
                    }
                    _ = cancel.cancelled() => {}
                }
                self.running.fetch_sub(1, Ordering::SeqCst);
            })
        }
    }

    struct Harness {
        log: Arc<Mutex<Vec<String>>>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn sleeper(&self, key: &str, delay_ms: u64) -> Arc<Sleeper> {
            Arc::new(Sleeper {
                key: key.to_string(),
                log: Arc::clone(&self.log),
                running: Arc::clone(&self.running),
                peak: Arc::clone(&self.peak),
                delay: Duration::from_millis(delay_ms),
            })
        }
    }

    async fn settle(scheduler: &ComparableTaskScheduler<Sleeper>) {
        for _ in 0..200 {
            if scheduler.pending_count() == 0 && scheduler.running_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_respects_max_concurrency() {
        let harness = Harness::new();
        let scheduler = ComparableTaskScheduler::new(2);
        for i in 0..6 {
            assert!(scheduler.try_schedule(harness.sleeper(&i.to_string(), 10), i).unwrap());
        }
        settle(&scheduler).await;
        assert_eq!(harness.log.lock().unwrap().len(), 6);
        assert!(harness.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_pending_run_in_priority_order() {
        let harness = Harness::new();
        let scheduler = ComparableTaskScheduler::new(1);
        // occupies the only slot while the rest queue up
        scheduler.try_schedule(harness.sleeper("blocker", 30), 0).unwrap();
        scheduler.try_schedule(harness.sleeper("c", 1), 30).unwrap();
        scheduler.try_schedule(harness.sleeper("a", 1), 10).unwrap();
        scheduler.try_schedule(harness.sleeper("b", 1), 20).unwrap();
        settle(&scheduler).await;
        assert_eq!(*harness.log.lock().unwrap(), vec!["blocker", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_pending_key_not_queued_twice() {
        let harness = Harness::new();
        let scheduler = ComparableTaskScheduler::new(1);
        scheduler.try_schedule(harness.sleeper("blocker", 20), 0).unwrap();
        assert!(scheduler.try_schedule(harness.sleeper("p", 1), 1).unwrap());
        assert!(!scheduler.try_schedule(harness.sleeper("p", 1), 1).unwrap());
        settle(&scheduler).await;
        assert_eq!(harness.log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_concurrency_disables() {
        let harness = Harness::new();
        let scheduler: ComparableTaskScheduler<Sleeper> = ComparableTaskScheduler::new(0);
        assert!(!scheduler.is_enabled());
        assert!(!scheduler.try_schedule(harness.sleeper("x", 1), 0).unwrap());
    }

    #[tokio::test]
    async fn test_stop_cancels_and_rejects() {
        let harness = Harness::new();
        let scheduler = ComparableTaskScheduler::new(1);
        scheduler.try_schedule(harness.sleeper("long", 5_000), 0).unwrap();
        scheduler.try_schedule(harness.sleeper("queued", 1), 1).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.stop();
        scheduler.stop();
        assert!(scheduler.is_stopped());
        assert_eq!(scheduler.pending_count(), 0);
        assert!(!scheduler.try_schedule(harness.sleeper("late", 1), 0).unwrap());

        settle(&scheduler).await;
        assert!(harness.log.lock().unwrap().is_empty());
    }
}
