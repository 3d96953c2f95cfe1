//! # Prefetch Scheduling
//!
//! Background fetches run through a bounded-concurrency scheduler that
//! orders pending work by a caller supplied priority. Charges of concurrently
//! completing fetches accumulate in a lock-free tracker.

mod charge;
mod priority_queue;
mod task_scheduler;

pub use charge::RequestChargeTracker;
pub use priority_queue::{Comparator, PriorityQueue};
pub use task_scheduler::{ComparableTask, ComparableTaskScheduler, TaskFuture};
