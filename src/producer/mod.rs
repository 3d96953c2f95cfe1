//! # Partition Producers
//!
//! A producer reads one partition range. It is split in two halves:
//!
//! - `PartitionFetcher`: shared with background prefetch tasks, fetches
//!   pages into a queue, one fetch in flight at a time
//! - `ItemProducer`: owned by the consumer, walks the queued pages item by
//!   item and tracks the continuations needed to resume
//!
//! `ProducerTree` wraps a producer and replaces it by its children when the
//! range is split.

mod fetcher;
mod item_producer;
mod tree;

pub use fetcher::{FetchObserver, FetchOutcome, FetchSource, NoopFetchObserver, PartitionFetcher};
pub use item_producer::{never_equal, EqualityComparer, ItemProducer};
pub use tree::{ProducerComparator, ProducerTree};
