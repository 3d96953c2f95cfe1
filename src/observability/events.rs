//! Observable query execution events
//!
//! Every line the engine logs is one of these; the string forms are stable
//! and safe to alert on.

use std::fmt;

use super::logger::Severity;

/// Events emitted while executing a cross-partition query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryEvent {
    // Lifecycle
    /// Cross-partition context created its producers
    ContextInitialized,
    /// A page was handed to the caller
    PageComplete,
    /// A page failed and the query stopped
    QueryFailed,

    // Partition topology
    /// A partition fetch reported that its range was split
    PartitionSplitDetected,

    // Prefetch
    /// Background fetch scheduled for a partition
    PrefetchScheduled,
    /// Background fetch skipped because the buffer budget is spent
    PrefetchSuppressed,
    /// A partition fetch returned a failure
    PartitionFetchFailed,

    // Continuation
    /// A continuation token was rejected
    MalformedContinuation,
    /// Query plan dropped from a continuation to respect the length limit
    QueryPlanDropped,
    /// In-page skip of a resumed range ignored because the range split
    ResumeSkipDropped,

    // Retry
    /// Context rebuilt after a stale collection cache
    StaleCacheRetry,
}

impl QueryEvent {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryEvent::ContextInitialized => "QUERY_CONTEXT_INITIALIZED",
            QueryEvent::PageComplete => "QUERY_PAGE_COMPLETE",
            QueryEvent::QueryFailed => "QUERY_FAILED",
            QueryEvent::PartitionSplitDetected => "PARTITION_SPLIT_DETECTED",
            QueryEvent::PrefetchScheduled => "PREFETCH_SCHEDULED",
            QueryEvent::PrefetchSuppressed => "PREFETCH_SUPPRESSED",
            QueryEvent::PartitionFetchFailed => "PARTITION_FETCH_FAILED",
            QueryEvent::MalformedContinuation => "MALFORMED_CONTINUATION",
            QueryEvent::QueryPlanDropped => "QUERY_PLAN_DROPPED",
            QueryEvent::ResumeSkipDropped => "RESUME_SKIP_DROPPED",
            QueryEvent::StaleCacheRetry => "STALE_CACHE_RETRY",
        }
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            QueryEvent::PageComplete
            | QueryEvent::PrefetchScheduled
            | QueryEvent::PrefetchSuppressed
            | QueryEvent::QueryPlanDropped => Severity::Trace,
            QueryEvent::ContextInitialized => Severity::Debug,
            QueryEvent::PartitionSplitDetected => Severity::Info,
            QueryEvent::PartitionFetchFailed
            | QueryEvent::MalformedContinuation
            | QueryEvent::ResumeSkipDropped
            | QueryEvent::StaleCacheRetry => Severity::Warn,
            QueryEvent::QueryFailed => Severity::Error,
        }
    }
}

impl fmt::Display for QueryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
