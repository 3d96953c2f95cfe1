//! Observability for query execution
//!
//! - Structured logging (JSON), one line per event
//! - Typed events with fixed severities
//! - Logging never feeds back into execution
//!
//! # Usage
//!
//! ```ignore
//! use crossquery::observability::{log_event_with_fields, QueryEvent};
//!
//! log_event_with_fields(QueryEvent::PartitionSplitDetected, &[("range_id", "0")]);
//! ```

mod events;
mod logger;

pub use events::QueryEvent;
pub use logger::{Logger, Severity};

/// Log a query event
pub fn log_event(event: QueryEvent) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a query event with fields
pub fn log_event_with_fields(event: QueryEvent, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        log_event(QueryEvent::ContextInitialized);
        log_event(QueryEvent::PageComplete);
    }

    #[test]
    fn test_log_event_with_fields() {
        log_event_with_fields(QueryEvent::StaleCacheRetry, &[("collection", "coll")]);
    }
}
