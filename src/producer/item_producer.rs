//! Consumer half of a partition producer
//!
//! `ItemProducer` walks the pages its fetcher buffered. It tracks the
//! current item, how many items of the current page are left, whether the
//! current item opened its page, and the continuations of the current and
//! previous page. A resumed producer can drop the items of its first pages
//! that were already returned.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::fetcher::PartitionFetcher;
use crate::execution::{QueryError, QueryResult};
use crate::routing::PartitionKeyRange;

/// Decides whether two consecutive items are the same for continuation
/// purposes. A producer stays active while its items compare equal to the
/// one it resumed at.
pub type EqualityComparer = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// Equality under which no two items are equal
pub fn never_equal() -> EqualityComparer {
    Arc::new(|_: &Value, _: &Value| false)
}

/// Cursor over the items of one partition range
pub struct ItemProducer {
    fetcher: Arc<PartitionFetcher>,
    equality: EqualityComparer,
    page: VecDeque<Value>,
    has_page: bool,
    current: Option<Value>,
    items_left_in_page: usize,
    page_len: usize,
    pending_skip: usize,
    primed: bool,
    is_at_beginning_of_page: bool,
    has_more_results: bool,
    is_active: bool,
    previous_continuation: Option<String>,
    current_continuation: Option<String>,
    filter: Option<String>,
}

impl ItemProducer {
    /// Producer over `fetcher`, starting at the fetcher's backend continuation
    pub fn new(fetcher: Arc<PartitionFetcher>, equality: EqualityComparer) -> Self {
        let initial = fetcher.backend_continuation();
        Self {
            fetcher,
            equality,
            page: VecDeque::new(),
            has_page: false,
            current: None,
            items_left_in_page: 0,
            page_len: 0,
            pending_skip: 0,
            primed: false,
            is_at_beginning_of_page: false,
            has_more_results: true,
            is_active: initial.is_some(),
            previous_continuation: None,
            current_continuation: initial,
            filter: None,
        }
    }

    pub fn fetcher(&self) -> &Arc<PartitionFetcher> {
        &self.fetcher
    }

    pub fn range(&self) -> &PartitionKeyRange {
        self.fetcher.range()
    }

    pub fn equality(&self) -> EqualityComparer {
        Arc::clone(&self.equality)
    }

    /// The item the cursor is on
    pub fn current(&self) -> Option<&Value> {
        self.current.as_ref()
    }

    pub fn has_more_results(&self) -> bool {
        self.has_more_results
    }

    /// True while this producer must keep its place in the continuation
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// True when the current item is the first of its page
    pub fn is_at_beginning_of_page(&self) -> bool {
        self.is_at_beginning_of_page
    }

    /// Items of the current page not yet moved past, the current one included
    pub fn items_left_in_current_page(&self) -> usize {
        self.items_left_in_page
    }

    /// Items of the current page before the current item
    ///
    /// Zero when the cursor is between pages.
    pub fn consumed_in_current_page(&self) -> usize {
        if self.current.is_some() {
            self.page_len.saturating_sub(self.items_left_in_page)
        } else {
            0
        }
    }

    /// Drop the next `count` items fetched, across page boundaries
    pub fn set_pending_skip(&mut self, count: usize) {
        self.pending_skip = count;
    }

    /// Items still to be dropped before the cursor reaches its first item
    pub fn pending_skip(&self) -> usize {
        self.pending_skip
    }

    /// Clear the pending skip, returning what was left of it
    pub fn take_pending_skip(&mut self) -> usize {
        std::mem::take(&mut self.pending_skip)
    }

    /// Items buffered by the fetcher plus those left in the current page
    pub fn buffered_item_count(&self) -> u64 {
        self.fetcher.buffered_item_count() + self.items_left_in_page as u64
    }

    /// Backend continuation that fetched the current page
    pub fn previous_continuation(&self) -> Option<&str> {
        self.previous_continuation.as_deref()
    }

    /// Backend continuation of the page after the current one
    pub fn current_continuation(&self) -> Option<&str> {
        self.current_continuation.as_deref()
    }

    /// Resume filter text this producer was started with
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn set_filter(&mut self, filter: Option<String>) {
        self.filter = filter;
    }

    /// True once the cursor has been moved onto an item at least once
    pub fn has_started(&self) -> bool {
        self.has_page
    }

    pub fn has_more_backend_results(&self) -> bool {
        self.fetcher.has_more_backend_results()
    }

    /// Stop producing; used when the range is replaced after a split
    pub fn shutdown(&mut self) {
        self.has_more_results = false;
    }

    /// Move to the next buffered page, fetching one if none is buffered
    ///
    /// A queued failure ends the producer and is returned as the error.
    pub async fn try_move_next_page(&mut self, cancel: &CancellationToken) -> QueryResult<bool> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        if self.items_left_in_page != 0 {
            return Err(QueryError::Internal(format!(
                "range {} moved to the next page with {} items left",
                self.range().id,
                self.items_left_in_page
            )));
        }

        self.fetcher.buffer_more(cancel, true).await?;
        match self.fetcher.take_page()? {
            None => {
                self.has_more_results = false;
                Ok(false)
            }
            Some(Err(failure)) => {
                self.has_more_results = false;
                Err(failure.into())
            }
            Some(Ok(page)) => {
                self.previous_continuation = self.current_continuation.take();
                self.current_continuation = page.continuation;
                self.page_len = page.items.len();
                self.page = page.items.into();
                let skipped = self.pending_skip.min(self.page_len);
                self.page.drain(..skipped);
                self.pending_skip -= skipped;
                self.items_left_in_page = self.page_len - skipped;
                self.has_page = true;
                self.primed = false;
                self.is_at_beginning_of_page = false;
                Ok(true)
            }
        }
    }

    /// Move to the next item of the current page, without fetching
    pub fn try_move_next_document_within_page(&mut self) -> bool {
        if !self.has_page {
            return false;
        }

        let original = self.current.take();
        self.current = self.page.pop_front();
        let moved = self.current.is_some();

        let changed = match (&original, &self.current) {
            (Some(before), Some(after)) => !(self.equality)(before, after),
            _ => false,
        };
        if !moved || changed {
            self.is_active = false;
        }

        if !self.primed {
            self.is_at_beginning_of_page = true;
            self.primed = true;
        } else {
            self.items_left_in_page = self.items_left_in_page.saturating_sub(1);
            self.is_at_beginning_of_page = false;
        }

        if !moved && self.current_continuation.is_none() {
            self.has_more_results = false;
        }
        moved
    }

    /// Move to the next item, fetching pages as needed
    pub async fn move_next(&mut self, cancel: &CancellationToken) -> QueryResult<bool> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        if self.try_move_next_document_within_page() {
            return Ok(true);
        }
        loop {
            if !self.try_move_next_page(cancel).await? {
                return Ok(false);
            }
            if self.try_move_next_document_within_page() {
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BackendFailure, InMemoryQueryClient, QuerySpec};
    use crate::producer::{FetchSource, NoopFetchObserver};
    use serde_json::json;
    use std::sync::Weak;

    fn producer(client: &Arc<InMemoryQueryClient>, page_size: u32, continuation: Option<String>) -> ItemProducer {
        let source = FetchSource {
            client: client.clone(),
            collection_rid: client.collection_rid(),
            query: QuerySpec::new("SELECT * FROM c"),
            resume_filter: None,
        };
        let fetcher = PartitionFetcher::new(
            client.ranges()[0].clone(),
            source,
            continuation,
            page_size,
            Weak::<NoopFetchObserver>::new(),
        );
        ItemProducer::new(fetcher, never_equal())
    }

    fn client_with(rows: usize) -> Arc<InMemoryQueryClient> {
        let client = Arc::new(InMemoryQueryClient::with_uniform_ranges("c", 1));
        for i in 0..rows {
            client.insert("10", vec![], json!({"id": i}));
        }
        client
    }

    #[tokio::test]
    async fn test_walks_all_items_across_pages() {
        let client = client_with(5);
        let mut producer = producer(&client, 2, None);
        let cancel = CancellationToken::new();

        let mut ids = Vec::new();
        while producer.move_next(&cancel).await.unwrap() {
            ids.push(producer.current().unwrap()["id"].as_u64().unwrap());
        }
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(!producer.has_more_results());
    }

    #[tokio::test]
    async fn test_page_bookkeeping() {
        let client = client_with(4);
        let mut producer = producer(&client, 2, None);
        let cancel = CancellationToken::new();

        assert!(producer.move_next(&cancel).await.unwrap());
        assert!(producer.is_at_beginning_of_page());
        assert_eq!(producer.items_left_in_current_page(), 2);
        assert!(producer.previous_continuation().is_none());
        let first_page_next = producer.current_continuation().map(str::to_string);

        assert!(producer.move_next(&cancel).await.unwrap());
        assert!(!producer.is_at_beginning_of_page());
        assert_eq!(producer.items_left_in_current_page(), 1);

        assert!(producer.move_next(&cancel).await.unwrap());
        assert!(producer.is_at_beginning_of_page());
        assert_eq!(producer.previous_continuation().map(str::to_string), first_page_next);
    }

    #[tokio::test]
    async fn test_resumed_producer_starts_active() {
        let client = client_with(4);
        let fresh = producer(&client, 2, None);
        assert!(!fresh.is_active());

        let mut reader = producer(&client, 2, None);
        reader.move_next(&CancellationToken::new()).await.unwrap();
        let token = reader.current_continuation().map(str::to_string);

        let mut resumed = producer(&client, 2, token.clone());
        assert!(resumed.is_active());
        resumed.move_next(&CancellationToken::new()).await.unwrap();
        assert_eq!(resumed.current().unwrap()["id"], 2);
        assert_eq!(resumed.previous_continuation().map(str::to_string), token);
        // moving onto a different item under never_equal deactivates
        resumed.move_next(&CancellationToken::new()).await.unwrap();
        assert!(!resumed.is_active());
    }

    #[tokio::test]
    async fn test_consumed_in_current_page() {
        let client = client_with(6);
        let mut producer = producer(&client, 3, None);
        let cancel = CancellationToken::new();

        assert_eq!(producer.consumed_in_current_page(), 0);
        producer.move_next(&cancel).await.unwrap();
        assert_eq!(producer.consumed_in_current_page(), 0);
        producer.move_next(&cancel).await.unwrap();
        producer.move_next(&cancel).await.unwrap();
        assert_eq!(producer.consumed_in_current_page(), 2);
        // first item of the second page
        producer.move_next(&cancel).await.unwrap();
        assert_eq!(producer.consumed_in_current_page(), 0);
    }

    #[tokio::test]
    async fn test_pending_skip_spans_pages() {
        let client = client_with(7);
        let mut producer = producer(&client, 2, None);
        producer.set_pending_skip(3);
        let cancel = CancellationToken::new();

        assert!(producer.move_next(&cancel).await.unwrap());
        assert_eq!(producer.current().unwrap()["id"], 3);
        assert_eq!(producer.pending_skip(), 0);
        // the skipped item of the second page still counts as consumed
        assert_eq!(producer.consumed_in_current_page(), 1);

        let mut ids = vec![3];
        while producer.move_next(&cancel).await.unwrap() {
            ids.push(producer.current().unwrap()["id"].as_u64().unwrap());
        }
        assert_eq!(ids, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_pending_skip_past_the_end() {
        let client = client_with(2);
        let mut producer = producer(&client, 5, None);
        producer.set_pending_skip(4);
        assert!(!producer.move_next(&CancellationToken::new()).await.unwrap());
        assert!(!producer.has_more_results());
    }

    #[tokio::test]
    async fn test_failure_ends_producer() {
        let client = client_with(4);
        client.fail_next(BackendFailure::new(429, 0, "throttled"));
        let mut producer = producer(&client, 2, None);

        let err = producer.move_next(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert!(!producer.has_more_results());
    }

    #[tokio::test]
    async fn test_empty_partition() {
        let client = client_with(0);
        let mut producer = producer(&client, 2, None);
        assert!(!producer.move_next(&CancellationToken::new()).await.unwrap());
        assert!(!producer.has_more_results());
        assert!(producer.current().is_none());
    }
}
