//! In-memory backend
//!
//! Serves queries from rows held in memory, spread over partition ranges by
//! effective partition key. Within a partition rows are returned in sort
//! order: the sort key, then the document id in the direction of the first
//! sort column, then insertion order. Backend continuations encode the last
//! returned position, so a parent's continuation stays valid on its split
//! children.
//!
//! Failures, latency and splits can be injected to exercise the engine.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::types::{
    BackendFailure, BackendPage, ContainerProperties, FetchRequest, QuerySpec, STATUS_GONE,
    SUBSTATUS_PARTITION_RANGE_GONE,
};
use super::{ClientFuture, QueryClient};
use crate::continuation::OrderByItem;
use crate::execution::compare_sort_keys;
use crate::execution::{PartitionedQueryExecutionInfo, QueryError, QueryResult, SortOrder};
use crate::routing::{PartitionKeyRange, Range, ResourceId};

const DATABASE_ID: u32 = 1;
const COLLECTION_ID: u32 = 1;

/// A row as stored by the in-memory backend
#[derive(Debug, Clone)]
struct StoredRow {
    /// Effective partition key, decides the owning range
    epk: String,
    rid: String,
    document: u64,
    sort_key: Vec<Option<Value>>,
    body: Value,
    seq: u64,
}

/// Position of a row in its partition's stream
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Position {
    key: Vec<OrderByItem>,
    doc: u64,
    seq: u64,
}

/// Container state behind the client
#[derive(Debug)]
struct InMemoryContainer {
    id: String,
    rid: String,
    sort_orders: Vec<SortOrder>,
    rows: Vec<StoredRow>,
    ranges: Vec<PartitionKeyRange>,
    retired: HashSet<String>,
    plan: PartitionedQueryExecutionInfo,
    next_document: u64,
    next_seq: u64,
    next_range_id: u64,
}

impl InMemoryContainer {
    fn compare_rows(&self, a: &StoredRow, b: &StoredRow) -> CmpOrdering {
        let rid_order = self.sort_orders.first().copied().unwrap_or(SortOrder::Ascending);
        compare_sort_keys(&a.sort_key, &b.sort_key, &self.sort_orders)
            .then_with(|| rid_order.apply(a.document.cmp(&b.document)))
            .then_with(|| a.seq.cmp(&b.seq))
    }

    fn compare_to_position(&self, row: &StoredRow, position: &Position) -> CmpOrdering {
        let rid_order = self.sort_orders.first().copied().unwrap_or(SortOrder::Ascending);
        let key: Vec<Option<Value>> = position.key.iter().map(|i| i.item.clone()).collect();
        compare_sort_keys(&row.sort_key, &key, &self.sort_orders)
            .then_with(|| rid_order.apply(row.document.cmp(&position.doc)))
            .then_with(|| row.seq.cmp(&position.seq))
    }

    fn shape(&self, row: &StoredRow) -> Value {
        if self.sort_orders.is_empty() {
            let mut body = row.body.clone();
            if let Value::Object(map) = &mut body {
                map.insert("_rid".into(), Value::String(row.rid.clone()));
            }
            return body;
        }
        let items: Vec<OrderByItem> = row.sort_key.iter().cloned().map(OrderByItem::new).collect();
        json!({
            "_rid": row.rid,
            "orderByItems": items,
            "payload": row.body,
        })
    }

    fn page(&self, request: &FetchRequest) -> Result<BackendPage, BackendFailure> {
        if self.retired.contains(&request.range.id) {
            return Err(BackendFailure::new(
                STATUS_GONE,
                SUBSTATUS_PARTITION_RANGE_GONE,
                format!("partition key range {} is gone", request.range.id),
            ));
        }
        if !self.ranges.iter().any(|r| r.id == request.range.id) {
            return Err(BackendFailure::new(404, 1002, format!("unknown range {}", request.range.id)));
        }

        let position: Option<Position> = match &request.continuation {
            Some(text) => Some(
                serde_json::from_str(text)
                    .map_err(|_| BackendFailure::new(400, 0, "invalid backend continuation"))?,
            ),
            None => None,
        };

        let key_range = request.range.to_range();
        let mut candidates: Vec<&StoredRow> = self
            .rows
            .iter()
            .filter(|row| key_range.contains_key(&row.epk))
            .filter(|row| request.resume_filter.as_ref().map_or(true, |f| f.admits(&row.sort_key)))
            .filter(|row| {
                position
                    .as_ref()
                    .map_or(true, |p| self.compare_to_position(row, p) == CmpOrdering::Greater)
            })
            .collect();
        candidates.sort_by(|a, b| self.compare_rows(a, b));

        let take = (request.page_size.max(1) as usize).min(candidates.len());
        let returned = &candidates[..take];
        let continuation = if take < candidates.len() {
            returned.last().map(|row| {
                let position = Position {
                    key: row.sort_key.iter().cloned().map(OrderByItem::new).collect(),
                    doc: row.document,
                    seq: row.seq,
                };
                serde_json::to_string(&position).unwrap_or_default()
            })
        } else {
            None
        };

        let items: Vec<Value> = returned.iter().map(|row| self.shape(row)).collect();
        let response_length_bytes = serde_json::to_vec(&items).map(|b| b.len() as u64).unwrap_or(0);
        Ok(BackendPage {
            request_charge: 1.0 + 0.5 * items.len() as f64,
            items,
            continuation,
            activity_id: Uuid::new_v4(),
            response_length_bytes,
        })
    }
}

/// Client over an in-memory container
#[derive(Debug)]
pub struct InMemoryQueryClient {
    container: Mutex<InMemoryContainer>,
    failures: Mutex<VecDeque<(Option<String>, BackendFailure)>>,
    latency: Mutex<Option<Duration>>,
    fetches: AtomicU64,
    in_flight: AtomicI64,
    peak_in_flight: AtomicI64,
    cache_refreshes: AtomicU64,
    plan_requests: AtomicU64,
}

impl InMemoryQueryClient {
    /// Container `id` served by `ranges`, which must cover the keyspace
    pub fn new(id: impl Into<String>, ranges: Vec<PartitionKeyRange>) -> Self {
        let next_range_id = ranges.iter().map(|r| r.numeric_id()).filter(|n| *n != i64::MAX).max().unwrap_or(-1) + 1;
        Self {
            container: Mutex::new(InMemoryContainer {
                id: id.into(),
                rid: ResourceId::collection_rid(DATABASE_ID, COLLECTION_ID),
                sort_orders: Vec::new(),
                rows: Vec::new(),
                ranges,
                retired: HashSet::new(),
                plan: PartitionedQueryExecutionInfo::passthrough(),
                next_document: 1,
                next_seq: 0,
                next_range_id: next_range_id as u64,
            }),
            failures: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
            fetches: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            peak_in_flight: AtomicI64::new(0),
            cache_refreshes: AtomicU64::new(0),
            plan_requests: AtomicU64::new(0),
        }
    }

    /// Container with `count` equal ranges numbered from 0
    pub fn with_uniform_ranges(id: impl Into<String>, count: usize) -> Self {
        Self::new(id, uniform_ranges(count))
    }

    /// Serve rows in sort order and shape them as order-by results
    pub fn set_sort_orders(&self, orders: Vec<SortOrder>) {
        if let Ok(mut container) = self.container.lock() {
            container.sort_orders = orders;
        }
    }

    /// Plan returned by `get_query_plan`
    pub fn set_query_plan(&self, plan: PartitionedQueryExecutionInfo) {
        if let Ok(mut container) = self.container.lock() {
            container.plan = plan;
        }
    }

    /// Insert a row and return its rid
    pub fn insert(&self, epk: &str, sort_key: Vec<Value>, body: Value) -> String {
        self.insert_copies(epk, sort_key.into_iter().map(Some).collect(), body, 1)
    }

    /// Insert `copies` rows sharing one rid, as a join fan-out produces
    pub fn insert_copies(&self, epk: &str, sort_key: Vec<Option<Value>>, body: Value, copies: usize) -> String {
        let Ok(mut container) = self.container.lock() else {
            return String::new();
        };
        let document = container.next_document;
        container.next_document += 1;
        let rid = ResourceId::document_rid(DATABASE_ID, COLLECTION_ID, document);
        for _ in 0..copies {
            let seq = container.next_seq;
            container.next_seq += 1;
            container.rows.push(StoredRow {
                epk: epk.to_string(),
                rid: rid.clone(),
                document,
                sort_key: sort_key.clone(),
                body: body.clone(),
                seq,
            });
        }
        rid
    }

    /// Insert a row whose rid belongs to another collection
    pub fn insert_foreign(&self, epk: &str, sort_key: Vec<Value>, body: Value, collection: u32) -> String {
        let Ok(mut container) = self.container.lock() else {
            return String::new();
        };
        let document = container.next_document;
        container.next_document += 1;
        let seq = container.next_seq;
        container.next_seq += 1;
        let rid = ResourceId::document_rid(DATABASE_ID, collection, document);
        container.rows.push(StoredRow {
            epk: epk.to_string(),
            rid: rid.clone(),
            document,
            sort_key: sort_key.into_iter().map(Some).collect(),
            body,
            seq,
        });
        rid
    }

    /// Split range `range_id` at key `at` into two new ranges
    pub fn split_range(&self, range_id: &str, at: &str) -> QueryResult<(PartitionKeyRange, PartitionKeyRange)> {
        let mut container = self.container.lock().map_err(|_| QueryError::lock_poisoned())?;
        let index = container
            .ranges
            .iter()
            .position(|r| r.id == range_id)
            .ok_or_else(|| QueryError::InvalidArgument(format!("unknown range {}", range_id)))?;
        let parent = container.ranges[index].clone();
        if !(at > parent.min_inclusive.as_str() && at < parent.max_exclusive.as_str()) {
            return Err(QueryError::InvalidArgument(format!("split key {} outside range {}", at, range_id)));
        }

        let left_id = container.next_range_id;
        let right_id = left_id + 1;
        container.next_range_id += 2;
        let left = PartitionKeyRange::new(left_id.to_string(), parent.min_inclusive.clone(), at);
        let right = PartitionKeyRange::new(right_id.to_string(), at, parent.max_exclusive.clone());

        container.ranges.remove(index);
        container.ranges.push(left.clone());
        container.ranges.push(right.clone());
        container.ranges.sort_by(|a, b| a.cmp_position(b));
        container.retired.insert(parent.id);
        Ok((left, right))
    }

    /// Fail the next fetch against any range
    pub fn fail_next(&self, failure: BackendFailure) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back((None, failure));
        }
    }

    /// Fail the next fetch against `range_id`
    pub fn fail_range(&self, range_id: &str, failure: BackendFailure) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back((Some(range_id.to_string()), failure));
        }
    }

    /// Delay every fetch
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    /// Current partition layout
    pub fn ranges(&self) -> Vec<PartitionKeyRange> {
        self.container.lock().map(|c| c.ranges.clone()).unwrap_or_default()
    }

    /// Rid of the container
    pub fn collection_rid(&self) -> String {
        self.container.lock().map(|c| c.rid.clone()).unwrap_or_default()
    }

    /// Total fetches issued
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Fetches currently in flight
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Most fetches ever in flight at once
    pub fn peak_in_flight(&self) -> i64 {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    /// Container resolutions that forced a cache refresh
    pub fn cache_refresh_count(&self) -> u64 {
        self.cache_refreshes.load(Ordering::Relaxed)
    }

    /// Calls to `get_query_plan`
    pub fn plan_request_count(&self) -> u64 {
        self.plan_requests.load(Ordering::Relaxed)
    }

    fn take_failure(&self, range_id: &str) -> Option<BackendFailure> {
        let mut failures = self.failures.lock().ok()?;
        let index = failures
            .iter()
            .position(|(target, _)| target.as_deref().map_or(true, |id| id == range_id))?;
        failures.remove(index).map(|(_, failure)| failure)
    }
}

impl QueryClient for InMemoryQueryClient {
    fn execute_query(&self, request: FetchRequest) -> ClientFuture<'_, Result<BackendPage, BackendFailure>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::Relaxed);

            let latency = self.latency.lock().ok().and_then(|l| *l);
            if let Some(delay) = latency {
                tokio::time::sleep(delay).await;
            }

            let result = match self.take_failure(&request.range.id) {
                Some(failure) => Err(failure),
                None => match self.container.lock() {
                    Ok(container) => container.page(&request),
                    Err(_) => Err(BackendFailure::new(500, 0, "container lock poisoned")),
                },
            };

            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            result
        })
    }

    fn get_overlapping_ranges<'a>(
        &'a self,
        _collection_rid: &'a str,
        range: &'a Range,
        force_refresh: bool,
    ) -> ClientFuture<'a, QueryResult<Vec<PartitionKeyRange>>> {
        Box::pin(async move {
            if force_refresh {
                self.cache_refreshes.fetch_add(1, Ordering::Relaxed);
            }
            let container = self.container.lock().map_err(|_| QueryError::lock_poisoned())?;
            let mut overlapping: Vec<PartitionKeyRange> = container
                .ranges
                .iter()
                .filter(|r| r.to_range().overlaps(range))
                .cloned()
                .collect();
            overlapping.sort_by(|a, b| a.cmp_position(b));
            Ok(overlapping)
        })
    }

    fn resolve_container<'a>(
        &'a self,
        _container_link: &'a str,
        force_refresh: bool,
    ) -> ClientFuture<'a, QueryResult<ContainerProperties>> {
        Box::pin(async move {
            if force_refresh {
                self.cache_refreshes.fetch_add(1, Ordering::Relaxed);
            }
            let container = self.container.lock().map_err(|_| QueryError::lock_poisoned())?;
            Ok(ContainerProperties {
                id: container.id.clone(),
                rid: container.rid.clone(),
            })
        })
    }

    fn get_query_plan<'a>(
        &'a self,
        _collection_rid: &'a str,
        _query: &'a QuerySpec,
    ) -> ClientFuture<'a, QueryResult<PartitionedQueryExecutionInfo>> {
        Box::pin(async move {
            self.plan_requests.fetch_add(1, Ordering::Relaxed);
            let container = self.container.lock().map_err(|_| QueryError::lock_poisoned())?;
            Ok(container.plan.clone())
        })
    }
}

/// `count` equal ranges over the keyspace, ids `0..count`
pub fn uniform_ranges(count: usize) -> Vec<PartitionKeyRange> {
    let count = count.clamp(1, 255);
    let step = 256 / count;
    (0..count)
        .map(|i| {
            let min = if i == 0 { String::new() } else { format!("{:02X}", i * step) };
            let max = if i + 1 == count { "FF".to_string() } else { format!("{:02X}", (i + 1) * step) };
            PartitionKeyRange::new(i.to_string(), min, max)
        })
        .collect()
}
