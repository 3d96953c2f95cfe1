//! Split-aware producer tree
//!
//! Each target range starts as a single root producer. When a fetch reports
//! that the range was split, the failing leaf is shut down and replaced by
//! one child per overlapping range. Children resume from the parent's last
//! backend continuation with the parent's filter. Nodes live in an arena and
//! refer to their children by index.

use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::item_producer::ItemProducer;
use crate::execution::{QueryError, QueryResult};
use crate::observability::{log_event_with_fields, QueryEvent};
use crate::routing::{ranges_exactly_cover, PartitionKeyRange};

/// Orders producers; the `Less` one is drained first
pub type ProducerComparator = Arc<dyn Fn(&ItemProducer, &ItemProducer) -> Ordering + Send + Sync>;

struct TreeNode {
    producer: ItemProducer,
    children: Vec<usize>,
}

/// Producers of one target range and of every range it was split into
pub struct ProducerTree {
    nodes: Vec<TreeNode>,
    comparator: ProducerComparator,
}

impl ProducerTree {
    const ROOT: usize = 0;

    pub fn new(root: ItemProducer, comparator: ProducerComparator) -> Self {
        Self {
            nodes: vec![TreeNode {
                producer: root,
                children: Vec::new(),
            }],
            comparator,
        }
    }

    /// The producer of the original target range
    pub fn root(&self) -> &ItemProducer {
        &self.nodes[Self::ROOT].producer
    }

    pub fn has_split(&self) -> bool {
        !self.nodes[Self::ROOT].children.is_empty()
    }

    pub fn has_more_results(&self) -> bool {
        self.has_more_results_at(Self::ROOT)
    }

    fn has_more_results_at(&self, index: usize) -> bool {
        let node = &self.nodes[index];
        node.producer.has_more_results() || node.children.iter().any(|&child| self.has_more_results_at(child))
    }

    /// The leaf producer currently served by this tree
    pub fn current(&self) -> &ItemProducer {
        &self.nodes[self.current_index()].producer
    }

    fn current_index(&self) -> usize {
        self.current_index_from(Self::ROOT)
    }

    fn current_index_from(&self, index: usize) -> usize {
        let node = &self.nodes[index];
        if node.children.is_empty() || node.producer.has_more_results() {
            return index;
        }

        let mut best: Option<usize> = None;
        for &child in &node.children {
            if !self.has_more_results_at(child) {
                continue;
            }
            let leaf = self.current_index_from(child);
            best = match best {
                Some(b) if (self.comparator)(&self.nodes[b].producer, &self.nodes[leaf].producer) != Ordering::Greater => {
                    Some(b)
                }
                _ => Some(leaf),
            };
        }
        best.unwrap_or(index)
    }

    /// Every leaf producer, left to right
    pub fn leaves(&self) -> Vec<&ItemProducer> {
        let mut out = Vec::new();
        self.collect_leaves(Self::ROOT, &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, index: usize, out: &mut Vec<&'a ItemProducer>) {
        let node = &self.nodes[index];
        if node.children.is_empty() {
            out.push(&node.producer);
            return;
        }
        for &child in &node.children {
            self.collect_leaves(child, out);
        }
    }

    /// Producers whose continuation must be carried forward
    ///
    /// An unsplit tree contributes its root while active. A split tree
    /// contributes its root only while the root is active with items still
    /// buffered; otherwise its children are asked in turn.
    pub fn active_producers(&self) -> Vec<&ItemProducer> {
        let mut out = Vec::new();
        self.collect_active(Self::ROOT, &mut out);
        out
    }

    fn collect_active<'a>(&'a self, index: usize, out: &mut Vec<&'a ItemProducer>) {
        let node = &self.nodes[index];
        if node.children.is_empty() {
            if node.producer.is_active() {
                out.push(&node.producer);
            }
            return;
        }
        if node.producer.is_active() && node.producer.buffered_item_count() != 0 {
            out.push(&node.producer);
            return;
        }
        for &child in &node.children {
            self.collect_active(child, out);
        }
    }

    /// Move the current leaf to its next item, repairing a split on the way
    ///
    /// Returns true while the tree has a current item.
    pub async fn move_next(&mut self, cancel: &CancellationToken) -> QueryResult<bool> {
        let index = self.current_index();
        match self.nodes[index].producer.move_next(cancel).await {
            Ok(moved) => Ok(moved || self.has_more_results()),
            Err(err) if err.is_partition_split() => {
                self.repair_split(index, cancel).await?;
                Ok(self.has_more_results())
            }
            Err(err) => Err(err),
        }
    }

    /// Move the current leaf to its next page, repairing a split on the way
    pub async fn try_move_next_page(&mut self, cancel: &CancellationToken) -> QueryResult<bool> {
        let index = self.current_index();
        match self.nodes[index].producer.try_move_next_page(cancel).await {
            Ok(moved) => Ok(moved),
            Err(err) if err.is_partition_split() => {
                self.repair_split(index, cancel).await?;
                Ok(self.has_more_results())
            }
            Err(err) => Err(err),
        }
    }

    pub fn try_move_next_document_within_page(&mut self) -> bool {
        let index = self.current_index();
        self.nodes[index].producer.try_move_next_document_within_page()
    }

    /// Set the filter of the current leaf
    pub fn set_filter(&mut self, filter: Option<String>) {
        let index = self.current_index();
        self.nodes[index].producer.set_filter(filter);
    }

    /// Replace the leaf at `index` by producers over the ranges it split into
    ///
    /// Each child is moved onto its first item. A child that is itself
    /// split is repaired the same way.
    fn repair_split<'a>(
        &'a mut self,
        index: usize,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = QueryResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let parent = &mut self.nodes[index].producer;
            parent.shutdown();
            let unapplied_skip = parent.take_pending_skip();
            let fetcher = Arc::clone(parent.fetcher());
            let filter = parent.filter().map(str::to_string);
            let equality = parent.equality();
            let parent_range = fetcher.range().to_range();

            let replacements: Vec<PartitionKeyRange> = fetcher
                .client()
                .get_overlapping_ranges(fetcher.collection_rid(), &parent_range, true)
                .await?;
            if !ranges_exactly_cover(&replacements, &parent_range) {
                return Err(QueryError::Internal(format!(
                    "ranges replacing {} do not cover [{}, {})",
                    fetcher.range().id,
                    parent_range.min,
                    parent_range.max
                )));
            }

            log_event_with_fields(
                QueryEvent::PartitionSplitDetected,
                &[
                    ("range_id", &fetcher.range().id),
                    ("child_count", &replacements.len().to_string()),
                ],
            );
            if unapplied_skip > 0 {
                log_event_with_fields(
                    QueryEvent::ResumeSkipDropped,
                    &[("range_id", &fetcher.range().id), ("skip_count", &unapplied_skip.to_string())],
                );
            }

            for range in replacements {
                let mut child = ItemProducer::new(fetcher.spawn_child(range), Arc::clone(&equality));
                child.set_filter(filter.clone());

                let child_index = self.nodes.len();
                self.nodes.push(TreeNode {
                    producer: child,
                    children: Vec::new(),
                });
                self.nodes[index].children.push(child_index);

                match self.nodes[child_index].producer.move_next(cancel).await {
                    Ok(_) => {}
                    Err(err) if err.is_partition_split() => self.repair_split(child_index, cancel).await?,
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        })
    }
}
