//! Binary heap ordered by an injected comparator
//!
//! The element that compares `Less` than every other is at the head.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Comparator deciding which of two elements is served first
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Min-heap over a caller supplied ordering
pub struct PriorityQueue<T> {
    heap: Vec<T>,
    comparator: Comparator<T>,
}

impl<T> PriorityQueue<T> {
    /// Create an empty queue
    pub fn new(comparator: Comparator<T>) -> Self {
        Self {
            heap: Vec::new(),
            comparator,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The comparator the queue orders by
    pub fn comparator(&self) -> &Comparator<T> {
        &self.comparator
    }

    /// Insert an element
    pub fn push(&mut self, item: T) {
        self.heap.push(item);
        self.sift_up(self.heap.len() - 1);
    }

    /// Remove and return the head
    pub fn pop(&mut self) -> Option<T> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let head = self.heap.pop();
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        head
    }

    /// The head, without removing it
    pub fn peek(&self) -> Option<&T> {
        self.heap.first()
    }

    /// All elements in heap order (not sorted)
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.heap.iter()
    }

    /// Remove every element
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Remove and return every element, sorted head first
    pub fn drain_sorted(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(item) = self.pop() {
            out.push(item);
        }
        out
    }

    fn less(&self, a: usize, b: usize) -> bool {
        (self.comparator)(&self.heap[a], &self.heap[b]) == Ordering::Less
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.heap.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.heap.swap(index, smallest);
            index = smallest;
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue").field("heap", &self.heap).finish()
    }
}
