//! Partition key ranges
//!
//! Effective partition keys are upper-case hex strings compared ordinally.
//! `""` is the start of the keyspace and `"FF"` its end.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Smallest effective partition key
pub const MIN_INCLUSIVE_EPK: &str = "";

/// Largest effective partition key (exclusive)
pub const MAX_EXCLUSIVE_EPK: &str = "FF";

/// Half-open key range `[min, max)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    /// Inclusive lower bound
    pub min: String,
    /// Exclusive upper bound
    pub max: String,
}

impl Range {
    /// Create a range
    pub fn new(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// The whole keyspace
    pub fn full() -> Self {
        Self::new(MIN_INCLUSIVE_EPK, MAX_EXCLUSIVE_EPK)
    }

    /// A range is usable only if it is non-empty
    pub fn is_valid(&self) -> bool {
        self.min < self.max
    }

    /// True if `other` lies entirely inside this range
    pub fn contains_range(&self, other: &Range) -> bool {
        other.min >= self.min && other.max <= self.max
    }

    /// True if `key` lies inside this range
    pub fn contains_key(&self, key: &str) -> bool {
        key >= self.min.as_str() && key < self.max.as_str()
    }

    /// True if the two ranges share at least one key
    pub fn overlaps(&self, other: &Range) -> bool {
        self.min < other.max && other.min < self.max
    }
}

/// A backend partition: a stable identifier plus the keys it serves
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKeyRange {
    /// Stable identifier; numeric for backend-assigned ranges
    pub id: String,
    /// Inclusive lower bound
    #[serde(rename = "minInclusive")]
    pub min_inclusive: String,
    /// Exclusive upper bound
    #[serde(rename = "maxExclusive")]
    pub max_exclusive: String,
}

impl PartitionKeyRange {
    /// Create a partition key range
    pub fn new(id: impl Into<String>, min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min.into(),
            max_exclusive: max.into(),
        }
    }

    /// The keys served by this partition
    pub fn to_range(&self) -> Range {
        Range::new(self.min_inclusive.clone(), self.max_exclusive.clone())
    }

    /// Numeric form of the id, used as the parallel fetch priority
    pub fn numeric_id(&self) -> i64 {
        self.id.parse().unwrap_or(i64::MAX)
    }

    /// Orders ranges by their position in the keyspace
    pub fn cmp_position(&self, other: &PartitionKeyRange) -> Ordering {
        self.min_inclusive
            .cmp(&other.min_inclusive)
            .then_with(|| self.max_exclusive.cmp(&other.max_exclusive))
    }
}

/// Returns true if `ranges`, sorted by position, cover `target` with no gaps or overlaps
pub fn ranges_exactly_cover(ranges: &[PartitionKeyRange], target: &Range) -> bool {
    let mut sorted: Vec<&PartitionKeyRange> = ranges.iter().collect();
    sorted.sort_by(|a, b| a.cmp_position(b));

    let mut cursor = target.min.as_str();
    for range in sorted {
        if range.min_inclusive != cursor || range.min_inclusive >= range.max_exclusive {
            return false;
        }
        cursor = range.max_exclusive.as_str();
    }
    cursor == target.max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_containment() {
        let parent = Range::new("", "80");
        assert!(parent.contains_range(&Range::new("", "40")));
        assert!(parent.contains_range(&Range::new("40", "80")));
        assert!(!parent.contains_range(&Range::new("40", "FF")));
        assert!(parent.contains_key("7F"));
        assert!(!parent.contains_key("80"));
    }

    #[test]
    fn test_overlap() {
        assert!(Range::new("", "80").overlaps(&Range::new("7F", "FF")));
        assert!(!Range::new("", "80").overlaps(&Range::new("80", "FF")));
    }

    #[test]
    fn test_validity() {
        assert!(Range::full().is_valid());
        assert!(!Range::new("80", "80").is_valid());
        assert!(!Range::new("FF", "00").is_valid());
    }

    #[test]
    fn test_numeric_id() {
        assert_eq!(PartitionKeyRange::new("12", "", "FF").numeric_id(), 12);
        assert_eq!(PartitionKeyRange::new("abc", "", "FF").numeric_id(), i64::MAX);
    }

    #[test]
    fn test_exact_cover() {
        let parent = Range::new("", "80");
        let children = vec![
            PartitionKeyRange::new("3", "40", "80"),
            PartitionKeyRange::new("2", "", "40"),
        ];
        assert!(ranges_exactly_cover(&children, &parent));

        let gap = vec![
            PartitionKeyRange::new("2", "", "30"),
            PartitionKeyRange::new("3", "40", "80"),
        ];
        assert!(!ranges_exactly_cover(&gap, &parent));

        let short = vec![PartitionKeyRange::new("2", "", "40")];
        assert!(!ranges_exactly_cover(&short, &parent));
    }
}
