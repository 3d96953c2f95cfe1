//! Maps resume tokens onto the current partition layout
//!
//! Tokens name the ranges that existed when they were written. After a split
//! those ranges may be covered by several current ranges, so each current
//! range is matched to the token whose range contains it.

use super::range::{PartitionKeyRange, Range};
use crate::execution::{QueryError, QueryResult};

/// A resume token scoped to one partition range
pub trait RangeToken {
    /// The range the token was written for
    fn range(&self) -> &Range;
}

/// A current range and the token to resume it from, if any
pub type RangeMapping<T> = Vec<(PartitionKeyRange, Option<T>)>;

/// Current ranges split around the leftmost in-progress range
#[derive(Debug, Clone)]
pub struct InitializationInfo<T> {
    /// Ranges before the target
    pub left_of_target: RangeMapping<T>,
    /// The range whose min matches the leftmost token
    pub target: RangeMapping<T>,
    /// Ranges after the target
    pub right_of_target: RangeMapping<T>,
}

/// Split `ranges` into left, target and right given resume tokens
///
/// The target is the current range whose min equals the min of the leftmost
/// token's range. Fails with a malformed token error when no such range exists.
pub fn try_get_initialization_info<T: RangeToken + Clone>(
    ranges: &[PartitionKeyRange],
    tokens: &[T],
) -> QueryResult<InitializationInfo<T>> {
    if ranges.is_empty() {
        return Err(QueryError::InvalidArgument("at least one partition range is required".into()));
    }
    if tokens.is_empty() {
        return Err(QueryError::InvalidArgument("at least one continuation token is required".into()));
    }
    if tokens.len() > ranges.len() {
        return Err(QueryError::MalformedContinuationToken(format!(
            "{} continuation tokens for {} partition ranges",
            tokens.len(),
            ranges.len()
        )));
    }

    let mut sorted: Vec<PartitionKeyRange> = ranges.to_vec();
    sorted.sort_by(|a, b| a.cmp_position(b));

    let leftmost = tokens
        .iter()
        .min_by(|a, b| a.range().min.cmp(&b.range().min))
        .ok_or_else(|| QueryError::Internal("empty token list".into()))?;

    let index = sorted
        .binary_search_by(|range| range.min_inclusive.as_str().cmp(leftmost.range().min.as_str()))
        .map_err(|_| {
            QueryError::MalformedContinuationToken(format!(
                "no partition range starts at '{}'",
                leftmost.range().min
            ))
        })?;

    let right = sorted.split_off(index + 1);
    let target = sorted.split_off(index);
    let left = sorted;

    Ok(InitializationInfo {
        left_of_target: match_ranges_to_tokens(&left, tokens),
        target: match_ranges_to_tokens(&target, tokens),
        right_of_target: match_ranges_to_tokens(&right, tokens),
    })
}

/// Pair each range with the first token whose range contains it
pub fn match_ranges_to_tokens<T: RangeToken + Clone>(
    ranges: &[PartitionKeyRange],
    tokens: &[T],
) -> RangeMapping<T> {
    ranges
        .iter()
        .map(|range| {
            let key_range = range.to_range();
            let token = tokens
                .iter()
                .find(|token| token.range().contains_range(&key_range))
                .cloned();
            (range.clone(), token)
        })
        .collect()
}
