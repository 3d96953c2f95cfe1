//! # Routing
//!
//! Partition key ranges, row ids and the mapping of resume tokens onto the
//! current partition layout.

mod mapping;
mod range;
mod resource_id;

pub use mapping::{match_ranges_to_tokens, try_get_initialization_info, InitializationInfo, RangeMapping, RangeToken};
pub use range::{ranges_exactly_cover, PartitionKeyRange, Range, MAX_EXCLUSIVE_EPK, MIN_INCLUSIVE_EPK};
pub use resource_id::ResourceId;
