//! # Order-By Execution
//!
//! Sort value comparison, resume filters and the k-way merge strategy.

mod comparer;
mod context;
mod filter;

pub use comparer::{compare_items, compare_sort_keys};
pub use context::OrderByContext;
pub use filter::{FormattedFilters, OrderByColumn, ResumeFilter};
