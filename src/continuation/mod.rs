//! # Continuation Tokens
//!
//! Resume state handed to the caller after each page.
//!
//! Two layers:
//! 1. Source tokens written by the cross-partition strategies (parallel and
//!    order-by), one entry per producer whose progress must be preserved
//! 2. The versioned pipeline token that wraps the outermost stage's token
//!    and may cache the query plan
//!
//! Callers treat the serialized string as opaque.

mod composite;
mod order_by;
mod pipeline;

pub use composite::CompositeContinuationToken;
pub use order_by::{OrderByContinuationToken, OrderByItem};
pub use pipeline::{PipelineContinuationToken, TokenVersion};
