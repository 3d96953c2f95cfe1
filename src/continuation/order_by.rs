//! Order-by continuation tokens
//!
//! Wire form, one entry per active producer:
//!
//! ```text
//! [{
//!   "compositeToken": {"token": "..", "range": {"min": "..", "max": ".."}},
//!   "orderByItems": [{"item": <value>}, ...],
//!   "rid": "<row id>",
//!   "skipCount": 0,
//!   "filter": "<filter the producer was running>"
//! }]
//! ```
//!
//! An `orderByItems` entry without `item` is an undefined sort value, which
//! is distinct from `{"item": null}`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::composite::CompositeContinuationToken;
use crate::execution::{QueryError, QueryResult};
use crate::routing::{Range, RangeToken};

/// One sort value of a row
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderByItem {
    /// `None` is undefined, `Some(Value::Null)` is null
    #[serde(default, deserialize_with = "deserialize_present", skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl OrderByItem {
    /// Wrap a sort value
    pub fn new(item: Option<Value>) -> Self {
        Self { item }
    }
}

/// Resume state of one order-by producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByContinuationToken {
    /// Backend position of the producer's previous page
    #[serde(rename = "compositeToken")]
    pub composite_token: CompositeContinuationToken,
    /// Sort key of the last emitted row
    #[serde(rename = "orderByItems")]
    pub order_by_items: Vec<OrderByItem>,
    /// Row id of the last emitted row
    pub rid: String,
    /// Rows at exactly this key and rid already emitted, beyond the first
    #[serde(rename = "skipCount")]
    pub skip_count: u32,
    /// Filter the producer was running
    #[serde(default)]
    pub filter: Option<String>,
}

impl OrderByContinuationToken {
    /// Parse and validate an order-by continuation for `column_count` sort columns
    pub fn parse_list(value: &Value, column_count: usize) -> QueryResult<Vec<Self>> {
        if !value.is_array() {
            return Err(QueryError::MalformedContinuationToken(
                "order by continuation must be an array".into(),
            ));
        }
        let tokens: Vec<Self> = serde_json::from_value(value.clone())
            .map_err(|e| QueryError::MalformedContinuationToken(e.to_string()))?;
        if tokens.is_empty() {
            return Err(QueryError::MalformedContinuationToken(
                "order by continuation is empty".into(),
            ));
        }
        for token in &tokens {
            token.composite_token.validate()?;
            if token.order_by_items.len() != column_count {
                return Err(QueryError::MalformedContinuationToken(format!(
                    "expected {} order by items, found {}",
                    column_count,
                    token.order_by_items.len()
                )));
            }
        }
        Ok(tokens)
    }

    /// Sort values as a plain tuple
    pub fn sort_key(&self) -> Vec<Option<Value>> {
        self.order_by_items.iter().map(|i| i.item.clone()).collect()
    }
}

impl RangeToken for OrderByContinuationToken {
    fn range(&self) -> &Range {
        &self.composite_token.range
    }
}
