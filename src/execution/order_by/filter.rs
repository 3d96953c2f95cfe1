//! Resume filters for order-by queries
//!
//! A resumed order-by query re-runs every partition with a predicate that
//! only admits rows sorting after the last emitted key. For columns
//! `c1..cN` with key `v1..vN` the predicate is the OR over every prefix
//! length `k` of `(c1 = v1 AND .. AND ck > vk)`, with `<` for descending
//! columns. The full-length prefix uses `>=`/`<=` when the filter is
//! inclusive.

use std::cmp::Ordering;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::comparer::compare_sort_keys;
use crate::execution::SortOrder;

/// One sort column of an order-by query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderByColumn {
    /// Expression as written in the query, e.g. `c.name`
    pub expression: String,
    pub sort_order: SortOrder,
}

impl OrderByColumn {
    pub fn new(expression: impl Into<String>, sort_order: SortOrder) -> Self {
        Self {
            expression: expression.into(),
            sort_order,
        }
    }
}

/// Predicate admitting rows that sort after a resume key
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeFilter {
    columns: Vec<OrderByColumn>,
    key: Vec<Option<Value>>,
    inclusive: bool,
}

/// Filters for the ranges left of, at, and right of the resume target
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedFilters {
    pub left: ResumeFilter,
    pub target: ResumeFilter,
    pub right: ResumeFilter,
}

impl ResumeFilter {
    /// Filter admitting rows after `key`, and at `key` too when `inclusive`
    pub fn new(columns: Vec<OrderByColumn>, key: Vec<Option<Value>>, inclusive: bool) -> Self {
        Self { columns, key, inclusive }
    }

    /// Left ranges already emitted the key; the target and right ranges have not
    pub fn formatted(columns: &[OrderByColumn], key: &[Option<Value>]) -> FormattedFilters {
        FormattedFilters {
            left: Self::new(columns.to_vec(), key.to_vec(), false),
            target: Self::new(columns.to_vec(), key.to_vec(), true),
            right: Self::new(columns.to_vec(), key.to_vec(), true),
        }
    }

    pub fn is_inclusive(&self) -> bool {
        self.inclusive
    }

    /// True if a row with sort key `row_key` passes the filter
    pub fn admits(&self, row_key: &[Option<Value>]) -> bool {
        let orders: Vec<SortOrder> = self.columns.iter().map(|c| c.sort_order).collect();
        match compare_sort_keys(row_key, &self.key, &orders) {
            Ordering::Greater => true,
            Ordering::Equal => self.inclusive,
            Ordering::Less => false,
        }
    }

    /// Query text for the filter
    pub fn render(&self) -> String {
        let pairs: Vec<(&OrderByColumn, String)> = self
            .columns
            .iter()
            .zip(self.key.iter())
            .map(|(column, item)| (column, literal(item.as_ref())))
            .collect();

        if pairs.len() == 1 {
            let (column, value) = &pairs[0];
            return format!("{} {} {}", column.expression, self.operator(column.sort_order, true), value);
        }

        let mut out = String::new();
        for prefix in 1..=pairs.len() {
            let last_prefix = prefix == pairs.len();
            out.push('(');
            for (index, (column, value)) in pairs[..prefix].iter().enumerate() {
                let last_item = index == prefix - 1;
                let op = if last_item {
                    self.operator(column.sort_order, last_prefix)
                } else {
                    "="
                };
                let _ = write!(out, "{} {} {} ", column.expression, op, value);
                if !last_item {
                    out.push_str("AND ");
                }
            }
            out.push(')');
            if !last_prefix {
                out.push_str(" OR ");
            }
        }
        out
    }

    fn operator(&self, order: SortOrder, full_prefix: bool) -> &'static str {
        let inclusive = self.inclusive && full_prefix;
        match (order, inclusive) {
            (SortOrder::Ascending, false) => ">",
            (SortOrder::Ascending, true) => ">=",
            (SortOrder::Descending, false) => "<",
            (SortOrder::Descending, true) => "<=",
        }
    }
}

fn literal(item: Option<&Value>) -> String {
    match item {
        Some(value) => value.to_string(),
        None => "undefined".to_string(),
    }
}
