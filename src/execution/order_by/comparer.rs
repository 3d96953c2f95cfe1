//! Sort value ordering
//!
//! Type order: undefined < null < bool < number < string < array < object.
//! Values of the same type compare naturally; arrays element by element,
//! objects by their sorted entries.

use std::cmp::Ordering;

use serde_json::Value;

use crate::execution::SortOrder;

/// Compare two sort values in ascending order; `None` is undefined
pub fn compare_items(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a_val), Some(b_val)) => compare_values(a_val, b_val),
    }
}

fn type_order(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    let by_type = type_order(a).cmp(&type_order(b));
    if by_type != Ordering::Equal {
        return by_type;
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let mut left: Vec<_> = x.iter().collect();
            let mut right: Vec<_> = y.iter().collect();
            left.sort_by(|p, q| p.0.cmp(q.0));
            right.sort_by(|p, q| p.0.cmp(q.0));
            for ((lk, lv), (rk, rv)) in left.iter().zip(right.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            left.len().cmp(&right.len())
        }
        _ => Ordering::Equal,
    }
}

/// Compare two sort tuples column by column, honoring each column's direction
///
/// Tuples shorter than `orders` compare their missing columns as undefined.
pub fn compare_sort_keys(a: &[Option<Value>], b: &[Option<Value>], orders: &[SortOrder]) -> Ordering {
    for (i, order) in orders.iter().enumerate() {
        let left = a.get(i).and_then(|v| v.as_ref());
        let right = b.get(i).and_then(|v| v.as_ref());
        let ord = order.apply(compare_items(left, right));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_order() {
        let null = json!(null);
        let t = json!(true);
        let one = json!(1);
        let s = json!("a");
        assert_eq!(compare_items(None, Some(&null)), Ordering::Less);
        assert_eq!(compare_items(Some(&null), Some(&t)), Ordering::Less);
        assert_eq!(compare_items(Some(&t), Some(&one)), Ordering::Less);
        assert_eq!(compare_items(Some(&one), Some(&s)), Ordering::Less);
        assert_eq!(compare_items(Some(&s), Some(&json!([]))), Ordering::Less);
        assert_eq!(compare_items(Some(&json!([])), Some(&json!({}))), Ordering::Less);
    }

    #[test]
    fn test_numbers_mix_int_and_float() {
        assert_eq!(compare_items(Some(&json!(2)), Some(&json!(2.0))), Ordering::Equal);
        assert_eq!(compare_items(Some(&json!(1.5)), Some(&json!(2))), Ordering::Less);
    }

    #[test]
    fn test_arrays_lexicographic() {
        assert_eq!(compare_items(Some(&json!([1, 2])), Some(&json!([1, 3]))), Ordering::Less);
        assert_eq!(compare_items(Some(&json!([1])), Some(&json!([1, 0]))), Ordering::Less);
    }

    #[test]
    fn test_sort_keys_with_directions() {
        let orders = [SortOrder::Ascending, SortOrder::Descending];
        let a = vec![Some(json!(1)), Some(json!("b"))];
        let b = vec![Some(json!(1)), Some(json!("a"))];
        assert_eq!(compare_sort_keys(&a, &b, &orders), Ordering::Less);
        assert_eq!(compare_sort_keys(&a, &a, &orders), Ordering::Equal);
    }
}
