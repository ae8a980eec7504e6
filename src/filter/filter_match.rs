//! In-process evaluation of a parsed WHERE tree, with SQL null semantics:
//! comparisons against a missing or null field are false.

use serde_json::{Map, Value};
use std::cmp::Ordering;

use super::types::{FilterOp, FilterWhereInfo, WhereNode};

impl WhereNode {
    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        match self {
            WhereNode::And(children) => children.iter().all(|c| c.matches(row)),
            WhereNode::Or(children) => children.iter().any(|c| c.matches(row)),
            WhereNode::Not(child) => !child.matches(row),
            WhereNode::Condition(condition) => condition_matches(condition, row),
        }
    }
}

fn condition_matches(condition: &FilterWhereInfo, row: &Map<String, Value>) -> bool {
    let field = row.get(&condition.column).unwrap_or(&Value::Null);
    let data = &condition.data;

    match condition.operator {
        FilterOp::Eq if data.is_null() => field.is_null(),
        FilterOp::Ne if data.is_null() => !field.is_null(),
        _ if field.is_null() => false,
        FilterOp::Eq => compare(field, data) == Some(Ordering::Equal),
        FilterOp::Ne => matches!(compare(field, data), Some(Ordering::Less | Ordering::Greater)),
        FilterOp::Gt => compare(field, data) == Some(Ordering::Greater),
        FilterOp::Gte => matches!(compare(field, data), Some(Ordering::Greater | Ordering::Equal)),
        FilterOp::Lt => compare(field, data) == Some(Ordering::Less),
        FilterOp::Lte => matches!(compare(field, data), Some(Ordering::Less | Ordering::Equal)),
        FilterOp::Like | FilterOp::ILike => match (field.as_str(), data.as_str()) {
            (Some(text), Some(pattern)) => {
                if matches!(condition.operator, FilterOp::ILike) {
                    like(&text.to_lowercase(), &pattern.to_lowercase())
                } else {
                    like(text, pattern)
                }
            }
            _ => false,
        },
        FilterOp::In => data
            .as_array()
            .map(|values| values.iter().any(|v| compare(field, v) == Some(Ordering::Equal)))
            .unwrap_or(false),
        FilterOp::NIn => data
            .as_array()
            .map(|values| {
                values.iter().all(|v| matches!(compare(field, v), Some(Ordering::Less | Ordering::Greater)))
            })
            .unwrap_or(false),
        FilterOp::Between => match data.as_array().map(Vec::as_slice) {
            Some([low, high]) => {
                matches!(compare(field, low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(compare(field, high), Some(Ordering::Less | Ordering::Equal))
            }
            _ => false,
        },
    }
}

/// Ordering between two JSON scalars of the same kind.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL `LIKE`: `%` any run, `_` one char, `\` escapes.
pub fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    like_at(&text, &pattern)
}

fn like_at(text: &[char], pattern: &[char]) -> bool {
    let Some((&head, rest)) = pattern.split_first() else {
        return text.is_empty();
    };
    match head {
        '%' => (0..=text.len()).any(|i| like_at(&text[i..], rest)),
        '_' => !text.is_empty() && like_at(&text[1..], rest),
        '\\' if !rest.is_empty() => text.first() == Some(&rest[0]) && like_at(&text[1..], &rest[1..]),
        c => text.first() == Some(&c) && like_at(&text[1..], rest),
    }
}
