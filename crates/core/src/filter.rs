//! Declarative record filtering and group-by partitioning.
//!
//! Filters combine with AND semantics: a record survives only if every
//! filter passes. Comparison behavior is inferred from the operator --
//! relational operators coerce both sides numerically, `contains` works on
//! string coercion, and the empty checks treat null, missing, and `""` as
//! empty.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extract::{extract, parse_loose_number, raw_value, Record};
use crate::schema::FieldType;

/// Group key used for records whose grouping field is null or missing.
pub const NULL_GROUP_KEY: &str = "__null__";

/// Filter comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,
    NotContains,
    In,
    NotIn,
    IsEmpty,
    IsNotEmpty,
}

/// A single declarative filter predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub field_id: String,
    pub operator: FilterOp,
    /// Comparison operand; unused by the empty checks.
    #[serde(default)]
    pub value: Value,
}

/// Keep the records that satisfy every filter.
pub fn apply_filters(records: &[Record], filters: &[Filter]) -> Vec<Record> {
    records
        .iter()
        .filter(|r| filters.iter().all(|f| matches(r, f)))
        .cloned()
        .collect()
}

/// Partition records by the string form of the extracted field value.
/// Null/missing values land in the reserved [`NULL_GROUP_KEY`] bucket.
pub fn group_by(
    records: &[Record],
    field_id: &str,
    field_type: FieldType,
) -> BTreeMap<String, Vec<Record>> {
    let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for record in records {
        let key = extract(record, field_id, field_type)
            .group_key()
            .unwrap_or_else(|| NULL_GROUP_KEY.to_string());
        groups.entry(key).or_default().push(record.clone());
    }
    groups
}

fn matches(record: &Record, filter: &Filter) -> bool {
    let raw = raw_value(record, &filter.field_id);
    match filter.operator {
        FilterOp::IsEmpty => is_empty(raw),
        FilterOp::IsNotEmpty => !is_empty(raw),
        FilterOp::Equals => loose_eq(raw, &filter.value),
        FilterOp::NotEquals => !loose_eq(raw, &filter.value),
        FilterOp::GreaterThan => numeric_cmp(raw, &filter.value)
            .map(|o| o == std::cmp::Ordering::Greater)
            .unwrap_or(false),
        FilterOp::LessThan => numeric_cmp(raw, &filter.value)
            .map(|o| o == std::cmp::Ordering::Less)
            .unwrap_or(false),
        FilterOp::GreaterThanOrEqual => numeric_cmp(raw, &filter.value)
            .map(|o| o != std::cmp::Ordering::Less)
            .unwrap_or(false),
        FilterOp::LessThanOrEqual => numeric_cmp(raw, &filter.value)
            .map(|o| o != std::cmp::Ordering::Greater)
            .unwrap_or(false),
        FilterOp::Contains => string_form(raw).contains(&string_form(Some(&filter.value))),
        FilterOp::NotContains => !string_form(raw).contains(&string_form(Some(&filter.value))),
        FilterOp::In => in_list(raw, &filter.value),
        FilterOp::NotIn => !in_list(raw, &filter.value),
    }
}

fn is_empty(raw: Option<&Value>) -> bool {
    match raw {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// Equality with numeric tolerance: if both sides parse as strict numbers
/// they compare numerically ("5" equals 5.0), otherwise by string form.
fn loose_eq(raw: Option<&Value>, operand: &Value) -> bool {
    if let (Some(l), Some(r)) = (raw.and_then(strict_number), strict_number(operand)) {
        return l == r;
    }
    string_form(raw) == string_form(Some(operand))
}

fn numeric_cmp(raw: Option<&Value>, operand: &Value) -> Option<std::cmp::Ordering> {
    let left = raw.and_then(coerce_numeric)?;
    let right = coerce_numeric(operand)?;
    Some(left.cmp(&right))
}

/// Strict numeric parse: JSON numbers and fully-numeric strings only.
fn strict_number(raw: &Value) -> Option<Decimal> {
    match raw {
        Value::Number(_) => coerce_numeric(raw),
        Value::String(s) => s.trim().parse::<Decimal>().ok(),
        _ => None,
    }
}

/// Loose numeric coercion for relational operators, matching the
/// extractor's number rule.
fn coerce_numeric(raw: &Value) -> Option<Decimal> {
    match raw {
        Value::Number(n) => {
            use rust_decimal::prelude::FromPrimitive;
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else {
                n.as_f64().and_then(Decimal::from_f64)
            }
        }
        Value::String(s) => parse_loose_number(s),
        Value::Bool(b) => Some(if *b { Decimal::ONE } else { Decimal::ZERO }),
        _ => None,
    }
}

fn string_form(raw: Option<&Value>) -> String {
    match raw {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn in_list(raw: Option<&Value>, operand: &Value) -> bool {
    let candidates: Vec<&Value> = match operand {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    candidates.iter().any(|c| loose_eq(raw, c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(values: Vec<Value>) -> Vec<Record> {
        values.into_iter().map(Record::from_value).collect()
    }

    fn filter(field: &str, op: FilterOp, value: Value) -> Filter {
        Filter {
            field_id: field.to_string(),
            operator: op,
            value,
        }
    }

    #[test]
    fn equals_and_not_equals() {
        let rs = records(vec![
            json!({ "status": "closed" }),
            json!({ "status": "open" }),
        ]);
        let kept = apply_filters(&rs, &[filter("status", FilterOp::Equals, json!("closed"))]);
        assert_eq!(kept.len(), 1);
        let kept = apply_filters(&rs, &[filter("status", FilterOp::NotEquals, json!("closed"))]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].get("status"), Some(&json!("open")));
    }

    #[test]
    fn numeric_equality_across_representations() {
        let rs = records(vec![json!({ "amount": "5" }), json!({ "amount": 7 })]);
        let kept = apply_filters(&rs, &[filter("amount", FilterOp::Equals, json!(5.0))]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn relational_operators_coerce() {
        let rs = records(vec![
            json!({ "amount": "150" }),
            json!({ "amount": 99 }),
            json!({ "amount": "$200.00" }),
        ]);
        let kept = apply_filters(
            &rs,
            &[filter("amount", FilterOp::GreaterThan, json!(100))],
        );
        assert_eq!(kept.len(), 2);
        let kept = apply_filters(
            &rs,
            &[filter("amount", FilterOp::LessThanOrEqual, json!("99"))],
        );
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn filters_are_anded() {
        let rs = records(vec![
            json!({ "status": "closed", "amount": 200 }),
            json!({ "status": "closed", "amount": 50 }),
            json!({ "status": "open", "amount": 300 }),
        ]);
        let kept = apply_filters(
            &rs,
            &[
                filter("status", FilterOp::Equals, json!("closed")),
                filter("amount", FilterOp::GreaterThan, json!(100)),
            ],
        );
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn contains_on_string_coercion() {
        let rs = records(vec![
            json!({ "name": "Acme Corp" }),
            json!({ "name": "Globex" }),
        ]);
        let kept = apply_filters(&rs, &[filter("name", FilterOp::Contains, json!("Acme"))]);
        assert_eq!(kept.len(), 1);
        let kept = apply_filters(&rs, &[filter("name", FilterOp::NotContains, json!("Acme"))]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn in_and_not_in() {
        let rs = records(vec![
            json!({ "stage": "won" }),
            json!({ "stage": "lost" }),
            json!({ "stage": "negotiation" }),
        ]);
        let kept = apply_filters(
            &rs,
            &[filter("stage", FilterOp::In, json!(["won", "lost"]))],
        );
        assert_eq!(kept.len(), 2);
        let kept = apply_filters(
            &rs,
            &[filter("stage", FilterOp::NotIn, json!(["won", "lost"]))],
        );
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn empty_checks() {
        let rs = records(vec![
            json!({ "note": "" }),
            json!({ "note": null }),
            json!({}),
            json!({ "note": "filled" }),
        ]);
        let kept = apply_filters(&rs, &[filter("note", FilterOp::IsEmpty, Value::Null)]);
        assert_eq!(kept.len(), 3);
        let kept = apply_filters(&rs, &[filter("note", FilterOp::IsNotEmpty, Value::Null)]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn filters_resolve_nested_paths() {
        let rs = records(vec![
            json!({ "items": [{ "qty": 5 }] }),
            json!({ "items": [{ "qty": 1 }] }),
        ]);
        let kept = apply_filters(
            &rs,
            &[filter("items[0].qty", FilterOp::GreaterThan, json!(2))],
        );
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn group_by_partitions_with_null_bucket() {
        let rs = records(vec![
            json!({ "region": "east", "v": 1 }),
            json!({ "region": "west", "v": 2 }),
            json!({ "region": "east", "v": 3 }),
            json!({ "v": 4 }),
        ]);
        let groups = group_by(&rs, "region", FieldType::Select);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups["east"].len(), 2);
        assert_eq!(groups["west"].len(), 1);
        assert_eq!(groups[NULL_GROUP_KEY].len(), 1);
    }
}
