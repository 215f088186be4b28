//! Pipeline execution.
//!
//! A pipeline is an ordered list of declarative stages run strictly in
//! sequence over a row-set; the output of each stage is the input of the
//! next. Rows are plain records, so a `match` stage reuses the same
//! filter semantics as the scalar path. Configuration problems (an
//! unknown stage tag, a `group` without a field, an aggregation with no
//! target) abort the whole pipeline -- no partial rows are returned.

use std::cmp::Ordering;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;

use tally_core::{apply_filters, extract_number, group_by, raw_value, FieldType, Record, NULL_GROUP_KEY};

use crate::types::{Aggregation, AggregationSpec, CalcError, PipelineStage};

/// Upper bound on stage count; anything beyond is a configuration error.
const MAX_STAGES: usize = 64;

/// Run a pipeline over a record set.
pub fn run_pipeline(
    stages: &[PipelineStage],
    records: &[Record],
) -> Result<Vec<Record>, CalcError> {
    if stages.len() > MAX_STAGES {
        return Err(CalcError::PipelineConfiguration {
            message: format!(
                "pipeline has {} stages, maximum is {}",
                stages.len(),
                MAX_STAGES
            ),
        });
    }

    let mut rows: Vec<Record> = records.to_vec();
    for stage in stages {
        rows = match stage {
            PipelineStage::Match { filters } => apply_filters(&rows, filters),
            PipelineStage::Group { by, aggregations } => {
                if by.trim().is_empty() {
                    return Err(CalcError::PipelineConfiguration {
                        message: "group stage requires a non-empty 'by' field".to_string(),
                    });
                }
                let mut out = Vec::new();
                for (key, members) in group_by(&rows, by, FieldType::Text) {
                    let mut row = Record::default();
                    let id_value = if key == NULL_GROUP_KEY {
                        Value::Null
                    } else {
                        Value::String(key)
                    };
                    row.insert("_id", id_value);
                    row.insert("count", Value::from(members.len()));
                    for (name, spec) in aggregations {
                        let value = compute_aggregation(spec, &members)?;
                        row.insert(name, decimal_to_json(value));
                    }
                    out.push(row);
                }
                out
            }
            PipelineStage::Project { fields } => {
                if fields.is_empty() {
                    return Err(CalcError::PipelineConfiguration {
                        message: "project stage requires at least one field".to_string(),
                    });
                }
                rows.iter()
                    .map(|row| {
                        let mut projected = Record::default();
                        for pf in fields {
                            let name = pf.alias.as_deref().unwrap_or(&pf.field);
                            let value = raw_value(row, &pf.field).cloned().unwrap_or(Value::Null);
                            projected.insert(name, value);
                        }
                        projected
                    })
                    .collect()
            }
            PipelineStage::Sort { by, descending } => {
                let mut sorted = rows;
                // Vec::sort_by is stable; non-comparable values compare
                // as equal and keep their relative order.
                sorted.sort_by(|a, b| {
                    let ord = compare_values(raw_value(a, by), raw_value(b, by));
                    if *descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
                sorted
            }
            PipelineStage::Limit { n } => {
                let mut limited = rows;
                limited.truncate(*n);
                limited
            }
            PipelineStage::Aggregate { aggregations } => {
                if aggregations.is_empty() {
                    return Err(CalcError::PipelineConfiguration {
                        message: "aggregate stage requires at least one aggregation".to_string(),
                    });
                }
                let mut row = Record::default();
                for (name, spec) in aggregations {
                    let value = compute_aggregation(spec, &rows)?;
                    row.insert(name, decimal_to_json(value));
                }
                vec![row]
            }
        };
    }
    Ok(rows)
}

/// Compute one named aggregation over a row-set.
fn compute_aggregation(spec: &AggregationSpec, rows: &[Record]) -> Result<Decimal, CalcError> {
    if spec.field.trim().is_empty() {
        return Err(CalcError::PipelineConfiguration {
            message: "aggregation requires a non-empty 'field'".to_string(),
        });
    }
    match spec.op {
        Aggregation::None => Err(CalcError::PipelineConfiguration {
            message: format!("aggregation over '{}' has no operator", spec.field),
        }),
        Aggregation::Count => Ok(Decimal::from(rows.len())),
        Aggregation::Distinct => {
            let mut seen: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
            for row in rows {
                match raw_value(row, &spec.field) {
                    None | Some(Value::Null) => {}
                    Some(v) => {
                        seen.insert(string_form(v));
                    }
                }
            }
            Ok(Decimal::from(seen.len()))
        }
        op => {
            let values: Vec<Decimal> = rows
                .iter()
                .map(|r| extract_number(r, &spec.field))
                .collect();
            op.reduce(&values).ok_or_else(|| CalcError::InvalidExpression {
                message: format!("overflow aggregating '{}'", spec.field),
            })
        }
    }
}

fn string_form(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON representation of a decimal: an integer number when exact, a
/// float otherwise, a string when the value does not fit an f64.
fn decimal_to_json(d: Decimal) -> Value {
    let normalized = d.normalize();
    if normalized.fract().is_zero() {
        if let Some(i) = normalized.to_i64() {
            return Value::from(i);
        }
    }
    match normalized.to_f64().and_then(serde_json::Number::from_f64) {
        Some(n) => Value::Number(n),
        None => Value::String(normalized.to_string()),
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => {
            if let (Some(dx), Some(dy)) = (json_number(x), json_number(y)) {
                dx.cmp(&dy)
            } else if let (Value::String(sx), Value::String(sy)) = (x, y) {
                sx.cmp(sy)
            } else {
                Ordering::Equal
            }
        }
        _ => Ordering::Equal,
    }
}

fn json_number(v: &Value) -> Option<Decimal> {
    use rust_decimal::prelude::FromPrimitive;
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else {
                n.as_f64().and_then(Decimal::from_f64)
            }
        }
        Value::String(s) => s.trim().parse::<Decimal>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProjectField;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn records(values: Vec<Value>) -> Vec<Record> {
        values.into_iter().map(Record::from_value).collect()
    }

    fn agg(op: Aggregation, field: &str) -> AggregationSpec {
        AggregationSpec {
            op,
            field: field.to_string(),
        }
    }

    fn sales() -> Vec<Record> {
        records(vec![
            json!({ "region": "east", "revenue": 100, "status": "closed" }),
            json!({ "region": "west", "revenue": 50, "status": "open" }),
            json!({ "region": "east", "revenue": 25, "status": "closed" }),
            json!({ "revenue": 10, "status": "open" }),
        ])
    }

    #[test]
    fn match_then_aggregate() {
        let stages = vec![
            PipelineStage::Match {
                filters: vec![tally_core::Filter {
                    field_id: "status".to_string(),
                    operator: tally_core::FilterOp::Equals,
                    value: json!("closed"),
                }],
            },
            PipelineStage::Aggregate {
                aggregations: BTreeMap::from([(
                    "total".to_string(),
                    agg(Aggregation::Sum, "revenue"),
                )]),
            },
        ];
        let rows = run_pipeline(&stages, &sales()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("total"), Some(&json!(125)));
    }

    #[test]
    fn group_emits_id_count_and_aggregations() {
        let stages = vec![PipelineStage::Group {
            by: "region".to_string(),
            aggregations: BTreeMap::from([
                ("revenue_sum".to_string(), agg(Aggregation::Sum, "revenue")),
                ("revenue_avg".to_string(), agg(Aggregation::Avg, "revenue")),
            ]),
        }];
        let rows = run_pipeline(&stages, &sales()).unwrap();
        assert_eq!(rows.len(), 3);

        let east = rows
            .iter()
            .find(|r| r.get("_id") == Some(&json!("east")))
            .unwrap();
        assert_eq!(east.get("count"), Some(&json!(2)));
        assert_eq!(east.get("revenue_sum"), Some(&json!(125)));
        assert_eq!(east.get("revenue_avg"), Some(&json!(62.5)));

        // The record without a region lands in the null bucket.
        let null_bucket = rows.iter().find(|r| r.get("_id") == Some(&Value::Null));
        assert!(null_bucket.is_some());
    }

    #[test]
    fn sort_project_limit() {
        let stages = vec![
            PipelineStage::Sort {
                by: "revenue".to_string(),
                descending: true,
            },
            PipelineStage::Project {
                fields: vec![
                    ProjectField {
                        field: "revenue".to_string(),
                        alias: Some("amount".to_string()),
                    },
                    ProjectField {
                        field: "region".to_string(),
                        alias: None,
                    },
                ],
            },
            PipelineStage::Limit { n: 2 },
        ];
        let rows = run_pipeline(&stages, &sales()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("amount"), Some(&json!(100)));
        assert_eq!(rows[1].get("amount"), Some(&json!(50)));
        // Projected-away keys are gone; missing sources project to null.
        assert!(rows[0].get("status").is_none());
        assert_eq!(rows[1].get("region"), Some(&json!("west")));
    }

    #[test]
    fn sort_is_stable_for_non_comparable_values() {
        let rows_in = records(vec![
            json!({ "k": {"nested": 1}, "tag": "first" }),
            json!({ "k": {"nested": 2}, "tag": "second" }),
        ]);
        let stages = vec![PipelineStage::Sort {
            by: "k".to_string(),
            descending: false,
        }];
        let rows = run_pipeline(&stages, &rows_in).unwrap();
        assert_eq!(rows[0].get("tag"), Some(&json!("first")));
        assert_eq!(rows[1].get("tag"), Some(&json!("second")));
    }

    #[test]
    fn group_without_by_is_configuration_error() {
        let stages = vec![PipelineStage::Group {
            by: "  ".to_string(),
            aggregations: BTreeMap::new(),
        }];
        assert!(matches!(
            run_pipeline(&stages, &sales()),
            Err(CalcError::PipelineConfiguration { .. })
        ));
    }

    #[test]
    fn aggregation_without_operator_is_configuration_error() {
        let stages = vec![PipelineStage::Aggregate {
            aggregations: BTreeMap::from([(
                "broken".to_string(),
                agg(Aggregation::None, "revenue"),
            )]),
        }];
        assert!(matches!(
            run_pipeline(&stages, &sales()),
            Err(CalcError::PipelineConfiguration { .. })
        ));
    }

    #[test]
    fn distinct_aggregation_counts_unique() {
        let stages = vec![PipelineStage::Aggregate {
            aggregations: BTreeMap::from([(
                "statuses".to_string(),
                agg(Aggregation::Distinct, "status"),
            )]),
        }];
        let rows = run_pipeline(&stages, &sales()).unwrap();
        assert_eq!(rows[0].get("statuses"), Some(&json!(2)));
    }

    #[test]
    fn empty_pipeline_passes_rows_through() {
        let rows = run_pipeline(&[], &sales()).unwrap();
        assert_eq!(rows.len(), 4);
    }
}
