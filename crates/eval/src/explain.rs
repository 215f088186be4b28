//! Human-readable explanations and per-field breakdowns.
//!
//! Both layers are strictly informational: they pattern-match the shape
//! of a compiled formula to describe what was computed, and they must
//! never fail -- any shape they do not recognize gets a generic
//! description, and a breakdown that cannot be computed is simply empty.

use rust_decimal::Decimal;

use tally_core::{extract_number, FormTemplate, Record, ReferenceMap};

use crate::normalize::{find_all_calls, AGGREGATION_NAMES};
use crate::types::{Aggregation, FieldBreakdown};

/// Number of raw values included in a breakdown sample.
const SAMPLE_SIZE: usize = 5;

/// Describe a canonical (id-form) expression in natural language.
///
/// Best effort only: recognized shapes get a specific sentence, anything
/// else a generic one. Never fails.
pub fn explain_formula(canonical: &str, refs: &ReferenceMap) -> String {
    let text = canonical.trim();
    if text.is_empty() {
        return "Custom formula".to_string();
    }

    let calls = find_all_calls(text, &AGGREGATION_NAMES);

    if calls.len() == 1 {
        let call = &calls[0];
        let inner = text[call.args_start..call.close].trim();
        let op = Aggregation::from_function_name(&call.name);
        if let (Some(op), Some(label)) = (op, resolve_label(refs, inner)) {
            // The whole expression is one aggregation call.
            if call.start == 0 && call.end == text.len() {
                return describe_aggregation(op, &label);
            }
            // Aggregation scaled by a constant: SUM(f) * k or k * SUM(f).
            let before = text[..call.start].trim();
            let after = text[call.end..].trim();
            let factor = match (before, after) {
                ("", rest) => rest.strip_prefix('*').map(str::trim),
                (rest, "") => rest.strip_suffix('*').map(str::trim),
                _ => None,
            };
            if let Some(k) = factor.and_then(|f| f.parse::<Decimal>().ok()) {
                if op == Aggregation::Sum && k < Decimal::ONE && k > Decimal::ZERO {
                    let percent = (k * Decimal::ONE_HUNDRED).normalize();
                    return format!("Calculates {}% of total {}", percent, label);
                }
                return format!(
                    "{} multiplied by {}",
                    describe_aggregation(op, &label),
                    k.normalize()
                );
            }
        }
    }

    if calls.len() == 2 {
        let middle = text[calls[0].end..calls[1].start].trim();
        let whole = calls[0].start == 0 && calls[1].end == text.len();
        if whole && middle == "/" {
            let left = resolve_label(refs, text[calls[0].args_start..calls[0].close].trim());
            let right = resolve_label(refs, text[calls[1].args_start..calls[1].close].trim());
            if let (Some(l), Some(r)) = (left, right) {
                return format!("Ratio of total {} to total {}", l, r);
            }
        }
    }

    if calls.is_empty() {
        let fields: Vec<&str> = text
            .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
            .filter(|t| refs.resolve(t).is_some())
            .collect();
        let mut labels: Vec<String> = Vec::new();
        for f in &fields {
            if let Some(label) = resolve_label(refs, f) {
                if !labels.contains(&label) {
                    labels.push(label);
                }
            }
        }
        match labels.len() {
            1 => return format!("Total {}", labels[0]),
            2 if text.contains('*') => {
                return format!("Calculates per submission: {} × {}", labels[0], labels[1]);
            }
            2 if text.contains('/') => {
                return format!("Calculates per submission: {} ÷ {}", labels[0], labels[1]);
            }
            n if n > 0 => {
                return format!("Custom formula over {}", labels.join(", "));
            }
            _ => {}
        }
    }

    "Custom formula".to_string()
}

/// Describe a pipeline run.
pub fn explain_pipeline(stage_count: usize, record_count: usize) -> String {
    format!(
        "Runs a {}-stage pipeline over {} submissions",
        stage_count, record_count
    )
}

fn describe_aggregation(op: Aggregation, label: &str) -> String {
    match op {
        Aggregation::Sum | Aggregation::None => format!("Total {}", label),
        Aggregation::Avg => format!("Average {}", label),
        Aggregation::Count => "Number of submissions".to_string(),
        Aggregation::Min => format!("Lowest {}", label),
        Aggregation::Max => format!("Highest {}", label),
        Aggregation::Distinct => format!("Number of distinct {} values", label),
    }
}

fn resolve_label(refs: &ReferenceMap, token: &str) -> Option<String> {
    let id = refs.resolve(token)?;
    Some(
        refs.label_of(id)
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string()),
    )
}

/// Per-field statistics for the referenced fields. Computed independently
/// of the main result; any field that cannot be summarized is skipped.
pub fn breakdown(
    field_ids: &[String],
    template: &FormTemplate,
    refs: &ReferenceMap,
    records: &[Record],
) -> Vec<FieldBreakdown> {
    field_ids
        .iter()
        .filter(|id| template.field(id).is_some())
        .map(|id| {
            let values: Vec<Decimal> = records.iter().map(|r| extract_number(r, id)).collect();
            let sum = Aggregation::Sum.reduce(&values).unwrap_or(Decimal::ZERO);
            let avg = Aggregation::Avg.reduce(&values).unwrap_or(Decimal::ZERO);
            FieldBreakdown {
                field_id: id.clone(),
                label: refs
                    .label_of(id)
                    .map(str::to_string)
                    .unwrap_or_else(|| id.clone()),
                sum,
                avg,
                non_zero_count: values.iter().filter(|v| !v.is_zero()).count(),
                sample: values.into_iter().take(SAMPLE_SIZE).collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;
    use tally_core::{FieldDescriptor, FieldType};

    fn template() -> FormTemplate {
        let field = |id: &str, label: &str| FieldDescriptor {
            id: id.to_string(),
            label: label.to_string(),
            field_type: FieldType::Number,
            calculation_formula: None,
            is_percentage: None,
        };
        FormTemplate::flat(
            "tmpl",
            "Deals",
            vec![
                field("field-revenue", "Revenue"),
                field("field-cost", "Cost"),
                field("field-price", "Unit Price"),
                field("field-qty", "Quantity"),
            ],
        )
    }

    #[test]
    fn describes_simple_aggregations() {
        let t = template();
        let refs = ReferenceMap::build(&t);
        assert_eq!(explain_formula("SUM(field-revenue)", &refs), "Total Revenue");
        assert_eq!(explain_formula("AVG(field-cost)", &refs), "Average Cost");
        assert_eq!(
            explain_formula("COUNT(field-revenue)", &refs),
            "Number of submissions"
        );
        assert_eq!(explain_formula("MAX(field-revenue)", &refs), "Highest Revenue");
    }

    #[test]
    fn describes_percentage_of_total() {
        let t = template();
        let refs = ReferenceMap::build(&t);
        assert_eq!(
            explain_formula("SUM(field-revenue) * 0.15", &refs),
            "Calculates 15% of total Revenue"
        );
    }

    #[test]
    fn describes_ratio() {
        let t = template();
        let refs = ReferenceMap::build(&t);
        assert_eq!(
            explain_formula("SUM(field-cost) / SUM(field-revenue)", &refs),
            "Ratio of total Cost to total Revenue"
        );
    }

    #[test]
    fn describes_per_submission_product() {
        let t = template();
        let refs = ReferenceMap::build(&t);
        assert_eq!(
            explain_formula("field-price * field-qty", &refs),
            "Calculates per submission: Unit Price × Quantity"
        );
    }

    #[test]
    fn unknown_shapes_fall_back() {
        let t = template();
        let refs = ReferenceMap::build(&t);
        let text = "SUM(field-revenue) + SUM(field-cost) - 3";
        assert_eq!(explain_formula(text, &refs), "Custom formula");
        assert_eq!(explain_formula("", &refs), "Custom formula");
    }

    #[test]
    fn breakdown_summarizes_fields() {
        let t = template();
        let refs = ReferenceMap::build(&t);
        let records: Vec<Record> = vec![
            json!({ "field-revenue": 100, "field-cost": 0 }),
            json!({ "field-revenue": 50, "field-cost": 30 }),
        ]
        .into_iter()
        .map(Record::from_value)
        .collect();
        let out = breakdown(
            &["field-revenue".to_string(), "field-cost".to_string()],
            &t,
            &refs,
            &records,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].label, "Revenue");
        assert_eq!(out[0].sum, Decimal::from_str("150").unwrap());
        assert_eq!(out[0].avg, Decimal::from_str("75").unwrap());
        assert_eq!(out[0].non_zero_count, 2);
        assert_eq!(out[1].non_zero_count, 1);
        assert_eq!(out[0].sample.len(), 2);
    }

    #[test]
    fn breakdown_skips_unknown_fields() {
        let t = template();
        let refs = ReferenceMap::build(&t);
        let out = breakdown(&["field-ghost".to_string()], &t, &refs, &[]);
        assert!(out.is_empty());
    }
}
