//! tally-eval: formula compilation and execution engine for CRM
//! analytics.
//!
//! Takes a stored [`FormulaDefinition`] and a materialized record set,
//! resolves field references against the tenant's form template,
//! aggregates per-record values, and evaluates the resulting arithmetic
//! with checked decimal math. Pipelines (match/group/project/sort/limit/
//! aggregate) run through the same entry point.
//!
//! # Public API
//!
//! - [`calculate()`] -- evaluate a formula over records, returning value,
//!   formatted string, explanation, and per-field breakdown
//! - [`validate()`] -- structural validation against a synthetic dataset
//! - [`run_pipeline()`] -- direct pipeline entry point
//! - [`evaluate_with_providers()`] -- fetch template and records through
//!   the provider seam, then calculate

pub mod arith;
pub mod explain;
pub mod format;
pub mod normalize;
pub mod pipeline;
pub mod provider;
pub mod types;

use std::fmt;

use rust_decimal::Decimal;
use serde_json::Value;

use tally_core::{apply_filters, Filter, FormTemplate, Record, ReferenceMap};

pub use format::format_value;
pub use normalize::{CompiledExpression, Normalizer};
pub use pipeline::run_pipeline;
pub use provider::{
    ProviderError, RecordProvider, RecordQuery, SchemaProvider, StaticRecordProvider,
    StaticSchemaProvider,
};
pub use types::{
    Aggregation, AggregationSpec, CalcError, EvalOptions, EvaluationResult, FieldBreakdown,
    FormulaDefinition, OutputType, PipelineStage, ProjectField, RawValue, ValidationOutcome,
    VariableMapping,
};

/// Error from the provider-driven entry point: either the fetch failed
/// or the calculation did.
#[derive(Debug)]
pub enum EngineError {
    Provider(ProviderError),
    Calc(CalcError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Provider(e) => write!(f, "{}", e),
            EngineError::Calc(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        EngineError::Provider(e)
    }
}

impl From<CalcError> for EngineError {
    fn from(e: CalcError) -> Self {
        EngineError::Calc(e)
    }
}

/// Evaluate a formula over a record set with default options.
///
/// This is the top-level public API. Optional filters are applied before
/// any aggregation. See [`calculate_with_options`] for the tunable form.
pub fn calculate(
    definition: &FormulaDefinition,
    template: &FormTemplate,
    records: &[Record],
    filters: Option<&[Filter]>,
) -> Result<EvaluationResult, CalcError> {
    calculate_with_options(definition, template, records, filters, &EvalOptions::default())
}

/// Evaluate a formula over a record set.
///
/// Dispatch: a non-empty `pipeline` runs the pipeline executor; otherwise
/// the expression is normalized, compiled, and evaluated. A blank
/// expression with no pipeline is a validation error, never a silent 0.
///
/// The explanation and breakdown are informational; their failure can
/// never invalidate the numeric result.
pub fn calculate_with_options(
    definition: &FormulaDefinition,
    template: &FormTemplate,
    records: &[Record],
    filters: Option<&[Filter]>,
    options: &EvalOptions,
) -> Result<EvaluationResult, CalcError> {
    let filtered: Vec<Record> = match filters {
        Some(f) if !f.is_empty() => apply_filters(records, f),
        _ => records.to_vec(),
    };

    if let Some(stages) = definition.pipeline.as_deref() {
        if !stages.is_empty() {
            return calculate_pipeline(definition, stages, template, &filtered);
        }
    }

    if definition.expression.trim().is_empty() {
        return Err(CalcError::Validation {
            message: "expression is empty".to_string(),
        });
    }

    let refs = ReferenceMap::build(template);
    let normalizer = Normalizer::new(template, &refs, options);
    let canonical = normalizer.normalize(&definition.expression, &definition.variable_mappings)?;
    let referenced = normalizer.referenced_fields(&canonical);
    let compiled = normalizer.compile(&canonical, &filtered)?;

    let value = if compiled.soft_zero {
        Decimal::ZERO
    } else {
        match arith::evaluate(&compiled.text) {
            Ok(v) => v,
            // A runtime division by zero gets the denominator fields the
            // compiler saw, so the error can name the empty input.
            Err(CalcError::DivisionByZero { context: None })
                if !compiled.denominator_fields.is_empty() =>
            {
                return Err(CalcError::DivisionByZero {
                    context: Some(compiled.denominator_fields.join(", ")),
                });
            }
            Err(e) => return Err(e),
        }
    };

    Ok(EvaluationResult {
        raw_value: RawValue::Scalar(value),
        formatted_value: format::format_value(
            value,
            definition.output_type,
            definition.display_format.as_deref(),
        ),
        record_count: filtered.len(),
        explanation: explain::explain_formula(&canonical, &refs),
        breakdown: explain::breakdown(&referenced, template, &refs, &filtered),
    })
}

fn calculate_pipeline(
    definition: &FormulaDefinition,
    stages: &[PipelineStage],
    template: &FormTemplate,
    records: &[Record],
) -> Result<EvaluationResult, CalcError> {
    let rows = pipeline::run_pipeline(stages, records)?;
    let formatted = format_rows(&rows, definition.output_type, definition.display_format.as_deref());
    let refs = ReferenceMap::build(template);
    let fields = pipeline_fields(stages);
    Ok(EvaluationResult {
        formatted_value: formatted,
        record_count: records.len(),
        explanation: explain::explain_pipeline(stages.len(), records.len()),
        breakdown: explain::breakdown(&fields, template, &refs, records),
        raw_value: RawValue::Rows(rows),
    })
}

/// Fields named by group/aggregate stages, for the breakdown.
fn pipeline_fields(stages: &[PipelineStage]) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for stage in stages {
        let aggs = match stage {
            PipelineStage::Group { aggregations, .. } => aggregations,
            PipelineStage::Aggregate { aggregations } => aggregations,
            _ => continue,
        };
        for spec in aggs.values() {
            if !fields.contains(&spec.field) {
                fields.push(spec.field.clone());
            }
        }
    }
    fields
}

/// Render rows with every numeric leaf formatted per the output type.
fn format_rows(rows: &[Record], output_type: OutputType, display_format: Option<&str>) -> String {
    let formatted: Vec<Value> = rows
        .iter()
        .map(|row| {
            let mut out = serde_json::Map::new();
            for (key, value) in &row.0 {
                let rendered = match numeric_leaf(value) {
                    Some(d) => Value::String(format::format_value(d, output_type, display_format)),
                    None => value.clone(),
                };
                out.insert(key.clone(), rendered);
            }
            Value::Object(out)
        })
        .collect();
    serde_json::to_string(&Value::Array(formatted)).unwrap_or_default()
}

fn numeric_leaf(value: &Value) -> Option<Decimal> {
    use rust_decimal::prelude::FromPrimitive;
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else {
                n.as_f64().and_then(Decimal::from_f64)
            }
        }
        _ => None,
    }
}

/// Validate an expression structurally, without real data.
///
/// Normalization and compilation run against a synthetic dataset of one
/// record in which every template field is 1, catching unbalanced
/// parentheses, dangling operators, and unresolvable identifiers.
pub fn validate(expression: &str, template: &FormTemplate) -> ValidationOutcome {
    let options = EvalOptions::default();
    let refs = ReferenceMap::build(template);
    let normalizer = Normalizer::new(template, &refs, &options);

    let mut record = Record::default();
    for field in template.fields() {
        record.insert(&field.id, Value::from(1));
    }
    let records = [record];

    let outcome = normalizer
        .normalize(expression, &[])
        .and_then(|canonical| normalizer.compile(&canonical, &records))
        .and_then(|compiled| {
            if compiled.soft_zero {
                Ok(Decimal::ZERO)
            } else {
                arith::evaluate(&compiled.text)
            }
        });
    match outcome {
        Ok(_) => ValidationOutcome {
            valid: true,
            error: None,
        },
        Err(e) => ValidationOutcome {
            valid: false,
            error: Some(e.to_string()),
        },
    }
}

/// Fetch the template and records through the provider seam, then
/// calculate.
pub async fn evaluate_with_providers(
    schema: &dyn SchemaProvider,
    records: &dyn RecordProvider,
    definition: &FormulaDefinition,
    query: &RecordQuery,
    filters: Option<&[Filter]>,
    options: &EvalOptions,
) -> Result<EvaluationResult, EngineError> {
    let template = schema.form_template(&query.template_id).await?;
    let fetched = records.records(query).await?;
    Ok(calculate_with_options(
        definition, &template, &fetched, filters, options,
    )?)
}

// ──────────────────────────────────────────────
// Integration tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod integration_tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;
    use tally_core::{FieldDescriptor, FieldType};

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn template() -> FormTemplate {
        let field = |id: &str, label: &str, ty: FieldType| FieldDescriptor {
            id: id.to_string(),
            label: label.to_string(),
            field_type: ty,
            calculation_formula: None,
            is_percentage: None,
        };
        FormTemplate::flat(
            "tmpl-deals",
            "Deals",
            vec![
                field("field-revenue", "Revenue", FieldType::Number),
                field("field-qty", "Quantity", FieldType::Number),
                field("field-status", "Status", FieldType::Select),
            ],
        )
    }

    fn records(values: Vec<Value>) -> Vec<Record> {
        values.into_iter().map(Record::from_value).collect()
    }

    #[test]
    fn calculate_sum_with_formatting_and_breakdown() {
        let definition = FormulaDefinition {
            expression: "SUM(Revenue)".to_string(),
            output_type: OutputType::Currency,
            ..Default::default()
        };
        let rs = records(vec![
            json!({ "field-revenue": 1000 }),
            json!({ "field-revenue": 250.5 }),
        ]);
        let result = calculate(&definition, &template(), &rs, None).unwrap();
        assert_eq!(result.raw_value, RawValue::Scalar(dec("1250.5")));
        assert_eq!(result.formatted_value, "$1,250.50");
        assert_eq!(result.record_count, 2);
        assert_eq!(result.explanation, "Total Revenue");
        assert_eq!(result.breakdown.len(), 1);
        assert_eq!(result.breakdown[0].sum, dec("1250.5"));
    }

    #[test]
    fn calculate_applies_filters_before_aggregation() {
        let definition = FormulaDefinition::expression("SUM(Revenue)");
        let rs = records(vec![
            json!({ "field-revenue": 100, "field-status": "closed" }),
            json!({ "field-revenue": 50, "field-status": "open" }),
        ]);
        let filters = vec![Filter {
            field_id: "field-status".to_string(),
            operator: tally_core::FilterOp::Equals,
            value: json!("closed"),
        }];
        let result = calculate(&definition, &template(), &rs, Some(&filters)).unwrap();
        assert_eq!(result.raw_value, RawValue::Scalar(dec("100")));
        assert_eq!(result.record_count, 1);
    }

    #[test]
    fn blank_expression_is_a_validation_error() {
        let definition = FormulaDefinition::expression("   ");
        let result = calculate(&definition, &template(), &[], None);
        assert!(matches!(result, Err(CalcError::Validation { .. })));
    }

    #[test]
    fn pipeline_dispatch_formats_numeric_leaves() {
        let definition = FormulaDefinition {
            pipeline: Some(vec![PipelineStage::Aggregate {
                aggregations: std::collections::BTreeMap::from([(
                    "total".to_string(),
                    AggregationSpec {
                        op: Aggregation::Sum,
                        field: "field-revenue".to_string(),
                    },
                )]),
            }]),
            output_type: OutputType::Currency,
            ..Default::default()
        };
        let rs = records(vec![
            json!({ "field-revenue": 100 }),
            json!({ "field-revenue": 50 }),
        ]);
        let result = calculate(&definition, &template(), &rs, None).unwrap();
        match &result.raw_value {
            RawValue::Rows(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].get("total"), Some(&json!(150)));
            }
            other => panic!("expected rows, got {:?}", other),
        }
        assert!(result.formatted_value.contains("$150.00"));
    }

    #[test]
    fn validate_catches_structural_errors() {
        let t = template();
        assert!(validate("SUM(Revenue) * 0.15", &t).valid);
        assert!(validate("Revenue * Quantity", &t).valid);

        let outcome = validate("SUM(Revenue", &t);
        assert!(!outcome.valid);
        assert!(outcome.error.unwrap().contains("parenthes"));

        let outcome = validate("", &t);
        assert!(!outcome.valid);
    }

    #[tokio::test]
    async fn provider_driven_evaluation() {
        let schema = StaticSchemaProvider::new(vec![template()]);
        let provider = StaticRecordProvider::new(records(vec![
            json!({ "field-revenue": 100 }),
            json!({ "field-revenue": 200 }),
        ]));
        let definition = FormulaDefinition::expression("SUM(Revenue) * 0.15");
        let query = RecordQuery::for_template("tmpl-deals");
        let result =
            evaluate_with_providers(&schema, &provider, &definition, &query, None, &EvalOptions::default())
                .await
                .unwrap();
        assert_eq!(result.raw_value, RawValue::Scalar(dec("45")));
    }

    #[tokio::test]
    async fn provider_unknown_template_propagates() {
        let schema = StaticSchemaProvider::new(vec![]);
        let provider = StaticRecordProvider::empty();
        let definition = FormulaDefinition::expression("1 + 1");
        let query = RecordQuery::for_template("tmpl-ghost");
        let result =
            evaluate_with_providers(&schema, &provider, &definition, &query, None, &EvalOptions::default())
                .await;
        assert!(matches!(result, Err(EngineError::Provider(_))));
    }
}
