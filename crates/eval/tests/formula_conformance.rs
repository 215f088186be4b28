//! End-to-end conformance tests for the formula engine: the documented
//! evaluation semantics, exercised through the public `calculate` /
//! `run_pipeline` entry points.

use rust_decimal::Decimal;
use serde_json::json;
use std::collections::BTreeMap;
use std::str::FromStr;

use tally_core::{FieldDescriptor, FieldType, Filter, FilterOp, FormTemplate, Record};
use tally_eval::{
    calculate, run_pipeline, Aggregation, AggregationSpec, CalcError, FormulaDefinition,
    OutputType, PipelineStage, RawValue,
};

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn field(id: &str, label: &str, ty: FieldType) -> FieldDescriptor {
    FieldDescriptor {
        id: id.to_string(),
        label: label.to_string(),
        field_type: ty,
        calculation_formula: None,
        is_percentage: None,
    }
}

fn template() -> FormTemplate {
    FormTemplate::flat(
        "tmpl-deals",
        "Deals",
        vec![
            field("field-annualRevenue", "Annual Revenue", FieldType::Number),
            field("revenue", "Revenue", FieldType::Number),
            field("profit", "Profit", FieldType::Number),
            field("price", "Price", FieldType::Number),
            field("qty", "Qty", FieldType::Number),
            field("status", "Status", FieldType::Select),
        ],
    )
}

fn records(values: Vec<serde_json::Value>) -> Vec<Record> {
    values.into_iter().map(Record::from_value).collect()
}

fn scalar(definition: &FormulaDefinition, rs: &[Record]) -> Result<Decimal, CalcError> {
    calculate(definition, &template(), rs, None).map(|r| match r.raw_value {
        RawValue::Scalar(d) => d,
        RawValue::Rows(_) => panic!("expected scalar result"),
    })
}

#[test]
fn scenario_sum_times_rate() {
    // SUM(revenue) * 0.15 over 100 + 200 is 45.
    let rs = records(vec![json!({ "revenue": 100 }), json!({ "revenue": 200 })]);
    let definition = FormulaDefinition::expression("SUM(revenue) * 0.15");
    assert_eq!(scalar(&definition, &rs).unwrap(), dec("45"));
}

#[test]
fn scenario_per_submission_product() {
    // Two raw fields with no aggregation evaluate per record, then sum:
    // 10*2 + 5*3 = 35, not (10+5)*(2+3) = 75.
    let rs = records(vec![
        json!({ "price": 10, "qty": 2 }),
        json!({ "price": 5, "qty": 3 }),
    ]);
    let definition = FormulaDefinition::expression("price * qty");
    assert_eq!(scalar(&definition, &rs).unwrap(), dec("35"));
}

#[test]
fn scenario_division_by_zero_names_the_field() {
    let rs = records(vec![json!({ "revenue": 0 })]);
    let definition = FormulaDefinition::expression("SUM(profit)/SUM(revenue)");
    let result = scalar(&definition, &rs);
    match result {
        Err(CalcError::DivisionByZero { context: Some(ctx) }) => {
            assert!(ctx.contains("Revenue"), "context was {:?}", ctx);
        }
        other => panic!("expected DivisionByZero naming revenue, got {:?}", other),
    }
}

#[test]
fn scenario_label_and_id_are_equivalent() {
    let rs = records(vec![json!({ "field-annualRevenue": 50 })]);
    let by_label = FormulaDefinition::expression("Annual Revenue * 2");
    let by_id = FormulaDefinition::expression("field-annualRevenue * 2");
    assert_eq!(scalar(&by_label, &rs).unwrap(), dec("100"));
    assert_eq!(scalar(&by_id, &rs).unwrap(), dec("100"));
}

#[test]
fn scenario_pipeline_match_then_aggregate() {
    let rs = records(vec![
        json!({ "status": "closed", "revenue": 100 }),
        json!({ "status": "open", "revenue": 50 }),
    ]);
    let stages = vec![
        PipelineStage::Match {
            filters: vec![Filter {
                field_id: "status".to_string(),
                operator: FilterOp::Equals,
                value: json!("closed"),
            }],
        },
        PipelineStage::Aggregate {
            aggregations: BTreeMap::from([(
                "total".to_string(),
                AggregationSpec {
                    op: Aggregation::Sum,
                    field: "revenue".to_string(),
                },
            )]),
        },
    ];
    let rows = run_pipeline(&stages, &rs).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("total"), Some(&json!(100)));
}

#[test]
fn aggregation_matches_manual_arithmetic() {
    let rs = records(vec![
        json!({ "revenue": 12.5 }),
        json!({ "revenue": 0 }),
        json!({ "revenue": "37.5" }),
        json!({ "revenue": null }),
    ]);
    // SUM equals the arithmetic sum of extracted values (null coerces to 0).
    assert_eq!(
        scalar(&FormulaDefinition::expression("SUM(revenue)"), &rs).unwrap(),
        dec("50")
    );
    // AVG equals SUM / COUNT over all records.
    assert_eq!(
        scalar(&FormulaDefinition::expression("AVG(revenue)"), &rs).unwrap(),
        dec("12.5")
    );
    // COUNT equals the record count regardless of values.
    assert_eq!(
        scalar(&FormulaDefinition::expression("COUNT(revenue)"), &rs).unwrap(),
        dec("4")
    );
}

#[test]
fn division_by_zero_never_leaks_non_finite_values() {
    // Every record has qty = 0; the non-critical denominator degrades to
    // a defined 0 result instead of NaN/Infinity or a crash.
    let rs = records(vec![
        json!({ "price": 10, "qty": 0 }),
        json!({ "price": 5, "qty": 0 }),
    ]);
    let definition = FormulaDefinition::expression("SUM(price)/SUM(qty)");
    assert_eq!(scalar(&definition, &rs).unwrap(), Decimal::ZERO);
}

#[test]
fn percentage_output_round_trips() {
    let rs = records(vec![json!({ "profit": 30 }), json!({ "price": 0 })]);
    let definition = FormulaDefinition {
        expression: "SUM(profit) / 120".to_string(),
        output_type: OutputType::Percentage,
        ..Default::default()
    };
    let result = calculate(&definition, &template(), &rs, None).unwrap();
    assert!(result.formatted_value.ends_with('%'));
    let stripped = result.formatted_value.trim_end_matches('%');
    let recovered = stripped.parse::<Decimal>().unwrap() / Decimal::ONE_HUNDRED;
    assert_eq!(RawValue::Scalar(recovered), result.raw_value);
}

#[test]
fn empty_dataset_aggregates_to_zero() {
    let definition = FormulaDefinition::expression("SUM(revenue) * 0.15");
    assert_eq!(scalar(&definition, &[]).unwrap(), Decimal::ZERO);
}

#[test]
fn explanation_is_always_present() {
    let rs = records(vec![json!({ "revenue": 10 })]);
    for expr in [
        "SUM(revenue)",
        "SUM(revenue) * 0.15",
        "price * qty",
        "SUM(revenue) + SUM(profit) - COUNT(revenue)",
    ] {
        let result = calculate(&FormulaDefinition::expression(expr), &template(), &rs, None)
            .unwrap();
        assert!(!result.explanation.is_empty(), "no explanation for {}", expr);
    }
}

#[test]
fn breakdown_failure_cannot_invalidate_result() {
    // A formula whose only reference is unresolvable still produces a
    // numeric result (0 with warnings) and an empty breakdown.
    let rs = records(vec![json!({ "revenue": 10 })]);
    let definition = FormulaDefinition::expression("SUM(Imaginary Field) + 2");
    let result = calculate(&definition, &template(), &rs, None).unwrap();
    assert_eq!(result.raw_value, RawValue::Scalar(dec("2")));
    assert!(result.breakdown.is_empty());
}
