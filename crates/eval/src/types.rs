//! Formula, pipeline, and result types for the Tally evaluator.
//!
//! These are the boundary types callers construct (usually by
//! deserializing stored formula definitions) and the typed errors the
//! engine reports. Numeric payloads are `rust_decimal::Decimal`
//! throughout.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_core::{FieldType, Filter, PercentagePolicy, Record};

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

/// Errors surfaced by formula compilation and evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalcError {
    /// Empty/blank formula, unbalanced parentheses, or a dangling operator.
    Validation { message: String },
    /// A token could not be mapped to any known field and survived into
    /// the final arithmetic string.
    FieldResolution { token: String },
    /// A denominator is zero. `context` names the contributing field when
    /// derivable so the dashboard can say which input was empty.
    DivisionByZero { context: Option<String> },
    /// Evaluation produced no usable number (overflow or malformed input).
    InvalidExpression { message: String },
    /// Unknown pipeline stage tag or missing stage parameter.
    PipelineConfiguration { message: String },
}

impl fmt::Display for CalcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalcError::Validation { message } => {
                write!(f, "invalid formula: {}", message)
            }
            CalcError::FieldResolution { token } => {
                write!(f, "unresolved field reference: '{}'", token)
            }
            CalcError::DivisionByZero { context: Some(field) } => {
                write!(f, "division by zero: '{}' has no non-zero values", field)
            }
            CalcError::DivisionByZero { context: None } => {
                write!(f, "division by zero")
            }
            CalcError::InvalidExpression { message } => {
                write!(f, "invalid expression result: {}", message)
            }
            CalcError::PipelineConfiguration { message } => {
                write!(f, "pipeline configuration error: {}", message)
            }
        }
    }
}

impl std::error::Error for CalcError {}

// ──────────────────────────────────────────────
// Aggregation
// ──────────────────────────────────────────────

/// Reduction operator applied across per-record values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aggregation {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    Distinct,
    None,
}

impl Default for Aggregation {
    fn default() -> Self {
        Aggregation::None
    }
}

impl Aggregation {
    /// Function name as written in formulas, if this is a real reduction.
    pub fn function_name(self) -> Option<&'static str> {
        match self {
            Aggregation::Sum => Some("SUM"),
            Aggregation::Avg => Some("AVG"),
            Aggregation::Count => Some("COUNT"),
            Aggregation::Min => Some("MIN"),
            Aggregation::Max => Some("MAX"),
            Aggregation::Distinct => Some("DISTINCT"),
            Aggregation::None => None,
        }
    }

    /// Parse a formula function name.
    pub fn from_function_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "SUM" => Some(Aggregation::Sum),
            "AVG" | "AVERAGE" => Some(Aggregation::Avg),
            "COUNT" => Some(Aggregation::Count),
            "MIN" => Some(Aggregation::Min),
            "MAX" => Some(Aggregation::Max),
            "DISTINCT" => Some(Aggregation::Distinct),
            _ => None,
        }
    }

    /// Reduce per-record values. Empty inputs reduce to zero so dashboards
    /// over empty date ranges render 0 rather than erroring. Returns `None`
    /// only on arithmetic overflow.
    pub fn reduce(self, values: &[Decimal]) -> Option<Decimal> {
        match self {
            Aggregation::Sum | Aggregation::None => {
                let mut acc = Decimal::ZERO;
                for v in values {
                    acc = acc.checked_add(*v)?;
                }
                Some(acc)
            }
            Aggregation::Avg => {
                if values.is_empty() {
                    return Some(Decimal::ZERO);
                }
                let sum = Aggregation::Sum.reduce(values)?;
                sum.checked_div(Decimal::from(values.len()))
            }
            Aggregation::Count => Some(Decimal::from(values.len())),
            Aggregation::Min => Some(values.iter().min().copied().unwrap_or(Decimal::ZERO)),
            Aggregation::Max => Some(values.iter().max().copied().unwrap_or(Decimal::ZERO)),
            Aggregation::Distinct => {
                let mut seen: BTreeSet<Decimal> = BTreeSet::new();
                for v in values {
                    seen.insert(v.normalize());
                }
                Some(Decimal::from(seen.len()))
            }
        }
    }
}

// ──────────────────────────────────────────────
// Formula definition
// ──────────────────────────────────────────────

/// Links a formula-local variable name to a concrete field and an
/// aggregation mode. Created when the formula is authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableMapping {
    pub variable_name: String,
    pub field_id: String,
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub aggregation: Aggregation,
}

fn default_field_type() -> FieldType {
    FieldType::Number
}

/// How the final scalar is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Number,
    Percentage,
    Currency,
    Date,
    Text,
}

impl Default for OutputType {
    fn default() -> Self {
        OutputType::Number
    }
}

/// A stored metric formula. Either `expression` or `pipeline` drives
/// execution -- never both in the same call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaDefinition {
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub variable_mappings: Vec<VariableMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<PipelineStage>>,
    #[serde(default)]
    pub output_type: OutputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_format: Option<String>,
}

impl FormulaDefinition {
    /// Scalar-expression formula with no variable mappings.
    pub fn expression(expr: &str) -> Self {
        FormulaDefinition {
            expression: expr.to_string(),
            ..Default::default()
        }
    }
}

// ──────────────────────────────────────────────
// Pipeline stages
// ──────────────────────────────────────────────

/// Named aggregation computed by a `group` or `aggregate` stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    #[serde(rename = "type")]
    pub op: Aggregation,
    pub field: String,
}

/// One projected output column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectField {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// A declarative pipeline stage. Stages execute strictly in order; the
/// output row-set of each stage is the input of the next. Unknown stage
/// tags fail deserialization, which the executor reports as a
/// configuration error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum PipelineStage {
    Match {
        #[serde(default)]
        filters: Vec<Filter>,
    },
    Group {
        by: String,
        #[serde(default)]
        aggregations: BTreeMap<String, AggregationSpec>,
    },
    Project {
        fields: Vec<ProjectField>,
    },
    Sort {
        by: String,
        #[serde(default)]
        descending: bool,
    },
    Limit {
        n: usize,
    },
    Aggregate {
        aggregations: BTreeMap<String, AggregationSpec>,
    },
}

// ──────────────────────────────────────────────
// Results
// ──────────────────────────────────────────────

/// The raw computed value: a scalar for standard formulas, rows for
/// pipelines.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawValue {
    Scalar(Decimal),
    Rows(Vec<Record>),
}

impl RawValue {
    pub fn as_scalar(&self) -> Option<Decimal> {
        match self {
            RawValue::Scalar(d) => Some(*d),
            RawValue::Rows(_) => None,
        }
    }
}

/// Informational per-field statistics attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldBreakdown {
    pub field_id: String,
    pub label: String,
    pub sum: Decimal,
    pub avg: Decimal,
    pub non_zero_count: usize,
    /// First few raw values, for spot-checking.
    pub sample: Vec<Decimal>,
}

/// Everything a caller gets back from one evaluation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub raw_value: RawValue,
    pub formatted_value: String,
    pub record_count: usize,
    pub explanation: String,
    pub breakdown: Vec<FieldBreakdown>,
}

/// Outcome of structural validation of an expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ──────────────────────────────────────────────
// Options
// ──────────────────────────────────────────────

/// Tunable evaluation behavior. The defaults match production behavior;
/// tests and migrations can tighten or loosen individual knobs.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Which fields hold percentage-point values (divided by 100 on entry).
    pub percentage_policy: PercentagePolicy,
    /// Whether unresolved tokens may fall back to fuzzy label matching.
    pub fuzzy_matching: bool,
    /// Field ids whose all-zero denominators are hard errors instead of a
    /// soft 0 result.
    pub critical_fields: BTreeSet<String>,
    /// Labels containing any of these keywords are also treated as
    /// critical denominators.
    pub critical_label_keywords: Vec<String>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            percentage_policy: PercentagePolicy::default(),
            fuzzy_matching: true,
            critical_fields: BTreeSet::new(),
            critical_label_keywords: vec!["revenue".to_string()],
        }
    }
}

impl EvalOptions {
    /// Whether an all-zero denominator on this field must fail hard.
    pub fn is_critical_field(&self, field_id: &str, label: Option<&str>) -> bool {
        if self.critical_fields.contains(field_id) {
            return true;
        }
        if let Some(label) = label {
            let label = label.to_lowercase();
            return self
                .critical_label_keywords
                .iter()
                .any(|k| label.contains(k.as_str()));
        }
        false
    }
}
