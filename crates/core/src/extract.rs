//! Field value extraction.
//!
//! `extract` is the single place raw record JSON is turned into a typed
//! [`FieldValue`]: it resolves a (possibly nested) field path inside the
//! record and coerces the raw value per the field's declared type. It is a
//! pure function of its inputs and every downstream component -- filters,
//! grouping, aggregation, breakdowns -- goes through it.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Iso8601;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use crate::schema::FieldType;
use crate::value::FieldValue;

/// One submitted/stored entity: an opaque mapping from field identifiers to
/// raw JSON values. Records are supplied by the data-fetch collaborator and
/// never persisted here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub serde_json::Map<String, Value>);

impl Record {
    /// Build a record from any JSON value. Non-objects yield an empty record.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Record(map),
            _ => Record(serde_json::Map::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }
}

/// Extract the value at `field_id` from `record`, coerced per `field_type`.
///
/// The field id is resolved with dotted/bracketed path traversal, so
/// `items[0].quantity` reaches into nested objects and arrays. A literal
/// key takes precedence over path interpretation. Missing paths and JSON
/// nulls yield [`FieldValue::Null`].
pub fn extract(record: &Record, field_id: &str, field_type: FieldType) -> FieldValue {
    let raw = match lookup_path(record, field_id) {
        Some(v) if !v.is_null() => v,
        _ => return FieldValue::Null,
    };
    coerce(raw, field_type)
}

/// Numeric extraction used by aggregators: nulls and invalid numbers
/// become zero so sums and averages stay well-defined.
pub fn extract_number(record: &Record, field_id: &str) -> Decimal {
    match extract(record, field_id, FieldType::Number) {
        FieldValue::Number(n) => n,
        _ => Decimal::ZERO,
    }
}

/// Raw JSON value at a field path, without coercion. Filters and
/// pipeline stages use this so nested paths work everywhere extraction
/// does.
pub fn raw_value<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    lookup_path(record, path)
}

/// Resolve a dotted/bracketed path inside a record.
fn lookup_path<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    // A literal key wins over path interpretation.
    if let Some(v) = record.get(path) {
        return Some(v);
    }
    if !path.contains('.') && !path.contains('[') {
        return None;
    }

    let mut current: Option<&Value> = None;
    for segment in path.split('.') {
        let (key, indices) = split_indices(segment)?;
        if !key.is_empty() {
            current = match current {
                None => record.get(key),
                Some(Value::Object(map)) => map.get(key),
                _ => return None,
            };
        }
        for idx in indices {
            current = match current {
                Some(Value::Array(items)) => items.get(idx),
                _ => return None,
            };
        }
        current?;
    }
    current
}

/// Split a path segment like `items[0][1]` into its key and indices.
fn split_indices(segment: &str) -> Option<(&str, Vec<usize>)> {
    let open = match segment.find('[') {
        Some(pos) => pos,
        None => return Some((segment, Vec::new())),
    };
    let key = &segment[..open];
    let mut indices = Vec::new();
    let mut rest = &segment[open..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped.find(']')?;
        indices.push(stripped[..close].parse::<usize>().ok()?);
        rest = &stripped[close + 1..];
    }
    if rest.is_empty() {
        Some((key, indices))
    } else {
        None
    }
}

/// Coerce a raw JSON value per the declared field type.
pub fn coerce(raw: &Value, field_type: FieldType) -> FieldValue {
    match field_type {
        FieldType::Number | FieldType::Calculated => {
            FieldValue::Number(coerce_number(raw))
        }
        FieldType::Date => match raw.as_str().and_then(parse_date) {
            Some(d) => FieldValue::Date(d),
            None => FieldValue::Null,
        },
        FieldType::DateTime => match raw.as_str().and_then(parse_datetime) {
            Some(dt) => FieldValue::DateTime(dt),
            None => FieldValue::Null,
        },
        FieldType::Boolean => FieldValue::Bool(coerce_bool(raw)),
        FieldType::Multiselect => match raw {
            Value::Array(items) => {
                FieldValue::List(items.iter().map(stringify).collect())
            }
            other => FieldValue::List(vec![stringify(other)]),
        },
        // Select, radio, text, and everything else stringify.
        _ => FieldValue::Text(stringify(raw)),
    }
}

/// Number coercion: JSON numbers pass through; strings are stripped of
/// non-numeric characters (currency symbols, thousands separators) and
/// parsed. Anything unparseable is 0, never null, so aggregations over
/// dirty data stay well-defined.
fn coerce_number(raw: &Value) -> Decimal {
    match raw {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Decimal::from(i)
            } else if let Some(u) = n.as_u64() {
                Decimal::from(u)
            } else {
                n.as_f64()
                    .and_then(Decimal::from_f64)
                    .unwrap_or(Decimal::ZERO)
            }
        }
        Value::String(s) => parse_loose_number(s).unwrap_or(Decimal::ZERO),
        Value::Bool(true) => Decimal::ONE,
        _ => Decimal::ZERO,
    }
}

/// Parse a number out of free-form text: keeps digits, the decimal point,
/// and a leading minus sign, dropping everything else ("$1,234.50" parses
/// as 1234.50).
pub fn parse_loose_number(s: &str) -> Option<Decimal> {
    let mut cleaned = String::with_capacity(s.len());
    for (i, c) in s.trim().char_indices() {
        if c.is_ascii_digit() || c == '.' || (c == '-' && i == 0) {
            cleaned.push(c);
        }
    }
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    cleaned.parse::<Decimal>().ok()
}

fn coerce_bool(raw: &Value) -> bool {
    match raw {
        Value::Bool(b) => *b,
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            s == "true" || s == "1" || s == "yes"
        }
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

fn stringify(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_date(s: &str) -> Option<Date> {
    let date_only = format_description!("[year]-[month]-[day]");
    if let Ok(d) = Date::parse(s, &date_only) {
        return Some(d);
    }
    parse_datetime(s).map(|dt| dt.date())
}

fn parse_datetime(s: &str) -> Option<OffsetDateTime> {
    if let Ok(dt) = OffsetDateTime::parse(s, &Iso8601::DEFAULT) {
        return Some(dt);
    }
    if let Ok(pdt) = PrimitiveDateTime::parse(s, &Iso8601::DEFAULT) {
        return Some(pdt.assume_utc());
    }
    let date_only = format_description!("[year]-[month]-[day]");
    Date::parse(s, &date_only)
        .ok()
        .map(|d| d.midnight().assume_utc())
}
