//! Runtime value type produced by field extraction.
//!
//! Every value flowing through the engine is a `FieldValue`. Numbers are
//! `rust_decimal::Decimal` -- there is no `f64` arithmetic anywhere in the
//! evaluation path, so aggregation results are exact and never NaN.

use rust_decimal::Decimal;
use std::fmt;
use time::{Date, OffsetDateTime};

/// A typed value extracted from a record field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(Decimal),
    Date(Date),
    DateTime(OffsetDateTime),
    Bool(bool),
    Text(String),
    /// Multiselect values, one string per selected option.
    List(Vec<String>),
    Null,
}

impl FieldValue {
    /// Human-readable type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Number(_) => "Number",
            FieldValue::Date(_) => "Date",
            FieldValue::DateTime(_) => "DateTime",
            FieldValue::Bool(_) => "Bool",
            FieldValue::Text(_) => "Text",
            FieldValue::List(_) => "List",
            FieldValue::Null => "Null",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Numeric view of the value. `Null` and non-numeric text yield `None`;
    /// booleans count as 1/0 so they can participate in aggregations.
    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Bool(true) => Some(Decimal::ONE),
            FieldValue::Bool(false) => Some(Decimal::ZERO),
            _ => None,
        }
    }

    /// String form used as a group key. `None` for null values, which the
    /// grouper routes to its reserved bucket.
    pub fn group_key(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Date(d) => write!(f, "{}", d),
            FieldValue::DateTime(dt) => write!(f, "{}", dt),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::List(items) => write!(f, "{}", items.join(", ")),
            FieldValue::Null => write!(f, ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn number_as_number() {
        let v = FieldValue::Number(Decimal::from_str("12.5").unwrap());
        assert_eq!(v.as_number(), Some(Decimal::from_str("12.5").unwrap()));
    }

    #[test]
    fn bool_as_number() {
        assert_eq!(FieldValue::Bool(true).as_number(), Some(Decimal::ONE));
        assert_eq!(FieldValue::Bool(false).as_number(), Some(Decimal::ZERO));
    }

    #[test]
    fn null_has_no_group_key() {
        assert_eq!(FieldValue::Null.group_key(), None);
        assert_eq!(
            FieldValue::Text("open".to_string()).group_key(),
            Some("open".to_string())
        );
    }

    #[test]
    fn list_display_joins() {
        let v = FieldValue::List(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(v.to_string(), "a, b");
    }
}
