//! Result formatting per declared output type.
//!
//! Rounding uses banker's rounding (`MidpointNearestEven`) to match the
//! rest of the numeric path.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::types::OutputType;

/// Render a computed scalar per the formula's output type and optional
/// display format string.
pub fn format_value(value: Decimal, output_type: OutputType, display_format: Option<&str>) -> String {
    match output_type {
        OutputType::Percentage => {
            let scaled = value.checked_mul(Decimal::ONE_HUNDRED).unwrap_or(value);
            format!("{}%", scaled.normalize())
        }
        OutputType::Currency => {
            let (sign, magnitude) = split_sign(value);
            format!("{}${}", sign, with_separators(magnitude, Some(2)))
        }
        OutputType::Number => match display_format {
            Some(fmt) => apply_display_format(value, fmt),
            None => value.normalize().to_string(),
        },
        OutputType::Date | OutputType::Text => value.normalize().to_string(),
    }
}

/// Apply a display-format mini-language to a number:
/// `,` requests thousands separators, digits after `.` fix the decimal
/// places, a leading `$` prefixes a currency symbol, and a trailing `%`
/// scales by 100 and appends a percent sign (spreadsheet convention).
fn apply_display_format(value: Decimal, fmt: &str) -> String {
    let dollar = fmt.trim_start().starts_with('$');
    let percent = fmt.trim_end().ends_with('%');
    let grouped = fmt.contains(',');
    // A format with no decimal point fixes zero decimal places; digits
    // after the point fix the width.
    let decimals = match fmt.rfind('.') {
        Some(pos) => Some(
            fmt[pos + 1..]
                .chars()
                .take_while(|c| *c == '0' || *c == '#')
                .count() as u32,
        ),
        None => Some(0),
    };

    let mut value = value;
    if percent {
        value = value.checked_mul(Decimal::ONE_HUNDRED).unwrap_or(value);
    }
    let (sign, magnitude) = split_sign(value);

    let digits = if grouped {
        with_separators(magnitude, decimals)
    } else {
        plain(magnitude, decimals)
    };

    let mut out = String::new();
    out.push_str(sign);
    if dollar {
        out.push('$');
    }
    out.push_str(&digits);
    if percent {
        out.push('%');
    }
    out
}

fn split_sign(value: Decimal) -> (&'static str, Decimal) {
    if value.is_sign_negative() && !value.is_zero() {
        ("-", -value)
    } else {
        ("", value)
    }
}

fn rounded(value: Decimal, decimals: Option<u32>) -> Decimal {
    match decimals {
        Some(n) => value.round_dp_with_strategy(n, RoundingStrategy::MidpointNearestEven),
        None => value.normalize(),
    }
}

fn plain(value: Decimal, decimals: Option<u32>) -> String {
    let value = rounded(value, decimals);
    let s = value.to_string();
    pad_decimals(&s, decimals)
}

/// Insert `,` every three digits of the integer part.
fn with_separators(value: Decimal, decimals: Option<u32>) -> String {
    let s = plain(value, decimals);
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (s.as_str(), None),
    };
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    match frac_part {
        Some(f) => format!("{}.{}", grouped, f),
        None => grouped,
    }
}

/// Pad the fractional part with zeros out to the requested width.
fn pad_decimals(s: &str, decimals: Option<u32>) -> String {
    let n = match decimals {
        Some(n) => n as usize,
        None => return s.to_string(),
    };
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i.to_string(), f.to_string()),
        None => (s.to_string(), String::new()),
    };
    if n == 0 {
        return int_part;
    }
    let mut frac = frac_part;
    while frac.len() < n {
        frac.push('0');
    }
    format!("{}.{}", int_part, frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn percentage_scales_and_suffixes() {
        assert_eq!(format_value(dec("0.4567"), OutputType::Percentage, None), "45.67%");
        assert_eq!(format_value(dec("0.15"), OutputType::Percentage, None), "15%");
        assert_eq!(format_value(dec("1"), OutputType::Percentage, None), "100%");
    }

    #[test]
    fn percentage_round_trips() {
        let original = dec("0.4567");
        let formatted = format_value(original, OutputType::Percentage, None);
        let stripped = formatted.trim_end_matches('%');
        let recovered = stripped.parse::<Decimal>().unwrap() / Decimal::ONE_HUNDRED;
        assert_eq!(recovered, original);
    }

    #[test]
    fn currency_formats_with_separators() {
        assert_eq!(
            format_value(dec("1234567.5"), OutputType::Currency, None),
            "$1,234,567.50"
        );
        assert_eq!(format_value(dec("0"), OutputType::Currency, None), "$0.00");
        assert_eq!(
            format_value(dec("-45.25"), OutputType::Currency, None),
            "-$45.25"
        );
    }

    #[test]
    fn plain_number_normalizes() {
        assert_eq!(format_value(dec("1250.500"), OutputType::Number, None), "1250.5");
        assert_eq!(format_value(dec("45.00"), OutputType::Number, None), "45");
    }

    #[test]
    fn display_format_thousands_and_decimals() {
        assert_eq!(
            format_value(dec("1234567.891"), OutputType::Number, Some("#,##0.00")),
            "1,234,567.89"
        );
        assert_eq!(
            format_value(dec("1234.6"), OutputType::Number, Some("#,###")),
            "1,235"
        );
    }

    #[test]
    fn display_format_dollar_and_percent() {
        assert_eq!(
            format_value(dec("1234.5"), OutputType::Number, Some("$#,##0.00")),
            "$1,234.50"
        );
        assert_eq!(
            format_value(dec("0.125"), OutputType::Number, Some("0.0%")),
            "12.5%"
        );
    }

    #[test]
    fn bankers_rounding_in_formats() {
        assert_eq!(
            format_value(dec("2.5"), OutputType::Number, Some("0")),
            "2"
        );
        assert_eq!(
            format_value(dec("3.5"), OutputType::Number, Some("0")),
            "4"
        );
    }
}
