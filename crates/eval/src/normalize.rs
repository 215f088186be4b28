//! Formula normalization and compilation.
//!
//! Turns a human-authored formula string into a strictly numeric
//! arithmetic expression, in ordered passes:
//!
//! 1. token substitution -- variable names, labels, and id variants are
//!    rewritten to canonical field ids, longest tokens first, with claimed
//!    character ranges so a span is never substituted twice;
//! 2. conditional evaluation -- `IF(cond, a, b)` nested in an aggregation
//!    is evaluated per record, a top-level `IF` once with any-record
//!    truthiness;
//! 3. aggregation expansion -- `SUM/AVG/COUNT/MIN/MAX/DISTINCT` over a
//!    field or a compound per-record sub-expression reduce to a literal;
//! 4. direct-reference dispatch -- one remaining distinct field means
//!    "total across records", two or more mean "evaluate per record and
//!    sum" (per-submission mode);
//! 5. syntactic cleanup and validation of the final arithmetic string.
//!
//! Degradation is deliberate: an unresolvable aggregation target becomes
//! `0` with a recorded warning rather than failing the dashboard, and
//! every substitution loop is capped so no input can cause unbounded
//! rewriting.

use rust_decimal::Decimal;
use tracing::warn;

use tally_core::{extract, extract_number, FieldType, FieldValue, FormTemplate, Record, ReferenceMap};

use crate::arith;
use crate::types::{Aggregation, CalcError, EvalOptions, VariableMapping};

/// Rewrite passes are bounded; hitting the cap yields a best-effort
/// result with a warning instead of looping.
const MAX_REWRITE_PASSES: usize = 16;
/// Upper bound on call expansions within one formula.
const MAX_CALL_EXPANSIONS: usize = 128;

pub(crate) const AGGREGATION_NAMES: [&str; 7] =
    ["SUM", "AVG", "AVERAGE", "COUNT", "MIN", "MAX", "DISTINCT"];

/// Output of compilation: the arithmetic string plus everything the
/// orchestrator needs to interpret failures.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    pub text: String,
    pub warnings: Vec<String>,
    /// Labels of fields whose values fed a denominator, for error context.
    pub denominator_fields: Vec<String>,
    /// Set when an aggregated denominator's contributing values were all
    /// zero on a non-critical field: the result degrades to 0.
    pub soft_zero: bool,
}

/// Formula normalizer bound to one template version.
pub struct Normalizer<'a> {
    template: &'a FormTemplate,
    refs: &'a ReferenceMap,
    options: &'a EvalOptions,
}

impl<'a> Normalizer<'a> {
    pub fn new(template: &'a FormTemplate, refs: &'a ReferenceMap, options: &'a EvalOptions) -> Self {
        Normalizer {
            template,
            refs,
            options,
        }
    }

    // ──────────────────────────────────────────
    // Pass 1: canonicalization
    // ──────────────────────────────────────────

    /// Rewrite every resolvable token to its canonical field id.
    pub fn normalize(
        &self,
        expression: &str,
        mappings: &[VariableMapping],
    ) -> Result<String, CalcError> {
        if expression.trim().is_empty() {
            return Err(CalcError::Validation {
                message: "expression is empty".to_string(),
            });
        }
        let mut text = collapse_whitespace(expression);

        // Variable mappings must point at live fields.
        let mut table: Vec<(String, String)> = Vec::new();
        for mapping in mappings {
            let id = self.refs.resolve(&mapping.field_id).ok_or_else(|| {
                CalcError::FieldResolution {
                    token: mapping.field_id.clone(),
                }
            })?;
            table.push((mapping.variable_name.clone(), id.to_string()));
        }
        for (token, id) in self.refs.scan_tokens() {
            table.push((token.clone(), id.clone()));
        }
        table.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        text = self.join_trailing_words(&text);

        for pass in 0..=MAX_REWRITE_PASSES {
            if pass == MAX_REWRITE_PASSES {
                warn!(expression = %text, "token substitution did not converge; continuing with best effort");
                break;
            }
            let (next, changed) = substitute_tokens(&text, &table);
            text = next;
            if !changed {
                break;
            }
        }
        text = self.apply_fuzzy_fallback(&text);
        Ok(text)
    }

    /// Last-resort resolution for tokens exact matching could not place:
    /// the closest label within edit distance 2, unambiguous only.
    /// Adjacent word pairs are tried before single words so a typo in a
    /// two-word label still matches the whole label.
    fn apply_fuzzy_fallback(&self, text: &str) -> String {
        if !self.options.fuzzy_matching {
            return text.to_string();
        }
        let bytes = text.as_bytes();
        let words = tokenize_words(text);
        let unresolved = |token: &str| {
            !token.chars().all(|c| c.is_ascii_digit() || c == '-')
                && !AGGREGATION_NAMES
                    .iter()
                    .any(|n| token.eq_ignore_ascii_case(n))
                && !token.eq_ignore_ascii_case("IF")
                && self.refs.resolve(token).is_none()
        };
        let quoted = |start: usize, end: usize| {
            (start > 0 && (bytes[start - 1] == b'\'' || bytes[start - 1] == b'"'))
                || (end < bytes.len() && (bytes[end] == b'\'' || bytes[end] == b'"'))
        };

        let mut reps: Vec<Replacement> = Vec::new();
        let mut claimed = vec![false; words.len()];

        for i in 0..words.len().saturating_sub(1) {
            let (start, end, token) = &words[i];
            let (next_start, next_end, next_token) = &words[i + 1];
            if claimed[i] || claimed[i + 1] || quoted(*start, *next_end) {
                continue;
            }
            let gap = &text[*end..*next_start];
            if gap.is_empty() || !gap.chars().all(char::is_whitespace) {
                continue;
            }
            if !unresolved(token) || !unresolved(next_token) {
                continue;
            }
            let joined = format!("{} {}", token, next_token);
            if let Some(id) = self.refs.resolve_fuzzy(&joined) {
                reps.push(Replacement {
                    start: *start,
                    end: *next_end,
                    text: id.to_string(),
                });
                claimed[i] = true;
                claimed[i + 1] = true;
            }
        }

        for (i, (start, end, token)) in words.iter().enumerate() {
            if claimed[i] || quoted(*start, *end) || !unresolved(token) {
                continue;
            }
            if let Some(id) = self.refs.resolve_fuzzy(token) {
                reps.push(Replacement {
                    start: *start,
                    end: *end,
                    text: id.to_string(),
                });
                claimed[i] = true;
            }
        }
        apply_replacements(text, reps)
    }

    /// Join an id token immediately followed by a bare word when the id's
    /// label plus that word names another registered field.
    fn join_trailing_words(&self, text: &str) -> String {
        let words = tokenize_words(text);
        let mut reps: Vec<Replacement> = Vec::new();
        let mut i = 0;
        while i + 1 < words.len() {
            let (start, end, token) = &words[i];
            let (next_start, next_end, next_token) = &words[i + 1];
            // Only adjacent words separated by whitespace qualify.
            let gap = &text[*end..*next_start];
            if !gap.is_empty() && gap.chars().all(char::is_whitespace) {
                if self.refs.resolve(token).is_some() {
                    if let Some(joined) = self.refs.resolve_with_trailing(token, next_token) {
                        let joined = joined.to_string();
                        if Some(joined.as_str()) != self.refs.resolve(token) {
                            reps.push(Replacement {
                                start: *start,
                                end: *next_end,
                                text: joined,
                            });
                            i += 2;
                            continue;
                        }
                    }
                }
            }
            i += 1;
        }
        apply_replacements(text, reps)
    }

    // ──────────────────────────────────────────
    // Passes 2-5: compilation against a record set
    // ──────────────────────────────────────────

    /// Compile a canonical expression against a record set, producing the
    /// final arithmetic string.
    pub fn compile(
        &self,
        canonical: &str,
        records: &[Record],
    ) -> Result<CompiledExpression, CalcError> {
        let mut warnings: Vec<String> = Vec::new();
        let mut denominators: Vec<String> = Vec::new();
        let mut soft_zero = false;

        let mut text = collapse_whitespace(canonical);
        text = self.eval_top_level_ifs(text, records, &mut warnings);
        let before_expansion = text.clone();
        text = self.expand_aggregations(
            text,
            records,
            &mut warnings,
            &mut denominators,
            &mut soft_zero,
        )?;
        let had_aggregates = text != before_expansion;
        text = self.dispatch_direct_refs(
            text,
            records,
            had_aggregates,
            &mut warnings,
            &mut denominators,
            &mut soft_zero,
        )?;
        let text = cleanup(&text)?;

        for w in &warnings {
            warn!(warning = %w, "formula compiled with degradation");
        }

        Ok(CompiledExpression {
            text,
            warnings,
            denominator_fields: denominators,
            soft_zero,
        })
    }

    /// Evaluate `IF` calls that are not enclosed by an aggregation call.
    /// The condition holds if any record satisfies it; the chosen branch
    /// replaces the call and is processed by the later passes.
    fn eval_top_level_ifs(
        &self,
        mut text: String,
        records: &[Record],
        warnings: &mut Vec<String>,
    ) -> String {
        for _ in 0..MAX_CALL_EXPANSIONS {
            let agg_spans = call_spans(&text, &AGGREGATION_NAMES);
            let call = match find_all_calls(&text, &["IF"])
                .into_iter()
                .find(|c| !agg_spans.iter().any(|(s, e)| c.start >= *s && c.end <= *e))
            {
                Some(c) => c,
                None => break,
            };
            let args = split_top_level_args(&text[call.args_start..call.close]);
            let replacement = if args.len() != 3 {
                warnings.push(format!(
                    "IF expects 3 arguments, found {}; substituting 0",
                    args.len()
                ));
                "(0)".to_string()
            } else {
                let holds = match self.condition_over_records(&args[0], records) {
                    Ok(b) => b,
                    Err(why) => {
                        warnings.push(why);
                        false
                    }
                };
                let branch = if holds { &args[1] } else { &args[2] };
                format!("({})", branch.trim())
            };
            text = splice(&text, call.start, call.end, &replacement);
        }
        text
    }

    /// Any-record truthiness for a top-level condition.
    fn condition_over_records(&self, cond: &str, records: &[Record]) -> Result<bool, String> {
        let (lhs, negated, rhs) = parse_condition(cond)?;
        let field_id = match self.refs.resolve(&lhs) {
            Some(id) => id.to_string(),
            None => return Err(format!("condition references unknown field '{}'", lhs)),
        };
        Ok(records
            .iter()
            .any(|r| self.condition_holds(r, &field_id, negated, &rhs)))
    }

    fn condition_holds(&self, record: &Record, field_id: &str, negated: bool, literal: &str) -> bool {
        let field_type = self
            .template
            .field(field_id)
            .map(|f| f.field_type)
            .unwrap_or(FieldType::Text);
        let value = extract(record, field_id, field_type);
        let equal = match (&value, literal.parse::<Decimal>()) {
            (FieldValue::Number(n), Ok(lit)) => *n == lit,
            _ => value.to_string().eq_ignore_ascii_case(literal),
        };
        if negated {
            !equal
        } else {
            equal
        }
    }

    /// Expand aggregation calls to literals.
    fn expand_aggregations(
        &self,
        mut text: String,
        records: &[Record],
        warnings: &mut Vec<String>,
        denominators: &mut Vec<String>,
        soft_zero: &mut bool,
    ) -> Result<String, CalcError> {
        for _ in 0..MAX_CALL_EXPANSIONS {
            let call = match find_call(&text, &AGGREGATION_NAMES) {
                Some(c) => c,
                None => break,
            };
            // from_function_name never fails for names in the scan list
            let op = Aggregation::from_function_name(&call.name)
                .unwrap_or(Aggregation::Sum);
            let inner = text[call.args_start..call.close].trim().to_string();
            let is_denominator = is_denominator_at(&text, call.start);

            let (value, fields) = self.reduce_target(op, &inner, records, warnings);

            if is_denominator {
                let labels: Vec<String> = fields
                    .iter()
                    .map(|id| self.label_or_id(id))
                    .collect();
                denominators.extend(labels.iter().cloned());
                if value.is_zero() && !records.is_empty() {
                    // All contributing values were zero: hard error for
                    // critical fields, soft 0 result otherwise.
                    for id in &fields {
                        if self
                            .options
                            .is_critical_field(id, self.refs.label_of(id))
                        {
                            return Err(CalcError::DivisionByZero {
                                context: Some(self.label_or_id(id)),
                            });
                        }
                    }
                    *soft_zero = true;
                }
            }

            text = splice(&text, call.start, call.end, &format!("({})", value));
        }
        Ok(text)
    }

    /// Reduce one aggregation target. Unresolvable or unparseable targets
    /// reduce to 0 with a warning, never a hard failure.
    fn reduce_target(
        &self,
        op: Aggregation,
        inner: &str,
        records: &[Record],
        warnings: &mut Vec<String>,
    ) -> (Decimal, Vec<String>) {
        // Simple case: the target is a single resolvable field.
        if let Some(id) = self.refs.resolve(inner) {
            let id = id.to_string();
            let value = match op {
                Aggregation::Count => Decimal::from(records.len()),
                Aggregation::Distinct => distinct_count(records, &id, self.field_type_of(&id)),
                _ => {
                    let values = self.field_values(&id, records);
                    op.reduce(&values).unwrap_or_else(|| {
                        warnings.push(format!("overflow reducing '{}'; substituting 0", inner));
                        Decimal::ZERO
                    })
                }
            };
            return (value, vec![id]);
        }

        // Compound case: evaluate the sub-expression once per record.
        let fields = self.fields_in(inner);
        if fields.is_empty() {
            warnings.push(format!(
                "aggregation target '{}' does not reference any known field; substituting 0",
                inner
            ));
            return (Decimal::ZERO, fields);
        }
        if op == Aggregation::Count {
            return (Decimal::from(records.len()), fields);
        }
        let mut per_record: Vec<Decimal> = Vec::with_capacity(records.len());
        let mut degraded = false;
        for record in records {
            match self.per_record_value(inner, record, &fields) {
                Ok(v) => per_record.push(v),
                Err(_) => {
                    degraded = true;
                    per_record.push(Decimal::ZERO);
                }
            }
        }
        if degraded {
            warnings.push(format!(
                "aggregation target '{}' failed to evaluate for some records; those records count as 0",
                inner
            ));
        }
        let value = op.reduce(&per_record).unwrap_or_else(|| {
            warnings.push(format!("overflow reducing '{}'; substituting 0", inner));
            Decimal::ZERO
        });
        (value, fields)
    }

    /// Evaluate a sub-expression against a single record: per-record IF
    /// selection first (conditions see the record's raw values), then
    /// field substitution, then arithmetic.
    fn per_record_value(
        &self,
        expr: &str,
        record: &Record,
        fields: &[String],
    ) -> Result<Decimal, CalcError> {
        let mut text = expr.to_string();
        for _ in 0..MAX_CALL_EXPANSIONS {
            let call = match find_call(&text, &["IF"]) {
                Some(c) => c,
                None => break,
            };
            let args = split_top_level_args(&text[call.args_start..call.close]);
            let replacement = if args.len() != 3 {
                "(0)".to_string()
            } else {
                let holds = match parse_condition(&args[0]) {
                    Ok((lhs, negated, rhs)) => match self.refs.resolve(&lhs) {
                        Some(id) => {
                            let id = id.to_string();
                            self.condition_holds(record, &id, negated, &rhs)
                        }
                        None => false,
                    },
                    Err(_) => false,
                };
                let branch = if holds { &args[1] } else { &args[2] };
                format!("({})", branch.trim())
            };
            text = splice(&text, call.start, call.end, &replacement);
        }

        let table: Vec<(String, String)> = fields
            .iter()
            .map(|id| {
                let value = self.record_value(id, record);
                (id.clone(), format!("({})", value))
            })
            .collect();
        let (text, _) = substitute_tokens(&text, &table);
        arith::evaluate(&text)
    }

    /// Dispatch remaining direct field references by distinct-field count.
    fn dispatch_direct_refs(
        &self,
        text: String,
        records: &[Record],
        had_aggregates: bool,
        warnings: &mut Vec<String>,
        denominators: &mut Vec<String>,
        soft_zero: &mut bool,
    ) -> Result<String, CalcError> {
        let fields = self.fields_in(&text);
        match fields.len() {
            0 => Ok(text),
            1 => {
                // A single direct reference means "total across records".
                let id = &fields[0];
                let total = Aggregation::Sum
                    .reduce(&self.field_values(id, records))
                    .unwrap_or(Decimal::ZERO);
                let occurrences = token_occurrences(&text, id);
                if occurrences
                    .iter()
                    .any(|(start, _)| is_denominator_at(&text, *start))
                {
                    denominators.push(self.label_or_id(id));
                    if total.is_zero() && !records.is_empty() {
                        if self.options.is_critical_field(id, self.refs.label_of(id)) {
                            return Err(CalcError::DivisionByZero {
                                context: Some(self.label_or_id(id)),
                            });
                        }
                        *soft_zero = true;
                    }
                }
                let table = vec![(id.clone(), format!("({})", total))];
                let (out, _) = substitute_tokens(&text, &table);
                Ok(out)
            }
            _ => {
                // Per-submission mode: evaluate once per record, then sum.
                if had_aggregates {
                    warnings.push(
                        "mixed aggregated and direct field references; direct references \
                         evaluate per record"
                            .to_string(),
                    );
                }
                let mut total = Decimal::ZERO;
                let mut degraded = false;
                for record in records {
                    match self.per_record_value(&text, record, &fields) {
                        Ok(v) => {
                            total = total.checked_add(v).ok_or_else(|| {
                                CalcError::InvalidExpression {
                                    message: "overflow summing per-record results".to_string(),
                                }
                            })?;
                        }
                        Err(CalcError::DivisionByZero { .. }) => {
                            degraded = true;
                        }
                        Err(other) => return Err(other),
                    }
                }
                if degraded {
                    warnings.push(
                        "per-record evaluation divided by zero for some records; those \
                         records count as 0"
                            .to_string(),
                    );
                }
                Ok(format!("({})", total))
            }
        }
    }

    // ──────────────────────────────────────────
    // Field helpers
    // ──────────────────────────────────────────

    fn field_type_of(&self, id: &str) -> FieldType {
        self.template
            .field(id)
            .map(|f| f.field_type)
            .unwrap_or(FieldType::Text)
    }

    fn label_or_id(&self, id: &str) -> String {
        self.refs
            .label_of(id)
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string())
    }

    /// Numeric value of a field for one record, with percentage-point
    /// scaling applied per policy.
    fn record_value(&self, id: &str, record: &Record) -> Decimal {
        let value = extract_number(record, id);
        match self.template.field(id) {
            Some(field) if self.options.percentage_policy.is_percentage(field) => {
                value / Decimal::ONE_HUNDRED
            }
            _ => value,
        }
    }

    fn field_values(&self, id: &str, records: &[Record]) -> Vec<Decimal> {
        records.iter().map(|r| self.record_value(id, r)).collect()
    }

    /// Distinct canonical field ids referenced in a text fragment, in
    /// order of first appearance.
    pub fn referenced_fields(&self, text: &str) -> Vec<String> {
        self.fields_in(text)
    }

    fn fields_in(&self, text: &str) -> Vec<String> {
        let mut found: Vec<(usize, String)> = Vec::new();
        for id in self.refs.field_ids() {
            if let Some((start, _)) = token_occurrences(text, id).into_iter().next() {
                found.push((start, id.to_string()));
            }
        }
        found.sort_by_key(|(start, _)| *start);
        found.into_iter().map(|(_, id)| id).collect()
    }
}

// ──────────────────────────────────────────────
// Text scanning machinery
// ──────────────────────────────────────────────

#[derive(Debug)]
struct Replacement {
    start: usize,
    end: usize,
    text: String,
}

#[derive(Debug)]
pub(crate) struct Call {
    pub(crate) name: String,
    pub(crate) start: usize,
    /// Index just past the opening parenthesis.
    pub(crate) args_start: usize,
    /// Index of the matching closing parenthesis.
    pub(crate) close: usize,
    /// Index just past the closing parenthesis.
    pub(crate) end: usize,
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_ws = false;
    for c in s.trim().chars() {
        if c.is_whitespace() {
            if !last_ws {
                out.push(' ');
            }
            last_ws = true;
        } else {
            out.push(c);
            last_ws = false;
        }
    }
    out
}

/// Word tokens (alphanumeric/underscore/hyphen runs) with byte spans.
fn tokenize_words(text: &str) -> Vec<(usize, usize, String)> {
    let bytes = text.as_bytes();
    let mut words = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if is_word_byte(bytes[i]) {
            let start = i;
            while i < bytes.len() && is_word_byte(bytes[i]) {
                i += 1;
            }
            words.push((start, i, text[start..i].to_string()));
        } else {
            i += 1;
        }
    }
    words
}

/// Case-insensitive occurrences of `token` at word boundaries,
/// non-overlapping, left to right.
fn token_occurrences(text: &str, token: &str) -> Vec<(usize, usize)> {
    // Case-insensitive matching is byte-position based and only sound for
    // ASCII; non-ASCII tokens fall back to exact matching.
    let (haystack, needle) = if text.is_ascii() && token.is_ascii() {
        (text.to_lowercase(), token.to_lowercase())
    } else {
        (text.to_string(), token.to_string())
    };
    if needle.is_empty() {
        return Vec::new();
    }
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(&needle) {
        let start = from + pos;
        let end = start + needle.len();
        let boundary_before = start == 0 || !is_word_byte(bytes[start - 1]);
        let boundary_after = end >= bytes.len() || !is_word_byte(bytes[end]);
        if boundary_before && boundary_after {
            out.push((start, end));
            from = end;
        } else {
            from = start + 1;
        }
    }
    out
}

/// Substitute tokens longest-first, claiming character ranges so no span
/// is rewritten twice in one round. Returns the new text and whether
/// anything actually changed.
fn substitute_tokens(text: &str, table: &[(String, String)]) -> (String, bool) {
    let mut claimed: Vec<(usize, usize)> = Vec::new();
    let mut reps: Vec<Replacement> = Vec::new();
    for (token, replacement) in table {
        for (start, end) in token_occurrences(text, token) {
            if claimed.iter().any(|(s, e)| start < *e && end > *s) {
                continue;
            }
            claimed.push((start, end));
            if &text[start..end] != replacement {
                reps.push(Replacement {
                    start,
                    end,
                    text: replacement.clone(),
                });
            }
        }
    }
    let changed = !reps.is_empty();
    (apply_replacements(text, reps), changed)
}

fn apply_replacements(text: &str, mut reps: Vec<Replacement>) -> String {
    if reps.is_empty() {
        return text.to_string();
    }
    reps.sort_by_key(|r| r.start);
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for rep in reps {
        if rep.start < cursor {
            continue;
        }
        out.push_str(&text[cursor..rep.start]);
        out.push_str(&rep.text);
        cursor = rep.end;
    }
    out.push_str(&text[cursor..]);
    out
}

fn splice(text: &str, start: usize, end: usize, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len());
    out.push_str(&text[..start]);
    out.push_str(replacement);
    out.push_str(&text[end..]);
    out
}

/// All function calls among `names` (case-insensitive), left to right,
/// each with its balanced argument span. Calls with unbalanced
/// parentheses are ignored and surface later as validation errors.
pub(crate) fn find_all_calls(text: &str, names: &[&str]) -> Vec<Call> {
    let mut calls = Vec::new();
    for (start, word_end, word) in tokenize_words(text) {
        if !names.iter().any(|n| word.eq_ignore_ascii_case(n)) {
            continue;
        }
        let rest = &text[word_end..];
        let offset = rest.len() - rest.trim_start().len();
        let open = word_end + offset;
        if !text[open..].starts_with('(') {
            continue;
        }
        if let Some(close) = find_balanced_close(text, open) {
            calls.push(Call {
                name: word,
                start,
                args_start: open + 1,
                close,
                end: close + 1,
            });
        }
    }
    calls
}

/// First function call among `names`.
fn find_call(text: &str, names: &[&str]) -> Option<Call> {
    find_all_calls(text, names).into_iter().next()
}

/// Spans `[start, end)` of every call among `names`.
fn call_spans(text: &str, names: &[&str]) -> Vec<(usize, usize)> {
    find_all_calls(text, names)
        .into_iter()
        .map(|c| (c.start, c.end))
        .collect()
}

fn find_balanced_close(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    for (i, b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split an argument list at top-level commas.
fn split_top_level_args(s: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                args.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() || !args.is_empty() {
        args.push(current.trim().to_string());
    }
    args
}

/// Parse an equality condition `lhs = rhs` / `lhs != rhs`. Relational
/// operators are recognized but rejected: their intended record-set
/// semantics are not defined for formulas.
fn parse_condition(cond: &str) -> Result<(String, bool, String), String> {
    for (op, negated) in [("!=", true), ("==", false)] {
        if let Some((lhs, rhs)) = cond.split_once(op) {
            return Ok((lhs.trim().to_string(), negated, unquote(rhs.trim())));
        }
    }
    for op in [">=", "<=", ">", "<"] {
        if cond.contains(op) {
            return Err(format!(
                "relational operator '{}' is not supported in IF conditions; condition treated as false",
                op
            ));
        }
    }
    if let Some((lhs, rhs)) = cond.split_once('=') {
        return Ok((lhs.trim().to_string(), false, unquote(rhs.trim())));
    }
    Err(format!(
        "cannot parse condition '{}'; condition treated as false",
        cond.trim()
    ))
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    for quote in ['\'', '"'] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// Whether the expression position at `start` sits in a denominator:
/// the previous non-whitespace character, looking through opening
/// parentheses, is a division sign.
fn is_denominator_at(text: &str, start: usize) -> bool {
    let mut prefix = text[..start].trim_end();
    while let Some(stripped) = prefix.strip_suffix('(') {
        prefix = stripped.trim_end();
    }
    prefix.ends_with('/')
}

/// Count distinct non-null values of a field across records.
fn distinct_count(records: &[Record], field_id: &str, field_type: FieldType) -> Decimal {
    let mut seen: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for record in records {
        if let Some(key) = extract(record, field_id, field_type).group_key() {
            seen.insert(key);
        }
    }
    Decimal::from(seen.len())
}

/// Pass 5: final syntactic cleanup and validation.
fn cleanup(text: &str) -> Result<String, CalcError> {
    let mut s = collapse_whitespace(text);
    while s.contains("()") {
        s = s.replace("()", "(0)");
    }

    // Strip dangling operators. A leading minus is unary and stays.
    loop {
        let trimmed = s.trim();
        if let Some(rest) = trimmed
            .strip_prefix('+')
            .or_else(|| trimmed.strip_prefix('*'))
            .or_else(|| trimmed.strip_prefix('/'))
        {
            s = rest.to_string();
            continue;
        }
        let stripped = trimmed
            .strip_suffix('+')
            .or_else(|| trimmed.strip_suffix('-'))
            .or_else(|| trimmed.strip_suffix('*'))
            .or_else(|| trimmed.strip_suffix('/'));
        match stripped {
            Some(rest) => s = rest.to_string(),
            None => {
                s = trimmed.to_string();
                break;
            }
        }
    }

    if s.is_empty() {
        return Err(CalcError::Validation {
            message: "expression reduced to nothing".to_string(),
        });
    }

    // Balanced parentheses.
    let mut depth = 0i64;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(CalcError::Validation {
                        message: "unbalanced parentheses".to_string(),
                    });
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(CalcError::Validation {
            message: "unbalanced parentheses".to_string(),
        });
    }

    // Boundary characters: never an operator at either end.
    let first = s.chars().next().unwrap_or(' ');
    let last = s.chars().next_back().unwrap_or(' ');
    let valid_first =
        first.is_ascii_digit() || first == '(' || first == '-' || first == '.' || first.is_alphabetic();
    let valid_last = last.is_ascii_digit() || last == ')' || last == '.' || last.is_alphanumeric();
    if !valid_first || !valid_last {
        return Err(CalcError::Validation {
            message: format!("expression has a dangling operator: '{}'", s),
        });
    }
    Ok(s)
}
