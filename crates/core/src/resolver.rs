//! Field reference resolution.
//!
//! Formula authors (and the AI assist that drafts formulas for them) are
//! inconsistent about how they name fields: the same logical field shows up
//! as a raw identifier (`field-annualRevenue`), an identifier without the
//! namespace prefix (`annualRevenue`), or a free-text label in any casing
//! ("Annual Revenue", "annual revenue", "Annual_Revenue"). The
//! `ReferenceMap` is built once per template version and maps every variant
//! a producer might emit back to the one canonical field id.
//!
//! Registration rules:
//! - the raw id always resolves to itself;
//! - prefix-stripped/prefix-added id variants are registered only while
//!   unclaimed, so a bare token never silently shadows a real field id;
//! - label variants (verbatim, lower, title-case, underscored) are
//!   registered first-come, mirroring section order in the template.

use std::collections::{BTreeMap, BTreeSet};

use crate::schema::FormTemplate;

/// Conventional namespace prefix carried by form field identifiers.
pub const FIELD_PREFIX: &str = "field-";

/// Maximum edit distance accepted by fuzzy label resolution.
const FUZZY_DISTANCE: usize = 2;

/// Bidirectional token/label/id mapping for one template version.
///
/// Immutable after construction; share behind an `Arc` to reuse across
/// evaluation calls.
#[derive(Debug, Clone)]
pub struct ReferenceMap {
    /// Registered token (exact form) to canonical field id.
    tokens: BTreeMap<String, String>,
    /// Canonical field ids.
    ids: BTreeSet<String>,
    /// Canonical field id to its label.
    labels: BTreeMap<String, String>,
    /// Tokens eligible for in-text scanning, longest first.
    scan_order: Vec<(String, String)>,
}

impl ReferenceMap {
    /// Build the reference map from a form template.
    pub fn build(template: &FormTemplate) -> Self {
        let mut tokens: BTreeMap<String, String> = BTreeMap::new();
        let mut ids = BTreeSet::new();
        let mut labels = BTreeMap::new();

        // Exact ids first: they are unique and always win over variants.
        for field in template.fields() {
            tokens.insert(field.id.clone(), field.id.clone());
            ids.insert(field.id.clone());
            labels.insert(field.id.clone(), field.label.clone());
        }

        // Prefix variants, registered only while unclaimed. If a bare token
        // is also a real field id the exact registration above keeps it.
        for field in template.fields() {
            let variant = match field.id.strip_prefix(FIELD_PREFIX) {
                Some(bare) => bare.to_string(),
                None => format!("{}{}", FIELD_PREFIX, field.id),
            };
            tokens.entry(variant).or_insert_with(|| field.id.clone());
        }

        // Label variants, first field with a given label wins.
        for field in template.fields() {
            for variant in label_variants(&field.label) {
                tokens.entry(variant).or_insert_with(|| field.id.clone());
            }
        }

        let scan_order = build_scan_order(&tokens, &labels);

        ReferenceMap {
            tokens,
            ids,
            labels,
            scan_order,
        }
    }

    /// Resolve a single token to a canonical field id.
    ///
    /// Tries an exact map lookup, then the opposite prefix convention
    /// against known ids.
    pub fn resolve(&self, token: &str) -> Option<&str> {
        if let Some(id) = self.tokens.get(token) {
            return Some(id.as_str());
        }
        if let Some(bare) = token.strip_prefix(FIELD_PREFIX) {
            if self.ids.contains(bare) {
                return self.tokens.get(bare).map(String::as_str);
            }
        }
        let prefixed = format!("{}{}", FIELD_PREFIX, token);
        if self.ids.contains(&prefixed) {
            return self.tokens.get(&prefixed).map(String::as_str);
        }
        None
    }

    /// Fuzzy fallback: the closest label within edit distance 2, accepted
    /// only when a single label is closest. Ties are rejected so a typo
    /// never silently picks between two plausible fields.
    pub fn resolve_fuzzy(&self, token: &str) -> Option<&str> {
        let needle = token.to_lowercase();
        let mut best: Option<(usize, &str)> = None;
        let mut tied = false;
        for (id, label) in &self.labels {
            let d = edit_distance(&needle, &label.to_lowercase());
            if d > FUZZY_DISTANCE {
                continue;
            }
            match best {
                Some((bd, _)) if d < bd => {
                    best = Some((d, id.as_str()));
                    tied = false;
                }
                Some((bd, bid)) if d == bd && bid != id.as_str() => tied = true,
                None => best = Some((d, id.as_str())),
                _ => {}
            }
        }
        match (best, tied) {
            (Some((_, id)), false) => Some(id),
            _ => None,
        }
    }

    /// Resolve an id token immediately followed by a bare word.
    ///
    /// Formula producers sometimes emit a partial identifier followed by a
    /// fragment of the intended label ("field-profit Ratio" for the field
    /// labeled "Profit Ratio"). If the concatenation of the id's label and
    /// the trailing word matches a registered label, the whole sequence
    /// resolves to that label's field instead of the bare id.
    pub fn resolve_with_trailing(&self, id_token: &str, trailing: &str) -> Option<&str> {
        let id = self.resolve(id_token)?;
        let label = self.labels.get(id)?;
        let candidate = format!("{} {}", label, trailing);
        match self.tokens.get(&candidate) {
            Some(id) => Some(id.as_str()),
            None => self.tokens.get(&candidate.to_lowercase()).map(String::as_str),
        }
    }

    /// Label of a canonical field id.
    pub fn label_of(&self, id: &str) -> Option<&str> {
        self.labels.get(id).map(String::as_str)
    }

    /// Whether a token is a canonical field id.
    pub fn is_field_id(&self, token: &str) -> bool {
        self.ids.contains(token)
    }

    /// All canonical field ids.
    pub fn field_ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Tokens eligible for scanning formula text, longest first, with
    /// single-word tokens that are substrings of longer labels excluded.
    pub fn scan_tokens(&self) -> &[(String, String)] {
        &self.scan_order
    }
}

/// Casing/spacing variants a producer might use for a label.
fn label_variants(label: &str) -> Vec<String> {
    let underscored: String = label.split_whitespace().collect::<Vec<_>>().join("_");
    vec![
        label.to_string(),
        label.to_lowercase(),
        title_case(label),
        underscored.clone(),
        underscored.to_lowercase(),
    ]
}

/// Order tokens for in-text scanning: longest first so "Total Profit" is
/// tried before "Profit", and single-word tokens that appear inside any
/// longer registered label are dropped entirely to prevent partial hits.
fn build_scan_order(
    tokens: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let lowered_labels: Vec<String> = labels.values().map(|l| l.to_lowercase()).collect();
    let mut order: Vec<(String, String)> = tokens
        .iter()
        .filter(|(token, _)| {
            let single_word = !token.contains(char::is_whitespace) && !token.contains('_');
            if !single_word || token.starts_with(FIELD_PREFIX) {
                return true;
            }
            let needle = token.to_lowercase();
            !lowered_labels
                .iter()
                .any(|l| l.len() > needle.len() && l.contains(needle.as_str()))
        })
        .map(|(t, id)| (t.clone(), id.clone()))
        .collect();
    order.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
    order
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Two-row Levenshtein distance.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
