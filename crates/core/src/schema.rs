//! Form template schema model.
//!
//! A `FormTemplate` describes the fields a tenant's form collects: each field
//! has an opaque stable identifier, a human-readable label, and a declared
//! type. Templates are owned by the schema collaborator and are read-only
//! input here; the engine builds its reference map from them and uses the
//! declared types to coerce record values.

use serde::{Deserialize, Serialize};

/// Declared type of a form field.
///
/// Unrecognized type strings deserialize to [`FieldType::Unknown`] and are
/// treated as text, so a template authored against a newer field catalog
/// still loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Number,
    Date,
    DateTime,
    Boolean,
    Text,
    Select,
    Radio,
    Multiselect,
    Calculated,
    Email,
    Phone,
    Url,
    #[serde(other)]
    Unknown,
}

impl FieldType {
    /// Whether values of this type participate in numeric aggregation
    /// without coercion warnings.
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldType::Number | FieldType::Calculated)
    }
}

/// One field of a form template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Opaque, schema-scoped, stable identifier (e.g. `field-annualRevenue`).
    pub id: String,
    /// Human-readable display name; not guaranteed unique.
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Formula for computed/derived fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculation_formula: Option<String>,
    /// Explicit percentage marker. When set, stored values are treated as
    /// percentage points and divided by 100 on extraction for formulas.
    /// When unset, the active [`PercentagePolicy`] decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_percentage: Option<bool>,
}

/// A titled group of fields within a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSection {
    pub title: String,
    pub fields: Vec<FieldDescriptor>,
}

/// A tenant's form template: ordered sections of field descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormTemplate {
    pub id: String,
    pub name: String,
    pub sections: Vec<FormSection>,
}

impl FormTemplate {
    /// Build a single-section template from a flat field list.
    pub fn flat(id: &str, name: &str, fields: Vec<FieldDescriptor>) -> Self {
        FormTemplate {
            id: id.to_string(),
            name: name.to_string(),
            sections: vec![FormSection {
                title: name.to_string(),
                fields,
            }],
        }
    }

    /// All fields in declaration order, across sections.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.sections.iter().flat_map(|s| s.fields.iter())
    }

    /// Look up a field by its identifier.
    pub fn field(&self, id: &str) -> Option<&FieldDescriptor> {
        self.fields().find(|f| f.id == id)
    }
}

// ──────────────────────────────────────────────
// Percentage policy
// ──────────────────────────────────────────────

/// Policy deciding which fields hold percentage-point values that must be
/// divided by 100 before entering a formula.
///
/// The upstream system inferred this from the field's English label, which
/// is fragile; the explicit `is_percentage` flag on [`FieldDescriptor`] is
/// the preferred mechanism. `LabelKeywords` reproduces the legacy behavior
/// for templates that have not been migrated, with the keyword lists kept
/// configurable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PercentagePolicy {
    /// Only fields with `is_percentage: Some(true)` are percentages.
    ExplicitFlagOnly,
    /// `is_percentage` wins when set; otherwise a field is a percentage if
    /// its lower-cased label contains any `include` keyword and none of the
    /// `exclude` keywords.
    LabelKeywords {
        include: Vec<String>,
        exclude: Vec<String>,
    },
}

impl PercentagePolicy {
    /// The legacy keyword lists observed in production formulas.
    pub fn legacy_label_keywords() -> Self {
        PercentagePolicy::LabelKeywords {
            include: vec!["discount".to_string()],
            exclude: vec![
                "profitability".to_string(),
                "margin".to_string(),
                "revenue".to_string(),
            ],
        }
    }

    pub fn is_percentage(&self, field: &FieldDescriptor) -> bool {
        if let Some(flag) = field.is_percentage {
            return flag;
        }
        match self {
            PercentagePolicy::ExplicitFlagOnly => false,
            PercentagePolicy::LabelKeywords { include, exclude } => {
                let label = field.label.to_lowercase();
                include.iter().any(|k| label.contains(k.as_str()))
                    && !exclude.iter().any(|k| label.contains(k.as_str()))
            }
        }
    }
}

impl Default for PercentagePolicy {
    fn default() -> Self {
        PercentagePolicy::ExplicitFlagOnly
    }
}
