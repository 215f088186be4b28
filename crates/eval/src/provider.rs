//! Schema and record provider traits.
//!
//! The engine itself is synchronous and takes materialized inputs; these
//! traits are the seam to the collaborators that own them. A
//! `SchemaProvider` supplies the form template for a tenant, and a
//! `RecordProvider` fetches the submissions in scope. Implementations
//! talk to databases or HTTP services; the `Static*` implementations
//! below serve tests and ahead-of-time materialized data.

use async_trait::async_trait;
use std::fmt;

use tally_core::{FormTemplate, Record};

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

/// Errors that can occur while fetching schema or records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The requested template does not exist.
    UnknownTemplate { template_id: String },
    /// A provider-specific error occurred.
    Provider(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::UnknownTemplate { template_id } => {
                write!(f, "unknown form template: {}", template_id)
            }
            ProviderError::Provider(msg) => write!(f, "provider error: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

// ──────────────────────────────────────────────
// Query scope
// ──────────────────────────────────────────────

/// Scope of a record fetch: which template's submissions, for which
/// organization, over which date range. Dates are ISO `YYYY-MM-DD`
/// strings interpreted by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    pub template_id: String,
    pub organization_id: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

impl RecordQuery {
    pub fn for_template(template_id: &str) -> Self {
        RecordQuery {
            template_id: template_id.to_string(),
            ..Default::default()
        }
    }
}

// ──────────────────────────────────────────────
// Traits
// ──────────────────────────────────────────────

/// Asynchronous provider of form templates.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Fetch the template for the given id.
    async fn form_template(&self, template_id: &str) -> Result<FormTemplate, ProviderError>;
}

/// Asynchronous provider of submission records.
///
/// The engine is agnostic to storage: it only needs the records already
/// scoped to the query. Filtering beyond the query scope happens inside
/// the engine.
#[async_trait]
pub trait RecordProvider: Send + Sync {
    /// Fetch the records in scope for evaluation.
    async fn records(&self, query: &RecordQuery) -> Result<Vec<Record>, ProviderError>;
}

// ──────────────────────────────────────────────
// Static implementations
// ──────────────────────────────────────────────

/// A schema provider backed by a fixed set of templates.
pub struct StaticSchemaProvider {
    templates: Vec<FormTemplate>,
}

impl StaticSchemaProvider {
    pub fn new(templates: Vec<FormTemplate>) -> Self {
        Self { templates }
    }
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn form_template(&self, template_id: &str) -> Result<FormTemplate, ProviderError> {
        self.templates
            .iter()
            .find(|t| t.id == template_id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownTemplate {
                template_id: template_id.to_string(),
            })
    }
}

/// A record provider that returns a fixed record list for every query.
pub struct StaticRecordProvider {
    records: Vec<Record>,
}

impl StaticRecordProvider {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

#[async_trait]
impl RecordProvider for StaticRecordProvider {
    async fn records(&self, _query: &RecordQuery) -> Result<Vec<Record>, ProviderError> {
        Ok(self.records.clone())
    }
}
