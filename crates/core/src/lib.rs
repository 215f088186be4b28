//! tally-core: schema model and record primitives for the Tally formula
//! engine.
//!
//! This crate holds everything the formula compiler consumes but does not
//! own: the form template schema, the reference map that resolves human
//! labels and id variants to canonical field identifiers, typed value
//! extraction from raw records, and declarative filtering/grouping.
//!
//! # Public API
//!
//! Key types are re-exported at the crate root for convenience:
//!
//! - [`FormTemplate`], [`FieldDescriptor`], [`FieldType`] -- the schema model
//! - [`ReferenceMap`] -- label/id token resolution, built once per template
//! - [`Record`], [`extract()`], [`extract_number()`] -- value extraction
//! - [`Filter`], [`apply_filters()`], [`group_by()`] -- record filtering
//! - [`FieldValue`] -- the typed runtime value
//!
//! All computation here is synchronous and allocation-light; nothing in
//! this crate performs I/O.

pub mod error;
pub mod extract;
pub mod filter;
pub mod resolver;
pub mod schema;
pub mod value;

// ── Convenience re-exports ───────────────────────────────────────────

pub use error::CoreError;
pub use extract::{extract, extract_number, parse_loose_number, raw_value, Record};
pub use filter::{apply_filters, group_by, Filter, FilterOp, NULL_GROUP_KEY};
pub use resolver::{edit_distance, ReferenceMap, FIELD_PREFIX};
pub use schema::{FieldDescriptor, FieldType, FormSection, FormTemplate, PercentagePolicy};
pub use value::FieldValue;
