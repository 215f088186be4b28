//! Error type for schema and resolution failures.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A formula token could not be mapped to any field in the template.
    #[error("unresolved field reference: '{token}'")]
    UnresolvedReference { token: String },

    /// Two fields claimed the same reference token and neither carries the
    /// namespace prefix, so the token cannot be disambiguated.
    #[error("ambiguous field reference '{token}': claimed by '{first}' and '{second}'")]
    AmbiguousReference {
        token: String,
        first: String,
        second: String,
    },
}
