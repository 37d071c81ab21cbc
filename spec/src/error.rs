use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("bundle not found: {0}")]
    BundleNotFound(PathBuf),

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("unknown jail extension field: {0}")]
    UnknownExtension(String),
}

impl SpecError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SpecError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The configuration field the error refers to, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            SpecError::MissingField(field)
            | SpecError::InvalidField { field, .. }
            | SpecError::UnknownExtension(field) => Some(field),
            SpecError::BundleNotFound(_) | SpecError::Parse { .. } => None,
        }
    }
}
