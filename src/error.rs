use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a plan was rejected before it reached the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationErrorKind {
    EmptyTableName,
    UnknownEntity,
    TypeMismatch,
    UnknownOperation,
    UnknownField,
    InvalidOperator,
    MissingParameter,
    MissingTableReference,
    UnsafeQuery,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationErrorKind::EmptyTableName => "EmptyTableName",
            ValidationErrorKind::UnknownEntity => "UnknownEntity",
            ValidationErrorKind::TypeMismatch => "TypeMismatch",
            ValidationErrorKind::UnknownOperation => "UnknownOperation",
            ValidationErrorKind::UnknownField => "UnknownField",
            ValidationErrorKind::InvalidOperator => "InvalidOperator",
            ValidationErrorKind::MissingParameter => "MissingParameter",
            ValidationErrorKind::MissingTableReference => "MissingTableReference",
            ValidationErrorKind::UnsafeQuery => "UnsafeQuery",
        };
        write!(f, "{}", name)
    }
}

/// Runtime failure classes reported by the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionErrorKind {
    /// Empty or unresolved table identifier surfaced at execution time.
    /// The only class eligible for automatic retry.
    IncorrectTableName,
    Other,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionErrorKind::IncorrectTableName => write!(f, "IncorrectTableName"),
            ExecutionErrorKind::Other => write!(f, "Other"),
        }
    }
}

#[derive(Error, Debug)]
pub enum NlqError {
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unresolved entity: {0}")]
    UnresolvedEntity(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Validation error ({kind}): {message}")]
    Validation {
        kind: ValidationErrorKind,
        message: String,
    },

    #[error("Correction error: {0}")]
    Correction(String),

    #[error("Execution error ({kind}): {message}")]
    Execution {
        kind: ExecutionErrorKind,
        message: String,
        query: Option<String>,
    },

    #[error("Record store error: {0}")]
    Store(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NlqError {
    pub fn validation(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        NlqError::Validation {
            kind,
            message: message.into(),
        }
    }

    /// Stable machine-readable tag used in caller-facing responses
    pub fn kind_name(&self) -> String {
        match self {
            NlqError::Catalog(_) => "CatalogError".to_string(),
            NlqError::Config(_) => "ConfigError".to_string(),
            NlqError::InvalidRequest(_) => "InvalidRequest".to_string(),
            NlqError::UnresolvedEntity(_) => "UnresolvedEntity".to_string(),
            NlqError::Llm(_) | NlqError::Planning(_) => "PlanningError".to_string(),
            NlqError::Validation { kind, .. } => format!("ValidationError::{}", kind),
            NlqError::Correction(_) => "CorrectionError".to_string(),
            NlqError::Execution { kind, .. } => format!("ExecutionError::{}", kind),
            NlqError::Store(_) => "StoreError".to_string(),
            NlqError::Cancelled(_) => "Cancelled".to_string(),
            NlqError::Timeout(_) => "Timeout".to_string(),
            NlqError::Io(_) => "IoError".to_string(),
            NlqError::Json(_) => "JsonError".to_string(),
        }
    }

    /// The query text that produced the error, when there is one
    pub fn query_text(&self) -> Option<&str> {
        match self {
            NlqError::Execution { query, .. } => query.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, NlqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        let err = NlqError::validation(ValidationErrorKind::EmptyTableName, "`tab` is empty");
        assert_eq!(err.kind_name(), "ValidationError::EmptyTableName");
        assert!(err.to_string().contains("`tab` is empty"));

        let err = NlqError::Execution {
            kind: ExecutionErrorKind::IncorrectTableName,
            message: "Incorrect table name 'tab'".to_string(),
            query: Some("SELECT * FROM `tab`".to_string()),
        };
        assert_eq!(err.kind_name(), "ExecutionError::IncorrectTableName");
        assert_eq!(err.query_text(), Some("SELECT * FROM `tab`"));
    }
}
