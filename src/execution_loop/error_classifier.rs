//! Error Classifier
//!
//! Classifies record-store errors into the execution error taxonomy and
//! pulls out the table identifier the store complained about.

use crate::error::ExecutionErrorKind;
use crate::execution::store::StoreError;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Driver codes meaning "bad or missing table": MySQL 1103 (incorrect
/// table name), MySQL 1146 (table doesn't exist), SQLite's no such table
const TABLE_NAME_CODES: &[&str] = &["1103", "1146", "no_such_table"];

const TABLE_NAME_PATTERNS: &[&str] = &[
    "incorrect table name",
    "no such table",
    "unknown table",
];

lazy_static! {
    static ref NO_SUCH_TABLE: Regex = Regex::new(r"no such table: (\S+)").expect("pattern compiles");
    static ref QUOTED: Regex = Regex::new(r"'([^']*)'").expect("pattern compiles");
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub kind: ExecutionErrorKind,
    /// Offending table identifier, schema qualifier and quotes stripped
    pub identifier: Option<String>,
}

pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, error: &StoreError) -> ErrorClassification {
        let error_msg = error.message.to_lowercase();

        let by_code = TABLE_NAME_CODES.contains(&error.code.as_str());
        let by_message = TABLE_NAME_PATTERNS.iter().any(|p| error_msg.contains(p))
            || (error_msg.contains("table") && error_msg.contains("doesn't exist"));

        if !(by_code || by_message) {
            return ErrorClassification {
                kind: ExecutionErrorKind::Other,
                identifier: None,
            };
        }

        ErrorClassification {
            kind: ExecutionErrorKind::IncorrectTableName,
            identifier: self.extract_identifier(&error.message),
        }
    }

    fn extract_identifier(&self, message: &str) -> Option<String> {
        let raw = NO_SUCH_TABLE
            .captures(message)
            .or_else(|| QUOTED.captures(message))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())?;

        // "erp.tabSales Order" -> "tabSales Order"
        let unqualified = raw.rsplit('.').next().unwrap_or(raw);
        Some(unqualified.trim_matches(|c| c == '`' || c == '"').to_string())
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}
