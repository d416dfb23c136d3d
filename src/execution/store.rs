//! Record Store - the execution collaborator
//!
//! Accepts either a named direct operation or raw generated query code and
//! answers with rows or a structured error. Each call is one atomic request.

use crate::plan::DirectOperation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One result row, column name to value
pub type Row = serde_json::Map<String, Value>;

/// Failure reported by a record store
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct StoreError {
    /// Driver error code or class, e.g. "1146" or "no_such_table"
    pub code: String,
    pub message: String,
}

impl StoreError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    fn name(&self) -> &str;

    /// Run one of the allow-listed parameterized operations
    async fn run_operation(&self, operation: &DirectOperation) -> StoreResult<Vec<Row>>;

    /// Run generated read-only query code as-is
    async fn run_query(&self, code: &str) -> StoreResult<Vec<Row>>;
}
