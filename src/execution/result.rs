//! Execution Result - terminal artifact of one guard invocation

use crate::error::{ExecutionErrorKind, NlqError};
use crate::execution::store::Row;
use crate::execution_loop::GuardState;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,

    /// Rows of the successful attempt; empty on failure
    pub rows: Vec<Row>,

    pub row_count: usize,

    /// User-facing failure message
    pub error: Option<String>,

    pub error_kind: Option<ExecutionErrorKind>,

    /// Final attempted query text, corrected if a retry rewrote it
    pub query_executed: Option<String>,

    /// Execution attempts made, including the first
    pub attempts: u8,

    /// Every state the guard passed through, in order
    pub states: Vec<GuardState>,

    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn success(rows: Vec<Row>, query_executed: String, attempts: u8, states: Vec<GuardState>) -> Self {
        Self {
            success: true,
            row_count: rows.len(),
            rows,
            error: None,
            error_kind: None,
            query_executed: Some(query_executed),
            attempts,
            states,
            execution_time_ms: 0,
        }
    }

    pub fn failure(
        kind: ExecutionErrorKind,
        error: String,
        query_executed: String,
        attempts: u8,
        states: Vec<GuardState>,
    ) -> Self {
        Self {
            success: false,
            rows: Vec::new(),
            row_count: 0,
            error: Some(error),
            error_kind: Some(kind),
            query_executed: Some(query_executed),
            attempts,
            states,
            execution_time_ms: 0,
        }
    }

    pub fn with_elapsed(mut self, elapsed_ms: u64) -> Self {
        self.execution_time_ms = elapsed_ms;
        self
    }

    /// The failure as a crate error, `None` on success
    pub fn to_error(&self) -> Option<NlqError> {
        if self.success {
            return None;
        }
        Some(NlqError::Execution {
            kind: self.error_kind.unwrap_or(ExecutionErrorKind::Other),
            message: self
                .error
                .clone()
                .unwrap_or_else(|| "Execution failed without a message".to_string()),
            query: self.query_executed.clone(),
        })
    }
}
