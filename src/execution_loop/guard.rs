//! Execution Guard
//!
//! Bounded retry loop around the record store.
//!
//! ```text
//! Pending -> Executing -> Succeeded
//!                      -> Failed
//!                      -> Retrying -> Executing
//! ```
//!
//! Only `IncorrectTableName` failures on generated queries are retried,
//! after pointing the offending references at the top detected entity.

use crate::catalog::{normalize_identifier, EntityCatalog};
use crate::config::GuardConfig;
use crate::corrector::{retarget, top_table};
use crate::detector::DetectedEntity;
use crate::error::{ExecutionErrorKind, NlqError, Result};
use crate::execution::result::ExecutionResult;
use crate::execution::store::RecordStore;
use crate::execution_loop::error_classifier::ErrorClassifier;
use crate::plan::{ExecutionPlan, GeneratedQuery};
use crate::table_ref::{self, TableRef};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Hard ceiling on attempts, whatever the configuration says
pub const MAX_ATTEMPTS_CAP: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardState {
    Pending,
    Executing,
    Retrying,
    Succeeded,
    Failed,
}

/// Per-invocation retry bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryContext {
    pub attempt_count: u8,
    pub last_error_kind: Option<ExecutionErrorKind>,
    pub exhausted: bool,
}

/// Shared flag a caller trips to stop the guard between attempts
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ExecutionGuard {
    store: Arc<dyn RecordStore>,
    max_attempts: u8,
    config: GuardConfig,
    error_classifier: ErrorClassifier,
}

impl ExecutionGuard {
    pub fn new(store: Arc<dyn RecordStore>, config: GuardConfig) -> Self {
        Self {
            store,
            max_attempts: config.max_attempts.clamp(1, MAX_ATTEMPTS_CAP),
            config,
            error_classifier: ErrorClassifier::new(),
        }
    }

    /// Run `plan`, retrying table-name failures. Execution failures come back
    /// as an unsuccessful `ExecutionResult`; only cancellation is an `Err`.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        detected: &[DetectedEntity],
        catalog: &EntityCatalog,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let mut states = vec![GuardState::Pending];
        let mut ctx = RetryContext::default();
        let mut current = plan.clone();

        loop {
            if cancel.is_cancelled() {
                return Err(NlqError::Cancelled(format!(
                    "Execution cancelled before attempt {}",
                    ctx.attempt_count + 1
                )));
            }

            ctx.attempt_count += 1;
            states.push(GuardState::Executing);
            info!(
                "Execution attempt {} of {} on '{}'",
                ctx.attempt_count,
                self.max_attempts,
                self.store.name()
            );

            let outcome = match &current {
                ExecutionPlan::DirectOperation(op) => self.store.run_operation(op).await,
                ExecutionPlan::GeneratedQuery(query) => self.store.run_query(&query.code).await,
            };
            let query_text = current.query_text();
            let elapsed = || started.elapsed().as_millis() as u64;

            let error = match outcome {
                Ok(rows) => {
                    states.push(GuardState::Succeeded);
                    info!("Execution succeeded on attempt {} ({} rows)", ctx.attempt_count, rows.len());
                    return Ok(
                        ExecutionResult::success(rows, query_text, ctx.attempt_count, states)
                            .with_elapsed(elapsed()),
                    );
                }
                Err(error) => error,
            };

            let classification = self.error_classifier.classify(&error);
            ctx.last_error_kind = Some(classification.kind);
            warn!(
                "Attempt {} failed ({}): {}",
                ctx.attempt_count, classification.kind, error
            );

            let fail = |states: Vec<GuardState>, message: String, ctx: &RetryContext| -> ExecutionResult {
                ExecutionResult::failure(classification.kind, message, query_text.clone(), ctx.attempt_count, states)
                    .with_elapsed(elapsed())
            };

            if classification.kind != ExecutionErrorKind::IncorrectTableName {
                states.push(GuardState::Failed);
                let message = if error.message.trim().is_empty() {
                    format!("Record store failed with code {}", error.code)
                } else {
                    error.message.clone()
                };
                return Ok(fail(states, message, &ctx));
            }

            let identifier = classification.identifier.as_deref();
            let ExecutionPlan::GeneratedQuery(query) = &current else {
                states.push(GuardState::Failed);
                return Ok(fail(states, unresolved_message(identifier), &ctx));
            };

            if ctx.attempt_count >= self.max_attempts {
                ctx.exhausted = true;
                states.push(GuardState::Failed);
                warn!("Retry budget of {} attempts exhausted", self.max_attempts);
                return Ok(fail(states, unresolved_message(identifier), &ctx));
            }

            let Some(table) = top_table(detected, catalog) else {
                states.push(GuardState::Failed);
                return Ok(fail(states, unresolved_message(identifier), &ctx));
            };

            let rewritten = retarget(&query.code, catalog, &table, |r| {
                r.is_empty() || identifier.map_or(false, |ident| names_identifier(r, ident))
            });
            if rewritten == query.code {
                // Nothing left to repair; another attempt would fail the same way
                states.push(GuardState::Failed);
                return Ok(fail(states, unresolved_message(identifier), &ctx));
            }

            info!("Retrying with table references pointed at `{}`", table);
            states.push(GuardState::Retrying);
            current = ExecutionPlan::GeneratedQuery(GeneratedQuery {
                referenced_entities: table_ref::referenced_entities(&rewritten, catalog),
                code: rewritten,
            });

            tokio::time::sleep(self.config.backoff()).await;
        }
    }
}

/// Whether the reference is the table a store error named
fn names_identifier(table_ref: &TableRef, identifier: &str) -> bool {
    let target = normalize_identifier(identifier);
    normalize_identifier(&table_ref::prefixed(&table_ref.identifier)) == target
        || normalize_identifier(&table_ref.identifier) == target
}

fn unresolved_message(identifier: Option<&str>) -> String {
    let shown = match identifier.map(str::trim) {
        Some(ident) if !ident.is_empty() && ident != crate::catalog::TABLE_PREFIX => format!("'{}'", ident),
        _ => "(empty table name)".to_string(),
    };
    format!(
        "Could not resolve table {}. Please name the document type explicitly, e.g. \"show all Sales Orders\".",
        shown
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EntitySchema;
    use crate::execution::store::{Row, StoreError, StoreResult};
    use crate::plan::{DirectOperation, OperationParameters};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails every query that still mentions a table outside `known`
    struct ScriptedStore {
        known: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedStore {
        fn new(known: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                known,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordStore for ScriptedStore {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run_operation(&self, op: &DirectOperation) -> StoreResult<Vec<Row>> {
            self.calls.lock().unwrap().push(op.to_string());
            Err(StoreError::new("1146", "Table 'erp.tabNothing' doesn't exist"))
        }

        async fn run_query(&self, code: &str) -> StoreResult<Vec<Row>> {
            self.calls.lock().unwrap().push(code.to_string());
            let re = regex::Regex::new(r"`(tab[^`]*)`").unwrap();
            for caps in re.captures_iter(code) {
                let table = &caps[1];
                if !self.known.contains(&table) {
                    return Err(StoreError::new("1146", format!("Table 'erp.{}' doesn't exist", table)));
                }
            }
            let mut row = Row::new();
            row.insert("name".to_string(), serde_json::Value::from("SO-0001"));
            Ok(vec![row])
        }
    }

    fn catalog() -> EntityCatalog {
        EntityCatalog::from_entities(vec![EntitySchema::new("Sales Order", vec![]), EntitySchema::new("Customer", vec![])]).unwrap()
    }

    fn detected(name: &str) -> Vec<DetectedEntity> {
        vec![DetectedEntity {
            entity_name: name.to_string(),
            confidence: 0.9,
            exact_match: true,
            matched_keyword: name.to_lowercase(),
        }]
    }

    fn query(code: &str) -> ExecutionPlan {
        ExecutionPlan::GeneratedQuery(GeneratedQuery {
            code: code.to_string(),
            referenced_entities: vec![],
        })
    }

    fn guard(store: Arc<ScriptedStore>) -> ExecutionGuard {
        ExecutionGuard::new(
            store,
            GuardConfig {
                max_attempts: 3,
                retry_backoff_ms: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_retry_repairs_unresolved_table() {
        let store = ScriptedStore::new(vec!["tabSalesOrder"]);
        let result = guard(store.clone())
            .execute(&query("SELECT name FROM `tabSalesOrdr`"), &detected("Sales Order"), &catalog(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.query_executed.as_deref(), Some("SELECT name FROM `tabSalesOrder`"));
        assert_eq!(
            result.states,
            vec![
                GuardState::Pending,
                GuardState::Executing,
                GuardState::Retrying,
                GuardState::Executing,
                GuardState::Succeeded
            ]
        );
        assert_eq!(store.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_never_more_than_three_attempts() {
        let store = ScriptedStore::new(vec!["tabSalesOrder"]);
        let result = guard(store.clone())
            .execute(
                &query("SELECT * FROM `tabFoo` JOIN `tabBar` JOIN `tabBaz` JOIN `tabQux`"),
                &detected("Sales Order"),
                &catalog(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(store.calls().len(), 3);
        assert_eq!(result.error_kind, Some(ExecutionErrorKind::IncorrectTableName));
        assert!(result.error.unwrap().contains("name the document type explicitly"));
        assert_eq!(result.states.last(), Some(&GuardState::Failed));
    }

    #[tokio::test]
    async fn test_configured_attempts_are_clamped() {
        let store = ScriptedStore::new(vec!["tabCustomer"]);
        let guard = ExecutionGuard::new(
            store.clone(),
            GuardConfig {
                max_attempts: 9,
                retry_backoff_ms: 1,
            },
        );
        let result = guard
            .execute(
                &query("SELECT * FROM `tabA1` JOIN `tabA2` JOIN `tabA3` JOIN `tabA4` JOIN `tabA5`"),
                &detected("Customer"),
                &catalog(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.attempts, 3);
        assert_eq!(store.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_no_progress_stops_early() {
        // the store rejects the top entity's own table, so rewriting cannot help
        let store = ScriptedStore::new(vec![]);
        let result = guard(store.clone())
            .execute(&query("SELECT * FROM `tabSalesOrder`"), &detected("Sales Order"), &catalog(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert!(result.error.unwrap().contains("'tabSalesOrder'"));
    }

    #[tokio::test]
    async fn test_direct_operation_not_retried() {
        let store = ScriptedStore::new(vec![]);
        let plan = ExecutionPlan::DirectOperation(DirectOperation {
            operation_name: "dynamic_search".to_string(),
            parameters: OperationParameters {
                doctype: Some("Sales Order".to_string()),
                ..Default::default()
            },
        });
        let result = guard(store.clone())
            .execute(&plan, &detected("Sales Order"), &catalog(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.query_executed.as_deref(), Some(r#"dynamic_search(doctype="Sales Order")"#));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let store = ScriptedStore::new(vec!["tabSalesOrder"]);
        let token = CancellationToken::new();
        token.cancel();
        let err = guard(store.clone())
            .execute(&query("SELECT * FROM `tabSalesOrder`"), &detected("Sales Order"), &catalog(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, NlqError::Cancelled(_)));
        assert!(store.calls().is_empty());
    }

    /// Trips the token during the call, then reports a bad table name
    struct CancellingStore {
        token: CancellationToken,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl RecordStore for CancellingStore {
        fn name(&self) -> &str {
            "cancelling"
        }

        async fn run_operation(&self, _op: &DirectOperation) -> StoreResult<Vec<Row>> {
            unreachable!("only generated queries are run")
        }

        async fn run_query(&self, _code: &str) -> StoreResult<Vec<Row>> {
            *self.calls.lock().unwrap() += 1;
            self.token.cancel();
            Err(StoreError::new("1103", "Incorrect table name 'tabSalesOrdr'"))
        }
    }

    #[tokio::test]
    async fn test_cancelled_between_attempts() {
        let token = CancellationToken::new();
        let store = Arc::new(CancellingStore {
            token: token.clone(),
            calls: Mutex::new(0),
        });
        let guard = ExecutionGuard::new(
            store.clone(),
            GuardConfig {
                max_attempts: 3,
                retry_backoff_ms: 1,
            },
        );

        let err = guard
            .execute(&query("SELECT name FROM `tabSalesOrdr`"), &detected("Sales Order"), &catalog(), &token)
            .await
            .unwrap_err();

        assert!(matches!(err, NlqError::Cancelled(_)));
        assert!(err.to_string().contains("before attempt 2"));
        assert_eq!(*store.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
