//! Query Pipeline
//!
//! One question end to end: detect, route, validate, correct, execute.
//! Every failure is turned into a `QueryResponse`; nothing panics or
//! propagates past `process`.

use crate::catalog::EntityCatalog;
use crate::config::{LlmProvider, PipelineConfig};
use crate::corrector::QueryCorrector;
use crate::detector::{DetectedEntity, EntityDetector};
use crate::error::{NlqError, Result, ValidationErrorKind};
use crate::execution::result::ExecutionResult;
use crate::execution::store::{RecordStore, Row};
use crate::execution_loop::{CancellationToken, ExecutionGuard};
use crate::llm::LlmClient;
use crate::plan::ExecutionPlan;
use crate::router::{DecisionRouter, LlmProposer, PlanProposer, RuleBasedProposer};
use crate::validator::PlanValidator;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ResponseData {
    pub results: Vec<Row>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseError {
    /// e.g. "ValidationError::EmptyTableName"
    pub kind: String,
    pub message: String,
}

/// Caller-facing outcome of one question
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    /// Last query text produced or attempted, for diagnosis
    pub query_executed: Option<String>,
    pub execution_type: Option<String>,
    pub detected_entities: Vec<DetectedEntity>,
    pub reasoning: Option<String>,
    pub attempts: u8,
}

/// What is known about a request so far, kept even when a later stage fails
#[derive(Debug, Default)]
struct Trace {
    detected: Vec<DetectedEntity>,
    reasoning: Option<String>,
    execution_type: Option<String>,
    query_text: Option<String>,
    attempts: u8,
}

pub struct QueryPipeline {
    catalog: Arc<EntityCatalog>,
    detector: EntityDetector,
    router: DecisionRouter,
    validator: PlanValidator,
    corrector: QueryCorrector,
    guard: ExecutionGuard,
    timeout: Option<Duration>,
}

impl QueryPipeline {
    pub fn new(
        config: &PipelineConfig,
        catalog: Arc<EntityCatalog>,
        proposer: Arc<dyn PlanProposer>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            catalog,
            detector: EntityDetector::new(config.detector.clone()),
            router: DecisionRouter::new(proposer, config.router.clone()),
            validator: PlanValidator::new(),
            corrector: QueryCorrector::new(config.corrector.clone()),
            guard: ExecutionGuard::new(store, config.guard.clone()),
            timeout: config.timeout(),
        }
    }

    /// Proposer chosen by `config.llm`; remote models fall back to the rule-based one
    pub fn from_config(
        config: &PipelineConfig,
        catalog: Arc<EntityCatalog>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self> {
        config.validate()?;
        let pipeline = match config.llm.provider {
            LlmProvider::Rules => Self::new(config, catalog, Arc::new(RuleBasedProposer), store),
            LlmProvider::OpenRouter | LlmProvider::Gemini => {
                let client = LlmClient::new(config.llm.clone())?;
                Self::new(config, catalog, Arc::new(LlmProposer::new(client)), store)
                    .with_fallback(Arc::new(RuleBasedProposer))
            }
        };
        Ok(pipeline)
    }

    pub fn with_fallback(self, fallback: Arc<dyn PlanProposer>) -> Self {
        Self {
            router: self.router.with_fallback(fallback),
            ..self
        }
    }

    pub fn catalog(&self) -> &Arc<EntityCatalog> {
        &self.catalog
    }

    pub async fn process(&self, query: &str) -> QueryResponse {
        self.process_with_cancel(query, CancellationToken::new()).await
    }

    /// Like `process`, with a token the caller may trip to stop between
    /// execution attempts. The token is also tripped when the deadline passes.
    pub async fn process_with_cancel(&self, query: &str, cancel: CancellationToken) -> QueryResponse {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("nlq_query", request_id = %request_id);
        let mut trace = Trace::default();

        let outcome = {
            let run = self.run(query, &cancel, &mut trace).instrument(span.clone());
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        cancel.cancel();
                        Err(NlqError::Timeout(limit.as_millis() as u64))
                    }
                },
                None => run.await,
            }
        };

        span.in_scope(|| respond(request_id, outcome, trace))
    }

    async fn run(&self, query: &str, cancel: &CancellationToken, trace: &mut Trace) -> Result<ExecutionResult> {
        let query = query.trim();
        if query.is_empty() {
            return Err(NlqError::InvalidRequest("Query text is empty".to_string()));
        }
        info!("Processing query: {}", query);

        let detected = self.detector.detect(query, &self.catalog);
        trace.detected = detected.clone();
        if detected.is_empty() {
            return Err(NlqError::UnresolvedEntity(format!(
                "No document type recognised in '{}'. Name one explicitly, e.g. 'Sales Order' or 'Customer'",
                query
            )));
        }
        info!(
            "Detected entities: {}",
            detected
                .iter()
                .map(|d| format!("{} ({:.1})", d.entity_name, d.confidence))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let routed = self.router.plan(query, &detected, &self.catalog).await?;
        trace.reasoning = Some(routed.reasoning.clone());
        trace.execution_type = Some(routed.plan.execution_type().to_string());
        trace.query_text = Some(routed.plan.query_text());

        let plan = self.prepare(routed.plan, &detected)?;
        trace.query_text = Some(plan.query_text());

        let result = self
            .guard
            .execute(&plan, &detected, &self.catalog, cancel)
            .await?;
        trace.attempts = result.attempts;
        trace.query_text = result.query_executed.clone();

        match result.to_error() {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Validate, repair generated queries, validate again
    fn prepare(&self, plan: ExecutionPlan, detected: &[DetectedEntity]) -> Result<ExecutionPlan> {
        let first_pass = self.validator.validate(&plan, &self.catalog);
        if !matches!(plan, ExecutionPlan::GeneratedQuery(_)) {
            return first_pass.map(|()| plan);
        }

        match first_pass {
            Ok(()) => {}
            Err(NlqError::Validation {
                kind: ValidationErrorKind::EmptyTableName | ValidationErrorKind::UnknownEntity,
                message,
            }) => {
                warn!("Repairing generated query: {}", message);
            }
            Err(e) => return Err(e),
        }

        let corrected = self.corrector.correct(&plan, detected, &self.catalog)?;
        self.validator.validate(&corrected, &self.catalog)?;
        Ok(corrected)
    }
}

fn respond(request_id: String, outcome: Result<ExecutionResult>, trace: Trace) -> QueryResponse {
    match outcome {
        Ok(result) => {
            info!("Answered with {} rows", result.row_count);
            QueryResponse {
                request_id,
                success: true,
                data: Some(ResponseData {
                    count: result.row_count,
                    results: result.rows,
                }),
                error: None,
                query_executed: result.query_executed.or(trace.query_text),
                execution_type: trace.execution_type,
                detected_entities: trace.detected,
                reasoning: trace.reasoning,
                attempts: result.attempts,
            }
        }
        Err(e) => {
            error!("Query failed: {}", e);
            QueryResponse {
                request_id,
                success: false,
                data: None,
                error: Some(ResponseError {
                    kind: e.kind_name(),
                    message: e.to_string(),
                }),
                query_executed: e.query_text().map(str::to_string).or(trace.query_text),
                execution_type: trace.execution_type,
                detected_entities: trace.detected,
                reasoning: trace.reasoning,
                attempts: trace.attempts,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::sqlite_store::SqliteRecordStore;

    fn pipeline() -> QueryPipeline {
        let catalog = Arc::new(EntityCatalog::builtin().unwrap());
        let store = SqliteRecordStore::in_memory(catalog.clone()).unwrap();
        store.seed_demo_data().unwrap();
        QueryPipeline::new(
            &PipelineConfig::new(),
            catalog,
            Arc::new(RuleBasedProposer),
            Arc::new(store),
        )
    }

    #[tokio::test]
    async fn test_blank_query_is_invalid_request() {
        let response = pipeline().process("   ").await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().kind, "InvalidRequest");
    }

    #[tokio::test]
    async fn test_unrecognised_query_is_unresolved() {
        let response = pipeline().process("what is the weather like").await;
        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.kind, "UnresolvedEntity");
        assert!(error.message.contains("weather"));
    }

    #[tokio::test]
    async fn test_rule_based_count() {
        let response = pipeline().process("how many purchase orders are submitted?").await;
        assert!(response.success, "{:?}", response.error);
        let data = response.data.unwrap();
        assert_eq!(data.results[0]["count"], serde_json::Value::from(1));
        assert_eq!(response.execution_type.as_deref(), Some("direct_api"));
        assert_eq!(response.attempts, 1);
    }

    #[test]
    fn test_remote_provider_without_key_is_rejected() {
        let catalog = Arc::new(EntityCatalog::builtin().unwrap());
        let store = Arc::new(SqliteRecordStore::in_memory(catalog.clone()).unwrap());
        let mut config = PipelineConfig::new();
        config.llm.provider = LlmProvider::OpenRouter;
        assert!(matches!(
            QueryPipeline::from_config(&config, catalog, store),
            Err(NlqError::Config(_))
        ));
    }
}
