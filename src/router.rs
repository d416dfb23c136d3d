//! Decision Router
//!
//! Asks a plan proposer (the reasoning collaborator) for a plan and
//! normalizes its loosely shaped JSON answer into an `ExecutionPlan`.
//! The router never executes anything.

use crate::catalog::{EntityCatalog, EntitySchema};
use crate::config::RouterConfig;
use crate::detector::DetectedEntity;
use crate::error::{NlqError, Result};
use crate::llm::{extract_json, LlmClient};
use crate::plan::{
    DirectOperation, ExecutionPlan, FilterCondition, FilterOperator, GeneratedQuery, OperationKind,
    OperationParameters, PlanDocument,
};
use crate::prompts::{build_planning_prompt, PLANNER_SYSTEM_PROMPT};
use crate::table_ref;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Row limit used when a listing does not say otherwise
pub const DEFAULT_LIST_LIMIT: i64 = 20;

/// Everything a proposer sees for one question
#[derive(Debug, Clone)]
pub struct PlanningRequest {
    pub query: String,
    /// Detected entities with their schemas, in detection order
    pub entities: Vec<(DetectedEntity, EntitySchema)>,
}

impl PlanningRequest {
    pub fn prompt(&self) -> String {
        build_planning_prompt(&self.query, &self.entities)
    }

    pub fn top_entity(&self) -> Option<&EntitySchema> {
        self.entities.first().map(|(_, schema)| schema)
    }
}

/// Reasoning collaborator: turns a question into a raw plan document
#[async_trait]
pub trait PlanProposer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn propose_plan(&self, request: &PlanningRequest) -> Result<PlanDocument>;
}

/// Proposer backed by a remote chat model
pub struct LlmProposer {
    client: LlmClient,
}

impl LlmProposer {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlanProposer for LlmProposer {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn propose_plan(&self, request: &PlanningRequest) -> Result<PlanDocument> {
        debug!("Requesting plan from model {}", self.client.model());
        let answer = self.client.complete(PLANNER_SYSTEM_PROMPT, &request.prompt()).await?;
        parse_plan_document(&answer)
    }
}

/// Parse a model answer that may wrap its JSON in prose or a code fence
pub fn parse_plan_document(answer: &str) -> Result<PlanDocument> {
    let json = extract_json(answer).ok_or_else(|| {
        NlqError::Planning(format!(
            "No JSON object in collaborator answer: {}",
            answer.chars().take(200).collect::<String>()
        ))
    })?;
    serde_json::from_str(&json)
        .map_err(|e| NlqError::Planning(format!("Malformed plan document: {}", e)))
}

/// Deterministic proposer for when no model is configured or the model fails.
/// Only produces count and list operations on the top entity.
#[derive(Debug, Default, Clone)]
pub struct RuleBasedProposer;

impl RuleBasedProposer {
    fn docstatus_filter(text: &str) -> Option<i64> {
        if text.contains("draft") {
            Some(0)
        } else if text.contains("submitted") {
            Some(1)
        } else if text.contains("cancelled") || text.contains("canceled") {
            Some(2)
        } else {
            None
        }
    }
}

#[async_trait]
impl PlanProposer for RuleBasedProposer {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn propose_plan(&self, request: &PlanningRequest) -> Result<PlanDocument> {
        let entity = request.top_entity().ok_or_else(|| {
            NlqError::Planning("Rule-based planning needs at least one detected entity".to_string())
        })?;
        let text = request.query.to_lowercase();

        let is_count = ["how many", "count", "number of"].iter().any(|k| text.contains(k));
        let kind = if is_count {
            OperationKind::Count
        } else {
            OperationKind::List
        };

        let mut parameters = serde_json::Map::new();
        parameters.insert("doctype".to_string(), Value::from(entity.name.clone()));
        if let Some(status) = Self::docstatus_filter(&text) {
            parameters.insert("filters".to_string(), serde_json::json!({ "docstatus": status }));
        }
        if kind == OperationKind::List {
            parameters.insert("limit".to_string(), Value::from(DEFAULT_LIST_LIMIT));
            parameters.insert("order_by".to_string(), Value::from("modified desc"));
        }

        Ok(PlanDocument {
            execution_type: Some("direct_api".to_string()),
            api_name: Some(kind.api_name().to_string()),
            parameters: Some(Value::Object(parameters)),
            code: None,
            referenced_entities: vec![entity.name.clone()],
            reasoning: format!("Keyword rules: {} on {}", kind.api_name(), entity.name),
        })
    }
}

/// A normalized plan plus the diagnostics that came with it
#[derive(Debug, Clone)]
pub struct RoutedPlan {
    pub plan: ExecutionPlan,
    pub reasoning: String,
    /// Which proposer produced the plan
    pub proposer: &'static str,
}

pub struct DecisionRouter {
    primary: Arc<dyn PlanProposer>,
    fallback: Option<Arc<dyn PlanProposer>>,
    config: RouterConfig,
}

impl DecisionRouter {
    pub fn new(primary: Arc<dyn PlanProposer>, config: RouterConfig) -> Self {
        Self {
            primary,
            fallback: None,
            config,
        }
    }

    /// Proposer tried when the primary one fails or answers unusably
    pub fn with_fallback(mut self, fallback: Arc<dyn PlanProposer>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub async fn plan(
        &self,
        query: &str,
        detected: &[DetectedEntity],
        catalog: &EntityCatalog,
    ) -> Result<RoutedPlan> {
        let request = PlanningRequest {
            query: query.to_string(),
            entities: detected
                .iter()
                .filter_map(|d| catalog.get(&d.entity_name).map(|s| (d.clone(), s.clone())))
                .collect(),
        };

        let routed = match self.plan_with(self.primary.as_ref(), &request, catalog).await {
            Ok(routed) => routed,
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    warn!(
                        "Proposer '{}' failed ({}), falling back to '{}'",
                        self.primary.name(),
                        e,
                        fallback.name()
                    );
                    self.plan_with(fallback.as_ref(), &request, catalog).await?
                }
                None => return Err(e),
            },
        };

        let routed = if self.config.allow_dynamic_queries {
            routed
        } else {
            downgrade(routed, detected)?
        };

        info!(
            "Routed to {} via '{}': {}",
            routed.plan.execution_type(),
            routed.proposer,
            routed.plan.query_text()
        );
        Ok(routed)
    }

    async fn plan_with(
        &self,
        proposer: &dyn PlanProposer,
        request: &PlanningRequest,
        catalog: &EntityCatalog,
    ) -> Result<RoutedPlan> {
        let document = proposer.propose_plan(request).await?;
        let reasoning = document.reasoning.clone();
        let plan = normalize(document, catalog)?;
        Ok(RoutedPlan {
            plan,
            reasoning,
            proposer: proposer.name(),
        })
    }
}

/// Classify a plan document into one of the two plan variants
pub fn normalize(document: PlanDocument, catalog: &EntityCatalog) -> Result<ExecutionPlan> {
    let execution_type = match document.execution_type.as_deref().map(|t| t.trim().to_lowercase()) {
        Some(t) => t,
        None if document.api_name.is_some() => "direct_api".to_string(),
        None if document.code.is_some() => "dynamic_query".to_string(),
        None => {
            return Err(NlqError::Planning(
                "Plan document has no execution_type, api_name or code".to_string(),
            ))
        }
    };

    match execution_type.as_str() {
        "direct_api" => {
            let operation_name = document
                .api_name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .ok_or_else(|| NlqError::Planning("direct_api plan is missing api_name".to_string()))?;
            let parameters = normalize_parameters(document.parameters)?;
            Ok(ExecutionPlan::DirectOperation(DirectOperation {
                operation_name,
                parameters,
            }))
        }
        "dynamic_query" => {
            let code = document
                .code
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| NlqError::Planning("dynamic_query plan has no code".to_string()))?;
            let referenced_entities = if document.referenced_entities.is_empty() {
                table_ref::referenced_entities(&code, catalog)
            } else {
                document.referenced_entities
            };
            Ok(ExecutionPlan::GeneratedQuery(GeneratedQuery {
                code,
                referenced_entities,
            }))
        }
        other => Err(NlqError::Planning(format!(
            "Unknown execution_type '{}'",
            other
        ))),
    }
}

fn normalize_parameters(raw: Option<Value>) -> Result<OperationParameters> {
    let map = match raw {
        None | Some(Value::Null) => return Ok(OperationParameters::default()),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(NlqError::Planning(format!(
                "parameters must be an object, got {}",
                other
            )))
        }
    };

    let limit = match map.get("limit") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(n.as_i64().ok_or_else(|| {
            NlqError::Planning(format!("limit must be an integer, got {}", n))
        })?),
        Some(Value::String(s)) => Some(s.trim().parse::<i64>().map_err(|_| {
            NlqError::Planning(format!("limit must be an integer, got '{}'", s))
        })?),
        Some(other) => {
            return Err(NlqError::Planning(format!(
                "limit must be an integer, got {}",
                other
            )))
        }
    };

    Ok(OperationParameters {
        doctype: string_param(&map, "doctype"),
        filters: normalize_filters(map.get("filters"))?,
        limit,
        order_by: string_param(&map, "order_by"),
        name: string_param(&map, "name"),
    })
}

fn string_param(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Accepted shapes:
/// - `{"field": value}` and `{"field": ["op", value]}`
/// - `{"field": [v1, v2]}` meaning `in`
/// - `[["field", "op", value], ...]`
fn normalize_filters(raw: Option<&Value>) -> Result<Vec<FilterCondition>> {
    match raw {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(field, value)| filter_from_entry(field, value))
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item.as_array().map(|a| a.as_slice()) {
                Some([Value::String(field), Value::String(op), value]) => Ok(FilterCondition {
                    field: field.clone(),
                    operator: op.clone(),
                    value: value.clone(),
                }),
                _ => Err(NlqError::Planning(format!(
                    "Filter entries must be [field, operator, value], got {}",
                    item
                ))),
            })
            .collect(),
        Some(other) => Err(NlqError::Planning(format!(
            "filters must be an object or a list, got {}",
            other
        ))),
    }
}

fn filter_from_entry(field: &str, value: &Value) -> Result<FilterCondition> {
    let condition = |operator: &str, value: &Value| FilterCondition {
        field: field.to_string(),
        operator: operator.to_string(),
        value: value.clone(),
    };

    match value {
        Value::Array(items) => match items.as_slice() {
            [Value::String(op), operand] if FilterOperator::parse(op).is_some() => {
                Ok(condition(op, operand))
            }
            _ if items.iter().all(|v| !v.is_array() && !v.is_object()) => Ok(condition("in", value)),
            _ => Err(NlqError::Planning(format!(
                "Unsupported filter shape for '{}': {}",
                field, value
            ))),
        },
        Value::Object(_) => Err(NlqError::Planning(format!(
            "Unsupported filter shape for '{}': {}",
            field, value
        ))),
        scalar => Ok(condition("=", scalar)),
    }
}

/// Replace a generated query with a plain listing of the top entity
fn downgrade(routed: RoutedPlan, detected: &[DetectedEntity]) -> Result<RoutedPlan> {
    let referenced = match &routed.plan {
        ExecutionPlan::GeneratedQuery(query) => query.referenced_entities.first().cloned(),
        ExecutionPlan::DirectOperation(_) => None,
    };
    if matches!(routed.plan, ExecutionPlan::DirectOperation(_)) {
        return Ok(routed);
    }

    let doctype = detected
        .first()
        .map(|d| d.entity_name.clone())
        .or(referenced)
        .ok_or_else(|| {
            NlqError::Planning(
                "Dynamic queries are disabled and no entity is available for a listing".to_string(),
            )
        })?;

    warn!("Dynamic queries are disabled, listing {} instead", doctype);
    Ok(RoutedPlan {
        plan: ExecutionPlan::DirectOperation(DirectOperation {
            operation_name: OperationKind::List.api_name().to_string(),
            parameters: OperationParameters {
                doctype: Some(doctype),
                limit: Some(DEFAULT_LIST_LIMIT),
                ..Default::default()
            },
        }),
        reasoning: format!("{} (downgraded: dynamic queries disabled)", routed.reasoning),
        proposer: routed.proposer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldDescriptor, FieldType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn catalog() -> EntityCatalog {
        EntityCatalog::from_entities(vec![
            EntitySchema::new("Customer", vec![FieldDescriptor::new("customer_name", FieldType::Data, false)]),
            EntitySchema::new("Sales Order", vec![FieldDescriptor::new("customer", FieldType::Link, false)]),
            EntitySchema::new("Purchase Order", vec![]),
        ])
        .unwrap()
    }

    fn detected(name: &str) -> DetectedEntity {
        DetectedEntity {
            entity_name: name.to_string(),
            confidence: 0.9,
            exact_match: true,
            matched_keyword: name.to_lowercase(),
        }
    }

    struct FixedProposer {
        answer: Result<PlanDocument>,
        calls: AtomicUsize,
    }

    impl FixedProposer {
        fn ok(json: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: parse_plan_document(json),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                answer: Err(NlqError::Llm("provider unavailable".to_string())),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PlanProposer for FixedProposer {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn propose_plan(&self, _request: &PlanningRequest) -> Result<PlanDocument> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.answer {
                Ok(doc) => Ok(doc.clone()),
                Err(e) => Err(NlqError::Llm(e.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_direct_api_with_filter_shapes() {
        let proposer = FixedProposer::ok(
            r#"```json
            {"execution_type": "direct_api", "api_name": "count_documents",
             "parameters": {"doctype": "Purchase Order", "filters": {"docstatus": 1, "status": ["!=", "Closed"], "supplier": ["A", "B"]}},
             "reasoning": "count"}
            ```"#,
        );
        let router = DecisionRouter::new(proposer, RouterConfig::default());
        let routed = router
            .plan("how many purchase orders are submitted?", &[detected("Purchase Order")], &catalog())
            .await
            .unwrap();

        let ExecutionPlan::DirectOperation(op) = routed.plan else {
            panic!("expected a direct operation");
        };
        assert_eq!(op.kind(), Some(OperationKind::Count));
        assert_eq!(op.parameters.doctype.as_deref(), Some("Purchase Order"));
        let ops: Vec<(&str, &str)> = op
            .parameters
            .filters
            .iter()
            .map(|f| (f.field.as_str(), f.operator.as_str()))
            .collect();
        assert_eq!(ops, vec![("docstatus", "="), ("status", "!="), ("supplier", "in")]);
        assert_eq!(routed.reasoning, "count");
    }

    #[tokio::test]
    async fn test_dynamic_query_derives_referenced_entities() {
        let proposer = FixedProposer::ok(
            r#"{"execution_type": "dynamic_query", "code": "SELECT c.name FROM `tabCustomer` c WHERE NOT EXISTS (SELECT 1 FROM `tabSalesOrder` so WHERE so.customer = c.name)"}"#,
        );
        let router = DecisionRouter::new(proposer, RouterConfig::default());
        let routed = router
            .plan("customers with no sales orders", &[detected("Customer"), detected("Sales Order")], &catalog())
            .await
            .unwrap();

        let ExecutionPlan::GeneratedQuery(query) = routed.plan else {
            panic!("expected a generated query");
        };
        assert_eq!(query.referenced_entities, vec!["Customer", "Sales Order"]);
    }

    #[tokio::test]
    async fn test_malformed_document_is_planning_error() {
        for json in [
            r#"{"execution_type": "direct_api", "parameters": {}}"#,
            r#"{"execution_type": "dynamic_query", "code": "   "}"#,
            r#"{"execution_type": "stored_procedure"}"#,
            r#"{"reasoning": "nothing"}"#,
        ] {
            let router = DecisionRouter::new(FixedProposer::ok(json), RouterConfig::default());
            let err = router.plan("q", &[detected("Customer")], &catalog()).await.unwrap_err();
            assert_eq!(err.kind_name(), "PlanningError", "for {}", json);
        }
        assert!(parse_plan_document("I cannot help with that").is_err());
    }

    #[tokio::test]
    async fn test_fallback_used_when_primary_fails() {
        let primary = FixedProposer::failing();
        let router = DecisionRouter::new(primary.clone(), RouterConfig::default())
            .with_fallback(Arc::new(RuleBasedProposer));
        let routed = router
            .plan("how many draft sales orders", &[detected("Sales Order")], &catalog())
            .await
            .unwrap();

        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(routed.proposer, "rules");
        let ExecutionPlan::DirectOperation(op) = routed.plan else {
            panic!("expected a direct operation");
        };
        assert_eq!(op.kind(), Some(OperationKind::Count));
        assert_eq!(op.parameters.filters[0].value, Value::from(0));
    }

    #[tokio::test]
    async fn test_rule_based_listing() {
        let router = DecisionRouter::new(Arc::new(RuleBasedProposer), RouterConfig::default());
        let routed = router
            .plan("get all sales orders", &[detected("Sales Order")], &catalog())
            .await
            .unwrap();
        let ExecutionPlan::DirectOperation(op) = routed.plan else {
            panic!("expected a direct operation");
        };
        assert_eq!(op.kind(), Some(OperationKind::List));
        assert_eq!(op.parameters.limit, Some(DEFAULT_LIST_LIMIT));
        assert!(op.parameters.filters.is_empty());

        let err = router.plan("get all sales orders", &[], &catalog()).await.unwrap_err();
        assert!(matches!(err, NlqError::Planning(_)));
    }

    #[tokio::test]
    async fn test_dynamic_queries_disabled_downgrades() {
        let proposer = FixedProposer::ok(r#"{"execution_type": "dynamic_query", "code": "SELECT * FROM `tabCustomer`"}"#);
        let router = DecisionRouter::new(
            proposer,
            RouterConfig {
                allow_dynamic_queries: false,
            },
        );
        let routed = router.plan("customers", &[detected("Customer")], &catalog()).await.unwrap();
        let ExecutionPlan::DirectOperation(op) = routed.plan else {
            panic!("expected a direct operation");
        };
        assert_eq!(op.operation_name, "dynamic_search");
        assert_eq!(op.parameters.doctype.as_deref(), Some("Customer"));
    }
}
