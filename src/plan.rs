//! Execution plans and the collaborator's raw plan document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The fixed set of safe parameterized operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// `dynamic_search`: filtered listing
    List,
    /// `count_documents`: filtered count
    Count,
    /// `get_document_details`: one record by name
    Get,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [OperationKind::List, OperationKind::Count, OperationKind::Get];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "dynamic_search" => Some(OperationKind::List),
            "count_documents" => Some(OperationKind::Count),
            "get_document_details" => Some(OperationKind::Get),
            _ => None,
        }
    }

    pub fn api_name(&self) -> &'static str {
        match self {
            OperationKind::List => "dynamic_search",
            OperationKind::Count => "count_documents",
            OperationKind::Get => "get_document_details",
        }
    }
}

/// Comparison allowed in a direct-operation filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    Eq,
    NotEq,
    Lt,
    Gt,
    Lte,
    Gte,
    Like,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "=" | "==" => Some(FilterOperator::Eq),
            "!=" | "<>" => Some(FilterOperator::NotEq),
            "<" => Some(FilterOperator::Lt),
            ">" => Some(FilterOperator::Gt),
            "<=" => Some(FilterOperator::Lte),
            ">=" => Some(FilterOperator::Gte),
            "like" => Some(FilterOperator::Like),
            "in" => Some(FilterOperator::In),
            "not in" => Some(FilterOperator::NotIn),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::NotEq => "!=",
            FilterOperator::Lt => "<",
            FilterOperator::Gt => ">",
            FilterOperator::Lte => "<=",
            FilterOperator::Gte => ">=",
            FilterOperator::Like => "LIKE",
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT IN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    /// Operator as proposed; checked by the validator
    pub operator: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationParameters {
    pub doctype: Option<String>,
    #[serde(default)]
    pub filters: Vec<FilterCondition>,
    pub limit: Option<i64>,
    pub order_by: Option<String>,
    /// Record name for `get_document_details`
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectOperation {
    pub operation_name: String,
    pub parameters: OperationParameters,
}

impl DirectOperation {
    pub fn kind(&self) -> Option<OperationKind> {
        OperationKind::from_name(&self.operation_name)
    }
}

impl fmt::Display for DirectOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.parameters;
        let mut args = Vec::new();
        if let Some(doctype) = &p.doctype {
            args.push(format!("doctype={:?}", doctype));
        }
        if let Some(name) = &p.name {
            args.push(format!("name={:?}", name));
        }
        if !p.filters.is_empty() {
            let filters: Vec<String> = p
                .filters
                .iter()
                .map(|c| format!("{} {} {}", c.field, c.operator, c.value))
                .collect();
            args.push(format!("filters=[{}]", filters.join(", ")));
        }
        if let Some(order_by) = &p.order_by {
            args.push(format!("order_by={:?}", order_by));
        }
        if let Some(limit) = p.limit {
            args.push(format!("limit={}", limit));
        }
        write!(f, "{}({})", self.operation_name, args.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub code: String,
    /// Catalog entities the code reads from
    pub referenced_entities: Vec<String>,
}

/// What the router hands to validation, correction and execution.
/// Stages return new values; nothing edits a plan in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionPlan {
    DirectOperation(DirectOperation),
    GeneratedQuery(GeneratedQuery),
}

impl ExecutionPlan {
    pub fn execution_type(&self) -> &'static str {
        match self {
            ExecutionPlan::DirectOperation(_) => "direct_api",
            ExecutionPlan::GeneratedQuery(_) => "dynamic_query",
        }
    }

    /// Human-readable form used as diagnostic query text
    pub fn query_text(&self) -> String {
        match self {
            ExecutionPlan::DirectOperation(op) => op.to_string(),
            ExecutionPlan::GeneratedQuery(q) => q.code.clone(),
        }
    }
}

/// The collaborator's answer, before normalization
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanDocument {
    pub execution_type: Option<String>,
    pub api_name: Option<String>,
    pub parameters: Option<Value>,
    /// Generated query code; `query` is accepted as an alias
    #[serde(alias = "query")]
    pub code: Option<String>,
    #[serde(default, alias = "doctypes")]
    pub referenced_entities: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}
