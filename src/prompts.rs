//! Planning Prompts - instructions handed to the reasoning collaborator
//!
//! The system prompt is fixed; the user message carries the question and
//! the schemas of the detected entities.

use crate::catalog::EntitySchema;
use crate::detector::DetectedEntity;
use crate::plan::OperationKind;
use itertools::Itertools;

/// Fields listed per entity before the schema section is cut off
pub const MAX_SCHEMA_FIELDS: usize = 30;

/// System prompt for the planning collaborator
pub const PLANNER_SYSTEM_PROMPT: &str = r#"You are a query planner for an ERP record database.

## Your Role

Turn one user question into exactly one execution plan. You never run anything yourself.

## Execution Types

1. **direct_api**: a safe, parameterized operation. Use it for simple listing, counting and filtering on ONE entity.
2. **dynamic_query**: a read-only SQL SELECT. Use it only for joins, aggregates, negation across entities ("customers with no orders") or comparisons between entities.

Prefer direct_api whenever the question fits it.

## Table Naming

Every entity is stored in a table named `tab` + the entity name with spaces removed, always in backticks:
- "Sales Order" -> `tabSalesOrder`
- "Customer" -> `tabCustomer`

Never write an empty table name such as `tab` or `tab''`. Only use the entities listed in the schema section.

## Standard Fields

Every table has: name, docstatus (0 = draft, 1 = submitted, 2 = cancelled), creation, modified, owner, modified_by.

## Rules

- Only SELECT statements. Never INSERT, UPDATE, DELETE, DROP or ALTER.
- Use only fields listed in the schema section or the standard fields.
- When a question names a specific multi-word entity ("sales order"), plan for that entity, not for other entities sharing a word with it.
- Answer with the JSON object only."#;

/// `api_name -> description` for every allowed direct operation
pub fn operation_catalogue() -> String {
    OperationKind::ALL
        .iter()
        .map(|kind| {
            let description = match kind {
                OperationKind::List => {
                    "list records. parameters: doctype, filters, limit, order_by"
                }
                OperationKind::Count => "count records. parameters: doctype, filters",
                OperationKind::Get => "fetch one record by name. parameters: doctype, name",
            };
            format!("- {}: {}", kind.api_name(), description)
        })
        .join("\n")
}

/// Schema section for the detected entities, in detection order
pub fn schema_section(entities: &[(DetectedEntity, EntitySchema)]) -> String {
    if entities.is_empty() {
        return "No entities were detected.".to_string();
    }

    entities
        .iter()
        .map(|(detected, schema)| {
            let mut block = format!(
                "### {} (table `{}`, confidence {:.1})\n",
                schema.name,
                schema.table_name(),
                detected.confidence
            );
            let fields = schema
                .fields
                .iter()
                .take(MAX_SCHEMA_FIELDS)
                .map(|f| {
                    let required = if f.nullable { "" } else { " [REQUIRED]" };
                    match &f.options {
                        Some(options) if !options.is_empty() => format!(
                            "- {} ({}){} options: {}",
                            f.name,
                            f.field_type.as_str(),
                            required,
                            options.replace('\n', " | ")
                        ),
                        _ => format!("- {} ({}){}", f.name, f.field_type.as_str(), required),
                    }
                })
                .join("\n");
            block.push_str(&fields);
            if schema.fields.len() > MAX_SCHEMA_FIELDS {
                block.push_str(&format!(
                    "\n- ... {} more fields",
                    schema.fields.len() - MAX_SCHEMA_FIELDS
                ));
            }
            block
        })
        .join("\n\n")
}

const WORKED_EXAMPLES: &str = r#"## Examples

Question: "get all sales orders"
```json
{"execution_type": "direct_api", "api_name": "dynamic_search", "parameters": {"doctype": "Sales Order", "limit": 20}, "reasoning": "Simple listing of one entity"}
```

Question: "how many purchase orders are submitted?"
```json
{"execution_type": "direct_api", "api_name": "count_documents", "parameters": {"doctype": "Purchase Order", "filters": {"docstatus": 1}}, "reasoning": "Filtered count on one entity"}
```

Question: "customers with no sales orders in last 1 month"
```json
{"execution_type": "dynamic_query", "code": "SELECT c.name, c.customer_name FROM `tabCustomer` c WHERE NOT EXISTS (SELECT 1 FROM `tabSalesOrder` so WHERE so.customer = c.name AND so.transaction_date >= DATE('now', '-1 month'))", "referenced_entities": ["Customer", "Sales Order"], "reasoning": "Negation across two entities needs a subquery"}
```

Question: "show sales order totals above 1000" (detected: Sales Order, Purchase Order, Work Order)
```json
{"execution_type": "direct_api", "api_name": "dynamic_search", "parameters": {"doctype": "Sales Order", "filters": {"grand_total": [">", 1000]}, "order_by": "grand_total desc", "limit": 20}, "reasoning": "The question names 'sales order' explicitly, so the other order entities are ignored"}
```"#;

const RESPONSE_FORMAT: &str = r#"## Response Format

Return one JSON object:
{
  "execution_type": "direct_api" | "dynamic_query",
  "api_name": "<operation, direct_api only>",
  "parameters": {"doctype": "...", "filters": {"field": value or ["operator", value]}, "limit": 20, "order_by": "field desc", "name": "..."},
  "code": "<SELECT statement, dynamic_query only>",
  "referenced_entities": ["<entity names used in code>"],
  "reasoning": "<one sentence>"
}
Filter operators: =, !=, <, >, <=, >=, like, in, not in."#;

/// The user-turn message: question, schemas, operations, examples, format
pub fn build_planning_prompt(query: &str, entities: &[(DetectedEntity, EntitySchema)]) -> String {
    format!(
        "## Question\n\n{}\n\n## Detected Entities\n\n{}\n\n## Direct Operations\n\n{}\n\n{}\n\n{}",
        query.trim(),
        schema_section(entities),
        operation_catalogue(),
        WORKED_EXAMPLES,
        RESPONSE_FORMAT
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldDescriptor, FieldType};

    fn detected(name: &str) -> DetectedEntity {
        DetectedEntity {
            entity_name: name.to_string(),
            confidence: 0.9,
            exact_match: true,
            matched_keyword: name.to_lowercase(),
        }
    }

    #[test]
    fn test_schema_section_marks_required_and_truncates() {
        let mut fields = vec![FieldDescriptor::new("customer", FieldType::Link, false)];
        for i in 0..40 {
            fields.push(FieldDescriptor::new(&format!("field_{}", i), FieldType::Data, true));
        }
        let schema = EntitySchema::new("Sales Order", fields);
        let section = schema_section(&[(detected("Sales Order"), schema)]);

        assert!(section.contains("table `tabSalesOrder`"));
        assert!(section.contains("- customer (Link) [REQUIRED]"));
        assert!(section.contains("field_28"));
        assert!(!section.contains("field_29 "));
        assert!(section.contains("11 more fields"));
    }

    #[test]
    fn test_prompt_carries_question_and_examples() {
        let schema = EntitySchema::new("Customer", vec![]);
        let prompt = build_planning_prompt("  customers with no orders ", &[(detected("Customer"), schema)]);
        assert!(prompt.starts_with("## Question\n\ncustomers with no orders\n"));
        assert!(prompt.contains("count_documents: count records"));
        assert!(prompt.contains("NOT EXISTS"));
        assert!(prompt.contains("\"execution_type\": \"direct_api\" | \"dynamic_query\""));
    }
}
