//! Plan Validator
//!
//! Rejects unsafe or incomplete plans before anything reaches the record
//! store. Direct operations are type-checked against the entity schema;
//! generated queries are checked for read-only shape and table references.

use crate::catalog::{EntityCatalog, EntitySchema, FieldDescriptor, FieldType};
use crate::error::{NlqError, Result, ValidationErrorKind};
use crate::plan::{DirectOperation, ExecutionPlan, FilterOperator, GeneratedQuery, OperationKind};
use crate::table_ref;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use sqlparser::ast::Statement;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};

lazy_static! {
    static ref WRITE_KEYWORD: Regex = Regex::new(
        r"(?i)\b(delete|drop|truncate|update|insert|alter|create|grant|revoke|commit|rollback|replace\s+into)\b"
    )
    .expect("write keyword pattern compiles");
}

#[derive(Debug, Default, Clone)]
pub struct PlanValidator;

impl PlanValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, plan: &ExecutionPlan, catalog: &EntityCatalog) -> Result<()> {
        let outcome = match plan {
            ExecutionPlan::DirectOperation(op) => self.validate_operation(op, catalog),
            ExecutionPlan::GeneratedQuery(query) => self.validate_query(query, catalog),
        };
        if let Err(e) = &outcome {
            warn!("Plan rejected: {}", e);
        }
        outcome
    }

    fn validate_operation(&self, op: &DirectOperation, catalog: &EntityCatalog) -> Result<()> {
        let kind = op.kind().ok_or_else(|| {
            NlqError::validation(
                ValidationErrorKind::UnknownOperation,
                format!(
                    "Operation '{}' is not allowed; expected one of: {}",
                    op.operation_name,
                    OperationKind::ALL.map(|k| k.api_name()).join(", ")
                ),
            )
        })?;

        let params = &op.parameters;
        let doctype = params.doctype.as_deref().ok_or_else(|| {
            NlqError::validation(
                ValidationErrorKind::MissingParameter,
                format!("Operation '{}' requires a doctype", op.operation_name),
            )
        })?;
        let entity = resolve_entity(doctype, catalog).ok_or_else(|| {
            NlqError::validation(
                ValidationErrorKind::UnknownEntity,
                format!("Entity '{}' does not exist in the catalog", doctype),
            )
        })?;

        if kind == OperationKind::Get && params.name.is_none() {
            return Err(NlqError::validation(
                ValidationErrorKind::MissingParameter,
                format!("Operation '{}' requires a record name", op.operation_name),
            ));
        }

        for condition in &params.filters {
            let field = lookup_field(entity, &condition.field)?;
            let operator = FilterOperator::parse(&condition.operator).ok_or_else(|| {
                NlqError::validation(
                    ValidationErrorKind::InvalidOperator,
                    format!(
                        "Operator '{}' on field '{}' is not supported",
                        condition.operator, condition.field
                    ),
                )
            })?;
            check_value(&field, operator, &condition.value)?;
        }

        if let Some(order_by) = &params.order_by {
            let mut parts = order_by.split_whitespace();
            let field_name = parts.next().unwrap_or_default();
            lookup_field(entity, field_name)?;
            let direction = parts.next().map(|d| d.to_lowercase());
            let valid_direction = matches!(direction.as_deref(), None | Some("asc") | Some("desc"));
            if !valid_direction || parts.next().is_some() {
                return Err(NlqError::validation(
                    ValidationErrorKind::InvalidOperator,
                    format!("order_by '{}' must be '<field> [asc|desc]'", order_by),
                ));
            }
        }

        if let Some(limit) = params.limit {
            if limit <= 0 {
                return Err(NlqError::validation(
                    ValidationErrorKind::TypeMismatch,
                    format!("limit must be positive, got {}", limit),
                ));
            }
        }

        debug!("Direct operation {} passed validation", op);
        Ok(())
    }

    fn validate_query(&self, query: &GeneratedQuery, catalog: &EntityCatalog) -> Result<()> {
        let code = query.code.trim();
        if code.is_empty() {
            return Err(NlqError::validation(
                ValidationErrorKind::MissingParameter,
                "Generated query has no code",
            ));
        }

        match Parser::parse_sql(&MySqlDialect {}, code) {
            Ok(statements) => {
                if statements.len() > 1 {
                    return Err(NlqError::validation(
                        ValidationErrorKind::UnsafeQuery,
                        format!("Generated code holds {} statements, expected one", statements.len()),
                    ));
                }
                if let Some(statement) = statements.iter().find(|s| !matches!(s, Statement::Query(_))) {
                    return Err(NlqError::validation(
                        ValidationErrorKind::UnsafeQuery,
                        format!("Only SELECT queries are allowed, got: {}", statement),
                    ));
                }
            }
            // Dialect gaps are left to the store, but only once no write keyword
            // appears outside string literals
            Err(e) => {
                debug!("Generated query did not parse ({}), checking keywords", e);
                if let Some(keyword) = write_keyword(code) {
                    return Err(NlqError::validation(
                        ValidationErrorKind::UnsafeQuery,
                        format!("Generated query contains forbidden keyword '{}'", keyword),
                    ));
                }
            }
        }

        let refs = table_ref::scan(code, catalog);
        if refs.is_empty() {
            return Err(NlqError::validation(
                ValidationErrorKind::MissingTableReference,
                "Generated query does not reference any table",
            ));
        }

        if let Some(empty) = refs.iter().find(|r| r.is_empty()) {
            return Err(NlqError::validation(
                ValidationErrorKind::EmptyTableName,
                format!(
                    "Table reference '{}' has an empty table name",
                    empty.raw(code)
                ),
            ));
        }

        if let Some(unknown) = refs
            .iter()
            .find(|r| catalog.resolve_identifier(&r.identifier).is_none())
        {
            return Err(NlqError::validation(
                ValidationErrorKind::UnknownEntity,
                format!(
                    "Table '{}' does not match any catalog entity",
                    table_ref::prefixed(&unknown.identifier)
                ),
            ));
        }

        debug!("Generated query passed validation ({} table references)", refs.len());
        Ok(())
    }
}

fn write_keyword(code: &str) -> Option<String> {
    let mut outside = code.to_string();
    for literal in table_ref::string_literals(code) {
        outside.replace_range(literal.clone(), &" ".repeat(literal.len()));
    }
    WRITE_KEYWORD.find(&outside).map(|m| m.as_str().to_string())
}

/// Canonical name first, then the normalized identifier form
pub fn resolve_entity<'a>(doctype: &str, catalog: &'a EntityCatalog) -> Option<&'a EntitySchema> {
    catalog
        .get(doctype)
        .or_else(|| catalog.resolve_identifier(doctype))
}

fn lookup_field(entity: &EntitySchema, name: &str) -> Result<FieldDescriptor> {
    entity.field(name).ok_or_else(|| {
        NlqError::validation(
            ValidationErrorKind::UnknownField,
            format!("Field '{}' does not exist on '{}'", name, entity.name),
        )
    })
}

fn check_value(field: &FieldDescriptor, operator: FilterOperator, value: &Value) -> Result<()> {
    match operator {
        FilterOperator::In | FilterOperator::NotIn => match value {
            Value::Array(items) if !items.is_empty() => {
                items.iter().try_for_each(|item| check_scalar(field, item))
            }
            _ => Err(mismatch(field, value, "a non-empty list")),
        },
        FilterOperator::Like => {
            if value.is_string() {
                Ok(())
            } else {
                Err(mismatch(field, value, "a text pattern"))
            }
        }
        _ => check_scalar(field, value),
    }
}

fn check_scalar(field: &FieldDescriptor, value: &Value) -> Result<()> {
    if value.is_null() {
        return if field.nullable {
            Ok(())
        } else {
            Err(mismatch(field, value, "a value (field is required)"))
        };
    }

    let ok = match field.field_type {
        FieldType::Int => value.is_i64() || value.is_u64(),
        FieldType::Check => value.is_boolean() || matches!(value.as_i64(), Some(0) | Some(1)),
        FieldType::Float | FieldType::Currency | FieldType::Percent => value.is_number(),
        FieldType::Date => value.as_str().map_or(false, is_date),
        FieldType::Datetime => value.as_str().map_or(false, |s| is_datetime(s) || is_date(s)),
        FieldType::Time => value.as_str().map_or(false, is_time),
        FieldType::Data
        | FieldType::Link
        | FieldType::Select
        | FieldType::Text
        | FieldType::SmallText => value.is_string(),
    };

    if ok {
        Ok(())
    } else {
        let expected = match field.field_type {
            FieldType::Int => "an integer",
            FieldType::Check => "0, 1 or a boolean",
            FieldType::Float | FieldType::Currency | FieldType::Percent => "a number",
            FieldType::Date => "a YYYY-MM-DD date",
            FieldType::Datetime => "a YYYY-MM-DD HH:MM:SS datetime",
            FieldType::Time => "a HH:MM:SS time",
            _ => "text",
        };
        Err(mismatch(field, value, expected))
    }
}

fn mismatch(field: &FieldDescriptor, value: &Value, expected: &str) -> NlqError {
    NlqError::validation(
        ValidationErrorKind::TypeMismatch,
        format!(
            "Field '{}' ({}) expects {}, got {}",
            field.name,
            field.field_type.as_str(),
            expected,
            value
        ),
    )
}

fn is_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn is_datetime(s: &str) -> bool {
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .any(|fmt| NaiveDateTime::parse_from_str(s, fmt).is_ok())
        || DateTime::parse_from_rfc3339(s).is_ok()
}

fn is_time(s: &str) -> bool {
    ["%H:%M:%S", "%H:%M"]
        .iter()
        .any(|fmt| NaiveTime::parse_from_str(s, fmt).is_ok())
}
