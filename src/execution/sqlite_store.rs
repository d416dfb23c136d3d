//! SQLite Record Store
//!
//! One table per catalog entity, named by the canonical table identifier
//! and carrying the standard fields plus the entity's own fields. Direct
//! operations are compiled to parameterized SQL; generated queries run
//! as-is. All work happens on the blocking pool behind one connection.

use crate::catalog::{EntityCatalog, EntitySchema, STANDARD_FIELDS};
use crate::error::{NlqError, Result};
use crate::execution::store::{RecordStore, Row, StoreError, StoreResult};
use crate::plan::{DirectOperation, FilterOperator, OperationKind};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
    catalog: Arc<EntityCatalog>,
}

impl SqliteRecordStore {
    pub fn in_memory(catalog: Arc<EntityCatalog>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::with_connection(conn, catalog)
    }

    pub fn open(path: impl AsRef<Path>, catalog: Arc<EntityCatalog>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(store_err)?;
        info!("Opened record store at {}", path.as_ref().display());
        Self::with_connection(conn, catalog)
    }

    fn with_connection(conn: Connection, catalog: Arc<EntityCatalog>) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            catalog,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let ddl: Vec<String> = self.catalog.entities().map(create_table_sql).collect();
        let conn = self.lock()?;
        conn.execute_batch(&ddl.join("\n")).map_err(store_err)?;
        debug!("Created {} entity tables", ddl.len());
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| NlqError::Store("Connection lock poisoned".to_string()))
    }

    /// Insert one record, filling the standard fields that are missing.
    /// Keys that are not fields of the entity are ignored. Returns the record name.
    pub fn insert(&self, doctype: &str, record: Row) -> Result<String> {
        let entity = resolve(&self.catalog, doctype)
            .ok_or_else(|| NlqError::Store(format!("Unknown entity '{}'", doctype)))?;

        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let name = record
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..10].to_string());

        let mut columns = vec!["name".to_string()];
        let mut values = vec![SqlValue::Text(name.clone())];
        for (field, default) in [
            ("docstatus", Value::from(0)),
            ("creation", Value::from(now.clone())),
            ("modified", Value::from(now)),
            ("owner", Value::from("Administrator")),
            ("modified_by", Value::from("Administrator")),
        ] {
            columns.push(field.to_string());
            values.push(to_sql(record.get(field).unwrap_or(&default)));
        }
        for (key, value) in &record {
            if is_standard(key) || !entity.has_field(key) {
                continue;
            }
            columns.push(key.clone());
            values.push(to_sql(value));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&entity.table_name()),
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            vec!["?"; columns.len()].join(", ")
        );
        let conn = self.lock()?;
        conn.execute(&sql, params_from_iter(values.iter()))
            .map_err(store_err)?;
        Ok(name)
    }

    /// A handful of customers, suppliers and orders for trying the CLI
    pub fn seed_demo_data(&self) -> Result<usize> {
        let records = serde_json::json!([
            ["Customer", {"name": "CUST-0001", "customer_name": "Acme Corp", "territory": "Europe", "docstatus": 0}],
            ["Customer", {"name": "CUST-0002", "customer_name": "Globex", "territory": "Asia", "docstatus": 0}],
            ["Customer", {"name": "CUST-0003", "customer_name": "Initech", "territory": "Europe", "docstatus": 0}],
            ["Supplier", {"name": "SUP-0001", "supplier_name": "Parts Ltd"}],
            ["Sales Order", {"name": "SO-0001", "customer": "CUST-0001", "transaction_date": "2026-09-20", "status": "To Deliver", "grand_total": 1200.0, "docstatus": 1}],
            ["Sales Order", {"name": "SO-0002", "customer": "CUST-0002", "transaction_date": "2026-10-02", "status": "Draft", "grand_total": 450.0, "docstatus": 0}],
            ["Purchase Order", {"name": "PO-0001", "supplier": "SUP-0001", "transaction_date": "2026-10-01", "status": "To Receive", "grand_total": 800.0, "docstatus": 1}],
            ["Purchase Order", {"name": "PO-0002", "supplier": "SUP-0001", "transaction_date": "2026-10-05", "status": "Draft", "grand_total": 95.5, "docstatus": 0}],
            ["Purchase Order", {"name": "PO-0003", "supplier": "SUP-0001", "transaction_date": "2026-08-11", "status": "Cancelled", "grand_total": 300.0, "docstatus": 2}]
        ]);

        let mut inserted = 0;
        for entry in records.as_array().into_iter().flatten() {
            let (Some(doctype), Some(record)) = (entry[0].as_str(), entry[1].as_object()) else {
                continue;
            };
            if resolve(&self.catalog, doctype).is_none() {
                continue;
            }
            self.insert(doctype, record.clone())?;
            inserted += 1;
        }
        info!("Seeded {} demo records", inserted);
        Ok(inserted)
    }

    async fn run_blocking<F>(&self, job: F) -> StoreResult<Vec<Row>>
    where
        F: FnOnce(&Connection) -> StoreResult<Vec<Row>> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::new("lock_poisoned", "Connection lock poisoned"))?;
            job(&guard)
        })
        .await
        .map_err(|e| StoreError::new("task_failed", format!("Store task failed: {}", e)))?
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn run_operation(&self, operation: &DirectOperation) -> StoreResult<Vec<Row>> {
        let (sql, params) = build_operation_sql(operation, &self.catalog)?;
        debug!("Direct operation SQL: {}", sql);
        let kind = operation.kind();
        let doctype = operation.parameters.doctype.clone().unwrap_or_default();
        let record_name = operation.parameters.name.clone().unwrap_or_default();

        self.run_blocking(move |conn| {
            let rows = query_rows(conn, &sql, &params).map_err(from_sqlite)?;
            if kind == Some(OperationKind::Get) && rows.is_empty() {
                return Err(StoreError::new(
                    "not_found",
                    format!("{} '{}' not found", doctype, record_name),
                ));
            }
            Ok(rows)
        })
        .await
    }

    async fn run_query(&self, code: &str) -> StoreResult<Vec<Row>> {
        let code = code.to_string();
        self.run_blocking(move |conn| query_rows(conn, &code, &[]).map_err(from_sqlite))
            .await
    }
}

fn resolve<'a>(catalog: &'a EntityCatalog, doctype: &str) -> Option<&'a EntitySchema> {
    catalog.get(doctype).or_else(|| catalog.resolve_identifier(doctype))
}

fn is_standard(field: &str) -> bool {
    STANDARD_FIELDS.iter().any(|(name, _)| *name == field)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn create_table_sql(entity: &EntitySchema) -> String {
    let mut columns = vec![
        "\"name\" TEXT PRIMARY KEY".to_string(),
        "\"docstatus\" INTEGER NOT NULL DEFAULT 0".to_string(),
        "\"creation\" TEXT".to_string(),
        "\"modified\" TEXT".to_string(),
        "\"owner\" TEXT".to_string(),
        "\"modified_by\" TEXT".to_string(),
    ];
    for field in entity.fields.iter().filter(|f| !is_standard(&f.name)) {
        columns.push(format!("{} {}", quote_ident(&field.name), field.field_type.sql_type()));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({});",
        quote_ident(&entity.table_name()),
        columns.join(", ")
    )
}

/// Parameterized SQL for a direct operation. Field names are checked
/// against the schema so only known columns are ever interpolated.
pub fn build_operation_sql(
    operation: &DirectOperation,
    catalog: &EntityCatalog,
) -> StoreResult<(String, Vec<SqlValue>)> {
    let kind = operation.kind().ok_or_else(|| {
        StoreError::new(
            "unknown_operation",
            format!("Operation '{}' is not supported", operation.operation_name),
        )
    })?;
    let p = &operation.parameters;
    let doctype = p
        .doctype
        .as_deref()
        .ok_or_else(|| StoreError::new("missing_doctype", "Operation has no doctype"))?;
    let entity = resolve(catalog, doctype).ok_or_else(|| {
        StoreError::new("no_such_table", format!("no such table: {}", crate::catalog::table_name_for(doctype)))
    })?;
    let table = quote_ident(&entity.table_name());

    let mut clauses = Vec::new();
    let mut params = Vec::new();

    if kind == OperationKind::Get {
        let name = p
            .name
            .as_deref()
            .ok_or_else(|| StoreError::new("missing_name", "get_document_details needs a name"))?;
        clauses.push("\"name\" = ?".to_string());
        params.push(SqlValue::Text(name.to_string()));
    }

    for condition in &p.filters {
        let column = known_column(entity, &condition.field)?;
        let operator = FilterOperator::parse(&condition.operator).ok_or_else(|| {
            StoreError::new(
                "invalid_operator",
                format!("Unsupported operator '{}'", condition.operator),
            )
        })?;
        match (operator, &condition.value) {
            (FilterOperator::In | FilterOperator::NotIn, Value::Array(items)) => {
                clauses.push(format!(
                    "{} {} ({})",
                    column,
                    operator.as_sql(),
                    vec!["?"; items.len()].join(", ")
                ));
                params.extend(items.iter().map(to_sql));
            }
            (FilterOperator::Eq, Value::Null) => clauses.push(format!("{} IS NULL", column)),
            (FilterOperator::NotEq, Value::Null) => clauses.push(format!("{} IS NOT NULL", column)),
            (_, value) => {
                clauses.push(format!("{} {} ?", column, operator.as_sql()));
                params.push(to_sql(value));
            }
        }
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let sql = match kind {
        OperationKind::Count => format!("SELECT COUNT(*) AS count FROM {}{}", table, where_sql),
        OperationKind::Get => format!("SELECT * FROM {}{} LIMIT 1", table, where_sql),
        OperationKind::List => {
            let mut sql = format!("SELECT * FROM {}{}", table, where_sql);
            if let Some(order_by) = &p.order_by {
                let mut parts = order_by.split_whitespace();
                let column = known_column(entity, parts.next().unwrap_or_default())?;
                let direction = match parts.next().map(|d| d.to_lowercase()).as_deref() {
                    Some("asc") => "ASC",
                    _ => "DESC",
                };
                sql.push_str(&format!(" ORDER BY {} {}", column, direction));
            }
            if let Some(limit) = p.limit {
                sql.push_str(&format!(" LIMIT {}", limit.max(1)));
            }
            sql
        }
    };

    Ok((sql, params))
}

fn known_column(entity: &EntitySchema, field: &str) -> StoreResult<String> {
    if entity.has_field(field) {
        Ok(quote_ident(field))
    } else {
        Err(StoreError::new(
            "unknown_column",
            format!("no such column: {}", field),
        ))
    }
}

fn query_rows(conn: &Connection, sql: &str, params: &[SqlValue]) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (idx, column) in columns.iter().enumerate() {
            record.insert(column.clone(), to_json(row.get_ref(idx)?));
        }
        out.push(record);
    }
    Ok(out)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::from(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::from(format!("<{} bytes>", bytes.len())),
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Map a driver error onto the store's structured error
fn from_sqlite(error: rusqlite::Error) -> StoreError {
    let message = error.to_string();
    let lower = message.to_lowercase();
    let code = if lower.contains("no such table") {
        "no_such_table".to_string()
    } else if lower.contains("no such column") {
        "no_such_column".to_string()
    } else if lower.contains("syntax error") {
        "syntax_error".to_string()
    } else if let rusqlite::Error::SqliteFailure(failure, _) = &error {
        format!("sqlite_{}", failure.extended_code)
    } else {
        "sqlite_error".to_string()
    };
    StoreError::new(code, message)
}

fn store_err(error: rusqlite::Error) -> NlqError {
    NlqError::Store(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{FilterCondition, OperationParameters};

    fn store() -> SqliteRecordStore {
        let catalog = Arc::new(EntityCatalog::builtin().unwrap());
        let store = SqliteRecordStore::in_memory(catalog).unwrap();
        store.seed_demo_data().unwrap();
        store
    }

    fn operation(name: &str, doctype: &str, filters: Vec<(&str, &str, Value)>) -> DirectOperation {
        DirectOperation {
            operation_name: name.to_string(),
            parameters: OperationParameters {
                doctype: Some(doctype.to_string()),
                filters: filters
                    .into_iter()
                    .map(|(f, o, v)| FilterCondition {
                        field: f.to_string(),
                        operator: o.to_string(),
                        value: v,
                    })
                    .collect(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_count_with_filter() {
        let store = store();
        let rows = store
            .run_operation(&operation("count_documents", "Purchase Order", vec![("docstatus", "=", Value::from(1))]))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["count"], Value::from(1));
    }

    #[tokio::test]
    async fn test_list_with_order_and_in() {
        let store = store();
        let mut op = operation(
            "dynamic_search",
            "Purchase Order",
            vec![("status", "in", serde_json::json!(["Draft", "To Receive"]))],
        );
        op.parameters.order_by = Some("grand_total asc".to_string());
        op.parameters.limit = Some(10);
        let rows = store.run_operation(&op).await.unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["PO-0002", "PO-0001"]);
    }

    #[tokio::test]
    async fn test_get_missing_record() {
        let store = store();
        let mut op = operation("get_document_details", "Customer", vec![]);
        op.parameters.name = Some("CUST-9999".to_string());
        let err = store.run_operation(&op).await.unwrap_err();
        assert_eq!(err.code, "not_found");

        op.parameters.name = Some("CUST-0002".to_string());
        let rows = store.run_operation(&op).await.unwrap();
        assert_eq!(rows[0]["customer_name"], Value::from("Globex"));
    }

    #[tokio::test]
    async fn test_generated_query_and_missing_table() {
        let store = store();
        let rows = store
            .run_query("SELECT c.name FROM `tabCustomer` c WHERE NOT EXISTS (SELECT 1 FROM `tabSalesOrder` so WHERE so.customer = c.name) ORDER BY c.name")
            .await
            .unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["CUST-0003"]);

        let err = store.run_query("SELECT * FROM `tab`").await.unwrap_err();
        assert_eq!(err.code, "no_such_table");
        assert!(err.message.contains("tab"));
    }

    #[test]
    fn test_unknown_filter_column_is_rejected() {
        let catalog = EntityCatalog::builtin().unwrap();
        let err = build_operation_sql(
            &operation("count_documents", "Customer", vec![("1=1; --", "=", Value::from(1))]),
            &catalog,
        )
        .unwrap_err();
        assert_eq!(err.code, "unknown_column");
    }
}
