//! Entity Catalog
//!
//! Static mapping of DocType name to field schema. Loaded once at startup
//! and shared read-only (behind an `Arc`) by every pipeline stage.

use crate::error::{NlqError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

/// Prefix the record layer puts in front of every canonical table name
pub const TABLE_PREFIX: &str = "tab";

/// Fields every DocType carries regardless of its own schema
pub const STANDARD_FIELDS: &[(&str, FieldType)] = &[
    ("name", FieldType::Data),
    ("docstatus", FieldType::Int),
    ("creation", FieldType::Datetime),
    ("modified", FieldType::Datetime),
    ("owner", FieldType::Data),
    ("modified_by", FieldType::Data),
];

const BUILTIN_CATALOG: &str = include_str!("../metadata/doctypes.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Data,
    Link,
    Select,
    Text,
    #[serde(rename = "Small Text")]
    SmallText,
    Int,
    Float,
    Currency,
    Percent,
    Check,
    Date,
    Datetime,
    Time,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Data => "Data",
            FieldType::Link => "Link",
            FieldType::Select => "Select",
            FieldType::Text => "Text",
            FieldType::SmallText => "Small Text",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Currency => "Currency",
            FieldType::Percent => "Percent",
            FieldType::Check => "Check",
            FieldType::Date => "Date",
            FieldType::Datetime => "Datetime",
            FieldType::Time => "Time",
        }
    }

    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            FieldType::Data | FieldType::Link | FieldType::Select | FieldType::Text | FieldType::SmallText
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Int | FieldType::Float | FieldType::Currency | FieldType::Percent | FieldType::Check
        )
    }

    /// Column affinity used by the SQLite store
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Int | FieldType::Check => "INTEGER",
            FieldType::Float | FieldType::Currency | FieldType::Percent => "REAL",
            _ => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Link target or select choices, as the record layer reports them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

fn default_nullable() -> bool {
    true
}

impl FieldDescriptor {
    pub fn new(name: &str, field_type: FieldType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            nullable,
            label: None,
            options: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    /// Extra phrases that also identify this entity ("client" for Customer)
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl EntitySchema {
    pub fn new(name: &str, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.to_string(),
            fields,
            aliases: Vec::new(),
        }
    }

    /// Canonical storage identifier, e.g. "Purchase Order" -> "tabPurchaseOrder"
    pub fn table_name(&self) -> String {
        table_name_for(&self.name)
    }

    /// Own field or one of the standard fields
    pub fn field(&self, name: &str) -> Option<FieldDescriptor> {
        if let Some(field) = self.fields.iter().find(|f| f.name == name) {
            return Some(field.clone());
        }
        STANDARD_FIELDS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(n, t)| FieldDescriptor::new(n, *t, *n != "name"))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

pub fn table_name_for(entity_name: &str) -> String {
    let compact: String = entity_name.split_whitespace().collect();
    format!("{}{}", TABLE_PREFIX, compact)
}

/// Case, whitespace, `_` and `-` insensitive form used for identifier lookups
pub fn normalize_identifier(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    entities: Vec<EntitySchema>,
}

#[derive(Debug, Clone)]
pub struct EntityCatalog {
    entities: BTreeMap<String, EntitySchema>,
    by_identifier: HashMap<String, String>,
}

impl EntityCatalog {
    pub fn from_entities(entities: Vec<EntitySchema>) -> Result<Self> {
        let mut map = BTreeMap::new();
        let mut by_identifier = HashMap::new();

        for entity in entities {
            let name = entity.name.trim().to_string();
            if name.is_empty() {
                return Err(NlqError::Catalog("Entity with an empty name".to_string()));
            }
            let key = normalize_identifier(&name);
            if let Some(existing) = by_identifier.get(&key) {
                return Err(NlqError::Catalog(format!(
                    "Entity '{}' collides with '{}' (both map to table '{}')",
                    name,
                    existing,
                    table_name_for(&name)
                )));
            }
            by_identifier.insert(key, name.clone());
            map.insert(name.clone(), EntitySchema { name, ..entity });
        }

        Ok(Self {
            entities: map,
            by_identifier,
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json)
            .map_err(|e| NlqError::Catalog(format!("Failed to parse catalog: {}", e)))?;
        Self::from_entities(file.entities)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(&raw)?;
        info!(
            "Loaded {} entities from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// The common ERP DocTypes bundled with the crate
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CATALOG)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&EntitySchema> {
        self.entities.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Entities in name order
    pub fn entities(&self) -> impl Iterator<Item = &EntitySchema> {
        self.entities.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    /// Entity whose normalized name equals the normalized identifier
    /// ("SalesOrder", "sales order", "Sales_Order" all resolve)
    pub fn resolve_identifier(&self, identifier: &str) -> Option<&EntitySchema> {
        let key = normalize_identifier(identifier);
        if key.is_empty() {
            return None;
        }
        self.by_identifier
            .get(&key)
            .and_then(|name| self.entities.get(name))
    }

    /// Same as `resolve_identifier` but for a full table name with prefix
    pub fn resolve_table_name(&self, table: &str) -> Option<&EntitySchema> {
        let trimmed = table.trim().trim_matches('`').trim_matches('"');
        let ident = trimmed.strip_prefix(TABLE_PREFIX).unwrap_or(trimmed);
        self.resolve_identifier(ident)
    }
}
