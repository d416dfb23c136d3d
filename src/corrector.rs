//! Query Corrector
//!
//! Deterministic rewrite pass over the table-reference tokens of a
//! generated query (see `table_ref` for the token shapes). Each token is
//! repaired at most once and every repaired token is written back in the
//! canonical `` `tab<Name>` `` form, so a second pass finds nothing left
//! to change.
//!
//! Repairs, per token:
//! 1. empty identifier: the top detected entity's table
//! 2. identifier resolving after case/space normalization: canonical table
//! 3. plural identifier ("SalesOrders"): canonical table of the singular
//! 4. close misspelling (Jaro-Winkler over normalized names): canonical table
//!
//! Tokens matching none of these are left as they are for the validator
//! to report.

use crate::catalog::{normalize_identifier, table_name_for, EntityCatalog, EntitySchema};
use crate::config::CorrectorConfig;
use crate::detector::DetectedEntity;
use crate::error::{NlqError, Result};
use crate::plan::{ExecutionPlan, GeneratedQuery};
use crate::table_ref::{self, TableRef};
use std::cmp::Ordering;
use strsim::jaro_winkler;
use tracing::{debug, info};

pub struct QueryCorrector {
    config: CorrectorConfig,
}

impl Default for QueryCorrector {
    fn default() -> Self {
        Self::new(CorrectorConfig::default())
    }
}

impl QueryCorrector {
    pub fn new(config: CorrectorConfig) -> Self {
        Self { config }
    }

    /// Repaired copy of `plan`. Direct operations pass through unchanged.
    pub fn correct(
        &self,
        plan: &ExecutionPlan,
        detected: &[DetectedEntity],
        catalog: &EntityCatalog,
    ) -> Result<ExecutionPlan> {
        let ExecutionPlan::GeneratedQuery(query) = plan else {
            return Ok(plan.clone());
        };

        let refs = table_ref::scan(&query.code, catalog);
        let fallback = top_table(detected, catalog);
        if fallback.is_none() {
            if let Some(empty) = refs.iter().find(|r| r.is_empty()) {
                return Err(NlqError::Correction(format!(
                    "Table reference '{}' is empty and no entity was detected to fill it; name the document type explicitly",
                    empty.raw(&query.code)
                )));
            }
        }

        let code = table_ref::rewrite(&query.code, &refs, |table_ref| {
            let repaired = if table_ref.is_empty() {
                fallback.clone()
            } else {
                self.repair_identifier(&table_ref.identifier, catalog)
                    .map(|entity| entity.table_name())
            };
            if let Some(table) = &repaired {
                let before = table_ref.raw(&query.code);
                if before != table_ref::quote_table(table) {
                    info!("Corrected table reference {} -> `{}`", before, table);
                }
            }
            repaired
        });

        if let Some(empty) = table_ref::scan(&code, catalog).iter().find(|r| r.is_empty()) {
            return Err(NlqError::Correction(format!(
                "Table reference '{}' is still empty after correction",
                empty.raw(&code)
            )));
        }

        let referenced_entities = table_ref::referenced_entities(&code, catalog);
        debug!("Corrected query references {:?}", referenced_entities);
        Ok(ExecutionPlan::GeneratedQuery(GeneratedQuery {
            code,
            referenced_entities,
        }))
    }

    /// Catalog entity an identifier most plausibly meant
    pub fn repair_identifier<'a>(&self, identifier: &str, catalog: &'a EntityCatalog) -> Option<&'a EntitySchema> {
        if let Some(entity) = catalog.resolve_identifier(identifier) {
            return Some(entity);
        }

        let normalized = normalize_identifier(identifier);
        for suffix in ["es", "s"] {
            if let Some(singular) = normalized.strip_suffix(suffix) {
                if let Some(entity) = catalog.resolve_identifier(singular) {
                    return Some(entity);
                }
            }
        }

        let mut best: Option<(f64, &EntitySchema)> = None;
        for entity in catalog.entities() {
            let score = jaro_winkler(&normalized, &normalize_identifier(&entity.name));
            if score < self.config.fuzzy_threshold {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_score, best_entity)) => match score.total_cmp(&best_score) {
                    Ordering::Greater => true,
                    // More specific name wins a tie
                    Ordering::Equal => entity.name.len() > best_entity.name.len(),
                    Ordering::Less => false,
                },
            };
            if better {
                best = Some((score, entity));
            }
        }

        best.map(|(score, entity)| {
            debug!("Fuzzy matched '{}' to {} ({:.3})", identifier, entity.name, score);
            entity
        })
    }
}

/// Table of the highest-ranked detected entity
pub fn top_table(detected: &[DetectedEntity], catalog: &EntityCatalog) -> Option<String> {
    detected.first().map(|d| {
        catalog
            .get(&d.entity_name)
            .map(|e| e.table_name())
            .unwrap_or_else(|| table_name_for(&d.entity_name))
    })
}

/// Point every reference selected by `targets` at `table`.
/// Used by the execution guard for its narrower retry repair.
pub fn retarget<F>(code: &str, catalog: &EntityCatalog, table: &str, targets: F) -> String
where
    F: Fn(&TableRef) -> bool,
{
    let refs = table_ref::scan(code, catalog);
    table_ref::rewrite(code, &refs, |r| {
        if targets(r) {
            Some(table.to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldDescriptor, FieldType};
    use crate::plan::DirectOperation;

    fn catalog() -> EntityCatalog {
        EntityCatalog::from_entities(vec![
            EntitySchema::new("Purchase Order", vec![FieldDescriptor::new("supplier", FieldType::Link, false)]),
            EntitySchema::new("Sales Order", vec![]),
            EntitySchema::new("Sales Order Item", vec![]),
            EntitySchema::new("Customer", vec![]),
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

    fn query(code: &str) -> ExecutionPlan {
        ExecutionPlan::GeneratedQuery(GeneratedQuery {
            code: code.to_string(),
            referenced_entities: vec![],
        })
    }

    fn corrected_code(code: &str, detected: &[DetectedEntity]) -> String {
        match QueryCorrector::default().correct(&query(code), detected, &catalog()).unwrap() {
            ExecutionPlan::GeneratedQuery(q) => q.code,
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_empty_reference_takes_top_entity() {
        let plan = query("SELECT name FROM `tab` WHERE docstatus = 1");
        let fixed = QueryCorrector::default()
            .correct(&plan, &[detected("Purchase Order")], &catalog())
            .unwrap();
        let ExecutionPlan::GeneratedQuery(q) = &fixed else {
            panic!("expected a generated query");
        };
        assert_eq!(q.code, "SELECT name FROM `tabPurchaseOrder` WHERE docstatus = 1");
        assert_eq!(q.referenced_entities, vec!["Purchase Order"]);
        // input plan untouched
        assert_eq!(plan, query("SELECT name FROM `tab` WHERE docstatus = 1"));
    }

    #[test]
    fn test_every_empty_shape_is_filled() {
        let code = corrected_code(
            r#"SELECT * FROM tab'' a JOIN "tab " b JOIN tab c"#,
            &[detected("Customer")],
        );
        assert_eq!(code, "SELECT * FROM `tabCustomer` a JOIN `tabCustomer` b JOIN `tabCustomer` c");
    }

    #[test]
    fn test_spacing_and_case_normalized() {
        let code = corrected_code(
            "SELECT * FROM `tabSales Order` so JOIN tabsalesorderitem soi ON soi.parent = so.name",
            &[],
        );
        assert_eq!(
            code,
            "SELECT * FROM `tabSalesOrder` so JOIN `tabSalesOrderItem` soi ON soi.parent = so.name"
        );
    }

    #[test]
    fn test_plural_and_misspelling_repaired() {
        assert_eq!(corrected_code("SELECT * FROM `tabCustomers`", &[]), "SELECT * FROM `tabCustomer`");
        assert_eq!(
            corrected_code("SELECT * FROM `tabPurchaseOrdr`", &[]),
            "SELECT * FROM `tabPurchaseOrder`"
        );
    }

    #[test]
    fn test_string_literals_left_alone() {
        let code = "SELECT name FROM `tabCustomer` WHERE customer_name LIKE '%tab%'";
        assert_eq!(corrected_code(code, &[detected("Customer")]), code);

        let code = r#"SELECT name FROM `tab` WHERE supplier = "tablet" OR supplier = 'tab'"#;
        assert_eq!(
            corrected_code(code, &[detected("Purchase Order")]),
            r#"SELECT name FROM `tabPurchaseOrder` WHERE supplier = "tablet" OR supplier = 'tab'"#
        );
    }

    #[test]
    fn test_unknown_reference_left_alone() {
        let code = "SELECT * FROM `tabWarehouse`";
        assert_eq!(corrected_code(code, &[detected("Customer")]), code);
    }

    #[test]
    fn test_empty_without_detected_entity_fails() {
        let err = QueryCorrector::default()
            .correct(&query("SELECT * FROM `tab`"), &[], &catalog())
            .unwrap_err();
        assert!(matches!(err, NlqError::Correction(_)));
        assert!(err.to_string().contains("`tab`"));
    }

    #[test]
    fn test_idempotent() {
        let detected = [detected("Sales Order")];
        let corrector = QueryCorrector::default();
        let once = corrector
            .correct(&query("SELECT * FROM `tab` x JOIN tabcustomers c JOIN \"tabSales Order Item\" i"), &detected, &catalog())
            .unwrap();
        let twice = corrector.correct(&once, &detected, &catalog()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_direct_operation_passes_through() {
        let plan = ExecutionPlan::DirectOperation(DirectOperation {
            operation_name: "dynamic_search".to_string(),
            parameters: Default::default(),
        });
        assert_eq!(QueryCorrector::default().correct(&plan, &[], &catalog()).unwrap(), plan);
    }

    #[test]
    fn test_retarget_only_selected_references() {
        let code = "SELECT * FROM `tabSalesOrdr` JOIN `tabCustomer` c";
        let out = retarget(code, &catalog(), "tabSalesOrder", |r| r.identifier == "SalesOrdr");
        assert_eq!(out, "SELECT * FROM `tabSalesOrder` JOIN `tabCustomer` c");
    }
}
