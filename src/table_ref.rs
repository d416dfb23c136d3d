//! Table-reference tokens in generated query code.
//!
//! This is not a SQL parser. It recognises exactly these shapes:
//!
//! | shape          | example               | identifier        |
//! |----------------|-----------------------|-------------------|
//! | backtick       | `` `tabSales Order` `` | `Sales Order`     |
//! | double quote   | `"tabSalesOrder"`     | `SalesOrder`      |
//! | bare           | `tabSalesOrder`       | `SalesOrder`      |
//! | empty literal  | `tab''`, `tab""`      | (empty)           |
//!
//! Bare and double-quoted tokens only count as table references when
//! their identifier is empty, starts with an uppercase letter or digit, or
//! resolves to a catalog entity. This keeps ordinary words such as `table`
//! and values such as `"tablet"` out. A lone bare `tab` is only a
//! reference right after `FROM` or `JOIN`. A quoted token whose identifier
//! is blank or whitespace-only is empty.
//!
//! Nothing inside a single-quoted string literal is ever a reference.

use crate::catalog::{EntityCatalog, TABLE_PREFIX};
use lazy_static::lazy_static;
use regex::Regex;
use std::ops::Range;

lazy_static! {
    static ref TABLE_REF: Regex = Regex::new(
        r#"`tab(?P<backtick>[^`]*)`|"tab(?P<dquote>[^"]*)"|\btab(?P<literal>''|"")|\btab(?P<bare>[A-Za-z0-9_]*)"#
    )
    .expect("table reference pattern compiles");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefShape {
    Backtick,
    DoubleQuote,
    Bare,
    EmptyLiteral,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Byte range of the whole token, quotes included
    pub span: Range<usize>,
    pub shape: RefShape,
    /// Text after the prefix, untrimmed
    pub identifier: String,
}

impl TableRef {
    pub fn is_empty(&self) -> bool {
        self.identifier.trim().is_empty()
    }

    /// Token as it appears in the code
    pub fn raw<'a>(&self, code: &'a str) -> &'a str {
        &code[self.span.clone()]
    }
}

/// All table references in `code`, in order of appearance
pub fn scan(code: &str, catalog: &EntityCatalog) -> Vec<TableRef> {
    let mut refs = Vec::new();
    let literals = string_literals(code);

    for caps in TABLE_REF.captures_iter(code) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if literals.iter().any(|l| l.contains(&whole.start())) {
            continue;
        }
        let (shape, identifier) = if let Some(m) = caps.name("backtick") {
            (RefShape::Backtick, m.as_str())
        } else if let Some(m) = caps.name("dquote") {
            let ident = m.as_str();
            if !is_bare_reference(ident.trim(), catalog) {
                continue;
            }
            (RefShape::DoubleQuote, ident)
        } else if caps.name("literal").is_some() {
            (RefShape::EmptyLiteral, "")
        } else if let Some(m) = caps.name("bare") {
            let ident = m.as_str();
            if ident.is_empty() && !in_table_position(code, whole.start()) {
                continue;
            }
            if !is_bare_reference(ident, catalog) {
                continue;
            }
            (RefShape::Bare, ident)
        } else {
            continue;
        };

        refs.push(TableRef {
            span: whole.range(),
            shape,
            identifier: identifier.to_string(),
        });
    }

    refs
}

fn is_bare_reference(ident: &str, catalog: &EntityCatalog) -> bool {
    match ident.chars().next() {
        None => true,
        Some(c) if c.is_ascii_uppercase() || c.is_ascii_digit() => true,
        Some(_) => catalog.resolve_identifier(ident).is_some(),
    }
}

/// Whether the token at `start` follows `FROM` or `JOIN`
fn in_table_position(code: &str, start: usize) -> bool {
    let before = code[..start].trim_end();
    let keyword = before
        .rsplit(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default();
    keyword.eq_ignore_ascii_case("from") || keyword.eq_ignore_ascii_case("join")
}

/// Byte ranges of single-quoted string literals, quotes included.
///
/// Backtick and double-quoted segments are stepped over so an apostrophe
/// inside them does not open a literal, and the `''` of an empty `tab''`
/// token is not a literal either.
pub fn string_literals(code: &str) -> Vec<Range<usize>> {
    let bytes = code.as_bytes();
    let mut literals = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'`' | b'"') => {
                i = bytes[i + 1..]
                    .iter()
                    .position(|&b| b == quote)
                    .map_or(bytes.len(), |offset| i + offset + 2);
            }
            b'\'' if is_empty_table_literal(code, i) => i += 2,
            b'\'' => {
                let end = literal_end(bytes, i + 1);
                literals.push(i..end);
                i = end;
            }
            _ => i += 1,
        }
    }

    literals
}

/// End (exclusive) of a single-quoted literal whose body starts at `from`
fn literal_end(bytes: &[u8], from: usize) -> usize {
    let mut j = from;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b'\'' if bytes.get(j + 1) == Some(&b'\'') => j += 2,
            b'\'' => return j + 1,
            _ => j += 1,
        }
    }
    bytes.len()
}

fn is_empty_table_literal(code: &str, quote: usize) -> bool {
    let bytes = code.as_bytes();
    if bytes.get(quote + 1) != Some(&b'\'') || !code[..quote].ends_with(TABLE_PREFIX) {
        return false;
    }
    let start = quote - TABLE_PREFIX.len();
    !code[..start].chars().next_back().map_or(false, |c| c.is_alphanumeric() || c == '_')
}

/// Catalog entities named by the references in `code`, first mention first
pub fn referenced_entities(code: &str, catalog: &EntityCatalog) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for table_ref in scan(code, catalog) {
        if let Some(entity) = catalog.resolve_identifier(&table_ref.identifier) {
            if !names.contains(&entity.name) {
                names.push(entity.name.clone());
            }
        }
    }
    names
}

/// Rebuild `code`, replacing every reference for which `replace` returns
/// `Some(table)` with `` `table` ``. Other text is copied unchanged.
pub fn rewrite<F>(code: &str, refs: &[TableRef], mut replace: F) -> String
where
    F: FnMut(&TableRef) -> Option<String>,
{
    let mut out = String::with_capacity(code.len());
    let mut cursor = 0;

    for table_ref in refs {
        if let Some(table) = replace(table_ref) {
            out.push_str(&code[cursor..table_ref.span.start]);
            out.push_str(&quote_table(&table));
            cursor = table_ref.span.end;
        }
    }
    out.push_str(&code[cursor..]);
    out
}

/// `` `tabSalesOrder` `` for a canonical table name
pub fn quote_table(table: &str) -> String {
    format!("`{}`", table)
}

/// Full token text with the prefix, e.g. "tabSales Order"
pub fn prefixed(identifier: &str) -> String {
    format!("{}{}", TABLE_PREFIX, identifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EntitySchema;

    fn catalog() -> EntityCatalog {
        EntityCatalog::from_entities(vec![
            EntitySchema::new("Sales Order", vec![]),
            EntitySchema::new("Customer", vec![]),
        ])
        .unwrap()
    }

    fn idents(code: &str) -> Vec<(RefShape, String)> {
        scan(code, &catalog())
            .into_iter()
            .map(|r| (r.shape, r.identifier))
            .collect()
    }

    #[test]
    fn test_recognised_shapes() {
        let code = r#"SELECT * FROM `tabSales Order` so JOIN "tabCustomer" c JOIN tabItem i JOIN tab'' x"#;
        assert_eq!(
            idents(code),
            vec![
                (RefShape::Backtick, "Sales Order".to_string()),
                (RefShape::DoubleQuote, "Customer".to_string()),
                (RefShape::Bare, "Item".to_string()),
                (RefShape::EmptyLiteral, String::new()),
            ]
        );
    }

    #[test]
    fn test_empty_references() {
        let refs = scan("SELECT name FROM `tab` WHERE x IN (SELECT y FROM `tab  `) OR z FROM tab", &catalog());
        assert_eq!(refs.len(), 3);
        assert!(refs.iter().all(|r| r.is_empty()));
    }

    #[test]
    fn test_ordinary_words_are_ignored() {
        assert!(idents("SELECT tabulated FROM stable_table WHERE table_name = 'x'").is_empty());
        // lowercase bare identifiers count only when they resolve
        assert_eq!(
            idents("SELECT * FROM tabsalesorder"),
            vec![(RefShape::Bare, "salesorder".to_string())]
        );
    }

    #[test]
    fn test_string_literals_are_not_references() {
        assert_eq!(
            idents("SELECT name FROM `tabCustomer` WHERE customer_name LIKE '%tab%'"),
            vec![(RefShape::Backtick, "Customer".to_string())]
        );
        assert_eq!(
            idents("SELECT name FROM `tabCustomer` WHERE note = 'see tabSalesOrder and `tab`'"),
            vec![(RefShape::Backtick, "Customer".to_string())]
        );
        // escaped quotes keep the literal open
        assert_eq!(
            idents("SELECT name FROM `tabCustomer` WHERE note = 'it''s tab' OR x = 'o\\'tab'"),
            vec![(RefShape::Backtick, "Customer".to_string())]
        );
    }

    #[test]
    fn test_double_quoted_values_need_reference_shape() {
        assert_eq!(
            idents(r#"SELECT name FROM `tabCustomer` WHERE item_name = "tablet""#),
            vec![(RefShape::Backtick, "Customer".to_string())]
        );
        assert_eq!(
            idents(r#"SELECT name FROM "tab " x"#),
            vec![(RefShape::DoubleQuote, " ".to_string())]
        );
    }

    #[test]
    fn test_lone_tab_only_in_table_position() {
        assert_eq!(idents("SELECT tab, name FROM `tabCustomer` WHERE kind = tab").len(), 1);
        let refs = scan("SELECT * FROM tab a LEFT JOIN tab b ON a.x = b.x", &catalog());
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().all(|r| r.is_empty()));
    }

    #[test]
    fn test_string_literal_spans() {
        let code = "SELECT * FROM tab'' WHERE a = 'x' AND b = `it's` AND c = ''";
        let spans: Vec<&str> = string_literals(code).into_iter().map(|r| &code[r]).collect();
        assert_eq!(spans, vec!["'x'", "''"]);
    }

    #[test]
    fn test_rewrite_replaces_selected_spans() {
        let code = "SELECT * FROM `tab` JOIN tabCustomer c";
        let refs = scan(code, &catalog());
        let out = rewrite(code, &refs, |r| {
            if r.is_empty() {
                Some("tabSalesOrder".to_string())
            } else {
                None
            }
        });
        assert_eq!(out, "SELECT * FROM `tabSalesOrder` JOIN tabCustomer c");
    }
}
