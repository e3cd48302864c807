// ABOUTME: PostgreSQL SQL text builders for keyset sampling, range export and bulk load
// ABOUTME: Centralizes identifier/literal quoting so every statement is built the same way

use crate::transfer::types::{KeyTuple, TableDescriptor};

/// Quote an identifier with double quotes, doubling embedded quotes
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal with single quotes, doubling embedded quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `"schema"."table"`
pub fn qualified_name(table: &TableDescriptor) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}

pub fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Row constructor over the key columns, e.g. `("a", "b")`
fn key_row(table: &TableDescriptor) -> String {
    format!("({})", column_list(&table.primary_key))
}

/// Row constructor over key values as untyped literals, coerced by the server
fn key_literal(key: &KeyTuple) -> String {
    let values: Vec<String> = key.0.iter().map(|v| quote_literal(v)).collect();
    format!("({})", values.join(", "))
}

/// Predicate selecting the key interval `(lower, upper]`
///
/// Composite keys compare lexicographically through row comparison. Returns
/// `None` when both bounds are open.
pub fn range_predicate(
    table: &TableDescriptor,
    lower: Option<&KeyTuple>,
    upper: Option<&KeyTuple>,
) -> Option<String> {
    let key = key_row(table);
    let mut clauses = Vec::new();
    if let Some(lower) = lower {
        clauses.push(format!("{} > {}", key, key_literal(lower)));
    }
    if let Some(upper) = upper {
        clauses.push(format!("{} <= {}", key, key_literal(upper)));
    }
    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

/// Query returning the key `offset` rows past `after` in key order
pub fn sample_key_query(table: &TableDescriptor, after: Option<&KeyTuple>, offset: u64) -> String {
    let select: Vec<String> = table
        .primary_key
        .iter()
        .map(|c| format!("{}::text", quote_ident(c)))
        .collect();
    let mut sql = format!("SELECT {} FROM {}", select.join(", "), qualified_name(table));
    if let Some(predicate) = range_predicate(table, after, None) {
        sql.push_str(" WHERE ");
        sql.push_str(&predicate);
    }
    sql.push_str(&format!(
        " ORDER BY {} LIMIT 1 OFFSET {}",
        column_list(&table.primary_key),
        offset
    ));
    sql
}

/// `COPY (SELECT ...) TO STDOUT` for one key interval, ordered by key
pub fn export_query(
    table: &TableDescriptor,
    lower: Option<&KeyTuple>,
    upper: Option<&KeyTuple>,
) -> String {
    let mut select = format!(
        "SELECT {} FROM {}",
        column_list(&table.columns),
        qualified_name(table)
    );
    if table.has_primary_key() {
        if let Some(predicate) = range_predicate(table, lower, upper) {
            select.push_str(" WHERE ");
            select.push_str(&predicate);
        }
        select.push_str(&format!(" ORDER BY {}", column_list(&table.primary_key)));
    }
    format!("COPY ({}) TO STDOUT", select)
}

/// `COPY "schema"."table" (cols) FROM STDIN`
pub fn copy_in_statement(table: &TableDescriptor) -> String {
    format!(
        "COPY {} ({}) FROM STDIN",
        qualified_name(table),
        column_list(&table.columns)
    )
}

/// Header of a batched INSERT statement, values follow on separate lines
pub fn insert_header(table: &TableDescriptor) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES",
        qualified_name(table),
        column_list(&table.columns)
    )
}

pub fn truncate_statement(table: &TableDescriptor) -> String {
    format!("TRUNCATE TABLE {}", qualified_name(table))
}

pub fn drop_table_statement(table: &TableDescriptor) -> String {
    format!("DROP TABLE IF EXISTS {} CASCADE", qualified_name(table))
}

/// Remove the rows of one key interval, used before reloading a replayed chunk
pub fn delete_range_statement(
    table: &TableDescriptor,
    lower: Option<&KeyTuple>,
    upper: Option<&KeyTuple>,
) -> String {
    let mut sql = format!("DELETE FROM {}", qualified_name(table));
    if table.has_primary_key() {
        if let Some(predicate) = range_predicate(table, lower, upper) {
            sql.push_str(" WHERE ");
            sql.push_str(&predicate);
        }
    }
    sql
}

pub fn drop_index_statement(schema: &str, index: &str) -> String {
    format!("DROP INDEX IF EXISTS {}.{}", quote_ident(schema), quote_ident(index))
}
