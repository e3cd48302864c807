// ABOUTME: Catalog introspection for chunked transfers
// ABOUTME: Discovers tables, key columns, indexes and renders CREATE TABLE statements

use crate::error::{Result, TransferError};
use crate::postgres::session::classify;
use crate::sql::{qualified_name, quote_ident};
use crate::transfer::types::{IndexDef, TableDescriptor, TableId};
use tokio_postgres::Client;

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub row_count_estimate: i64,
    pub total_bytes: i64,
}

impl TableInfo {
    pub fn id(&self) -> TableId {
        TableId::new(&self.schema, &self.name)
    }
}

/// One column as it appears in `CREATE TABLE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub default: Option<String>,
}

/// List all user tables in the current database, largest first
pub async fn list_tables(client: &Client) -> Result<Vec<TableInfo>> {
    let rows = client
        .query(
            "SELECT
                schemaname,
                relname,
                COALESCE(n_live_tup, 0) AS row_count,
                pg_total_relation_size(relid) AS total_bytes
             FROM pg_catalog.pg_stat_user_tables
             WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
             ORDER BY total_bytes DESC, schemaname, relname",
            &[],
        )
        .await
        .map_err(|e| classify(e, "listing tables"))?;

    Ok(rows
        .iter()
        .map(|row| TableInfo {
            schema: row.get(0),
            name: row.get(1),
            row_count_estimate: row.get(2),
            total_bytes: row.get(3),
        })
        .collect())
}

/// Columns, primary key and row estimate of one table
pub async fn describe_table(client: &Client, schema: &str, name: &str) -> Result<TableDescriptor> {
    let id = TableId::new(schema, name);

    let columns: Vec<String> = client
        .query(
            "SELECT a.attname
             FROM pg_catalog.pg_attribute a
             JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relname = $2
               AND a.attnum > 0 AND NOT a.attisdropped
             ORDER BY a.attnum",
            &[&schema, &name],
        )
        .await
        .map_err(|e| classify(e, "reading columns"))?
        .iter()
        .map(|row| row.get(0))
        .collect();

    if columns.is_empty() {
        return Err(TransferError::planning(&id, "table does not exist or has no columns"));
    }

    let primary_key: Vec<String> = client
        .query(
            "SELECT a.attname
             FROM pg_catalog.pg_index i
             JOIN pg_catalog.pg_class c ON c.oid = i.indrelid
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
             JOIN pg_catalog.pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             WHERE n.nspname = $1 AND c.relname = $2 AND i.indisprimary
             ORDER BY array_position(i.indkey::int2[], a.attnum)",
            &[&schema, &name],
        )
        .await
        .map_err(|e| classify(e, "reading primary key"))?
        .iter()
        .map(|row| row.get(0))
        .collect();

    let estimated_rows: i64 = client
        .query_opt(
            "SELECT COALESCE(n_live_tup, 0)
             FROM pg_catalog.pg_stat_user_tables
             WHERE schemaname = $1 AND relname = $2",
            &[&schema, &name],
        )
        .await
        .map_err(|e| classify(e, "reading row estimate"))?
        .map(|row| row.get(0))
        .unwrap_or(0);

    Ok(TableDescriptor {
        schema: schema.to_string(),
        name: name.to_string(),
        columns,
        primary_key,
        estimated_rows,
    })
}

/// Indexes other than the primary key that can be dropped with `DROP INDEX`
///
/// Indexes backing a constraint are left alone; dropping them would need
/// `ALTER TABLE ... DROP CONSTRAINT`.
pub async fn secondary_indexes(client: &Client, table: &TableDescriptor) -> Result<Vec<IndexDef>> {
    let rows = client
        .query(
            "SELECT ix.indexname, ix.indexdef
             FROM pg_catalog.pg_indexes ix
             JOIN pg_catalog.pg_namespace n ON n.nspname = ix.schemaname
             JOIN pg_catalog.pg_class ic ON ic.relname = ix.indexname AND ic.relnamespace = n.oid
             WHERE ix.schemaname = $1 AND ix.tablename = $2
               AND NOT EXISTS (
                   SELECT 1 FROM pg_catalog.pg_constraint con WHERE con.conindid = ic.oid
               )
             ORDER BY ix.indexname",
            &[&table.schema, &table.name],
        )
        .await
        .map_err(|e| classify(e, "reading indexes"))?;

    Ok(rows
        .iter()
        .map(|row| IndexDef {
            name: row.get(0),
            definition: row.get(1),
        })
        .collect())
}

/// `CREATE TABLE` for the table, with index statements when requested
pub async fn table_ddl(
    client: &Client,
    table: &TableDescriptor,
    include_indexes: bool,
) -> Result<String> {
    let columns: Vec<ColumnDef> = client
        .query(
            "SELECT
                a.attname,
                pg_catalog.format_type(a.atttypid, a.atttypmod),
                a.attnotnull,
                pg_catalog.pg_get_expr(d.adbin, d.adrelid)
             FROM pg_catalog.pg_attribute a
             JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
             LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
             WHERE n.nspname = $1 AND c.relname = $2
               AND a.attnum > 0 AND NOT a.attisdropped
             ORDER BY a.attnum",
            &[&table.schema, &table.name],
        )
        .await
        .map_err(|e| classify(e, "reading column definitions"))?
        .iter()
        .map(|row| ColumnDef {
            name: row.get(0),
            data_type: row.get(1),
            not_null: row.get(2),
            default: row.get(3),
        })
        .collect();

    if columns.is_empty() {
        return Err(TransferError::planning(
            table.id(),
            "table disappeared while reading its definition",
        ));
    }

    let indexes = if include_indexes {
        secondary_indexes(client, table).await?
    } else {
        Vec::new()
    };

    Ok(render_create_table(table, &columns, &indexes))
}

/// Render DDL from catalog rows
///
/// Sequences behind `nextval` defaults are created first. `DROP TABLE ...
/// CASCADE` takes owned sequences with it, so the table could not be
/// recreated from this text otherwise. Recreated sequences start over and
/// are not owned by the column.
pub fn render_create_table(table: &TableDescriptor, columns: &[ColumnDef], indexes: &[IndexDef]) -> String {
    let sequences = default_sequences(columns);
    let mut lines: Vec<String> = columns
        .iter()
        .map(|c| {
            let mut line = format!("    {} {}", quote_ident(&c.name), c.data_type);
            if let Some(default) = &c.default {
                line.push_str(" DEFAULT ");
                line.push_str(default);
            }
            if c.not_null {
                line.push_str(" NOT NULL");
            }
            line
        })
        .collect();

    if table.has_primary_key() {
        let key: Vec<String> = table.primary_key.iter().map(|c| quote_ident(c)).collect();
        lines.push(format!("    PRIMARY KEY ({})", key.join(", ")));
    }

    let mut ddl = String::new();
    for sequence in &sequences {
        ddl.push_str(&format!("CREATE SEQUENCE IF NOT EXISTS {};\n", sequence));
    }
    ddl.push_str(&format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);\n",
        qualified_name(table),
        lines.join(",\n")
    ));
    for index in indexes {
        ddl.push_str(index.definition.trim_end_matches(';'));
        ddl.push_str(";\n");
    }
    ddl
}

/// Sequence of every `nextval('<sequence>'::regclass)` default, once each
///
/// The sequence is kept as the catalog printed it, which is already valid
/// identifier text relative to the search path.
fn default_sequences(columns: &[ColumnDef]) -> Vec<String> {
    let mut sequences: Vec<String> = Vec::new();
    for default in columns.iter().filter_map(|c| c.default.as_deref()) {
        let Some(rest) = default.strip_prefix("nextval('") else {
            continue;
        };
        let Some(end) = rest.find("'::regclass)") else {
            continue;
        };
        let sequence = rest[..end].replace("''", "'");
        if !sequences.contains(&sequence) {
            sequences.push(sequence);
        }
    }
    sequences
}
