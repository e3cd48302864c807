// ABOUTME: In-memory database used by the transfer integration tests
// ABOUTME: Implements the connector/connection capability with transactions and fault injection

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use postgres_chunk_dump::config::TransferSettings;
use postgres_chunk_dump::database::{Connection, Connector, CopyBlocks, CopySink};
use postgres_chunk_dump::error::{Result, TransferError};
use postgres_chunk_dump::sql::quote_ident;
use postgres_chunk_dump::transfer::artifact::decode_copy_field;
use postgres_chunk_dump::transfer::types::IndexDef;
use postgres_chunk_dump::transfer::{KeyTuple, TableDescriptor};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Operations faults and cancel gates can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Connect,
    Describe,
    KeyAfter,
    Export,
    Execute,
    BulkLoad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Fatal,
}

struct Injection {
    op: Op,
    fault: Fault,
    remaining: usize,
}

struct Gate {
    op: Op,
    remaining: usize,
    token: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct MemoryTable {
    pub descriptor: TableDescriptor,
    /// COPY text lines without the trailing newline, in key order when keyed
    pub rows: Vec<String>,
    pub indexes: Vec<IndexDef>,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, MemoryTable>,
    /// Definitions used by `CREATE TABLE` after a table was dropped
    schemas: BTreeMap<String, TableDescriptor>,
    statements: Vec<String>,
    injections: Vec<Injection>,
    gates: Vec<Gate>,
    calls: BTreeMap<String, usize>,
}

/// A shared in-memory database; clones see the same data
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    name: String,
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Create a table; `rows` are tab-separated COPY lines
    pub fn create_table(&self, schema: &str, name: &str, columns: &[&str], key: &[&str], rows: &[String]) {
        let descriptor = TableDescriptor {
            schema: schema.to_string(),
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            primary_key: key.iter().map(|c| c.to_string()).collect(),
            estimated_rows: rows.len() as i64,
        };
        let mut table = MemoryTable {
            descriptor: descriptor.clone(),
            rows: rows.to_vec(),
            indexes: Vec::new(),
        };
        sort_rows(&mut table);
        let mut state = self.lock();
        state.schemas.insert(descriptor.id().to_string(), descriptor.clone());
        state.tables.insert(descriptor.id().to_string(), table);
    }

    pub fn add_index(&self, table: &str, name: &str, column: &str) {
        let mut state = self.lock();
        let entry = state.tables.get_mut(table).unwrap();
        let definition = format!(
            "CREATE INDEX {} ON {} USING btree ({})",
            name, table, column
        );
        entry.indexes.push(IndexDef {
            name: name.to_string(),
            definition,
        });
    }

    /// Change the primary key of an existing table
    pub fn set_primary_key(&self, table: &str, key: &[&str]) {
        let mut state = self.lock();
        let entry = state.tables.get_mut(table).unwrap();
        entry.descriptor.primary_key = key.iter().map(|c| c.to_string()).collect();
        sort_rows(entry);
    }

    pub fn rows(&self, table: &str) -> Vec<String> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn sorted_rows(&self, table: &str) -> Vec<String> {
        let mut rows = self.rows(table);
        rows.sort();
        rows
    }

    pub fn index_names(&self, table: &str) -> Vec<String> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.indexes.iter().map(|i| i.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Every statement passed to `execute`, one entry per statement
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn count_statements(&self, prefix: &str) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.starts_with(prefix))
            .count()
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&format!("{:?}", op)).copied().unwrap_or(0)
    }

    /// Make the next `times` calls of `op` fail
    pub fn inject(&self, op: Op, fault: Fault, times: usize) {
        self.lock().injections.push(Injection {
            op,
            fault,
            remaining: times,
        });
    }

    /// Cancel `token` once `op` has completed `after` times
    pub fn cancel_after(&self, op: Op, after: usize, token: CancellationToken) {
        self.lock().gates.push(Gate {
            op,
            remaining: after,
            token,
        });
    }

    fn enter(&self, op: Op) -> Result<()> {
        let mut state = self.lock();
        *state.calls.entry(format!("{:?}", op)).or_default() += 1;
        let injected = state
            .injections
            .iter_mut()
            .find(|i| i.op == op && i.remaining > 0);
        match injected {
            Some(injection) => {
                injection.remaining -= 1;
                Err(match injection.fault {
                    Fault::Transient => TransferError::Transient(format!(
                        "{:?}: connection reset by peer (SQLSTATE 08006)",
                        op
                    )),
                    Fault::Fatal => TransferError::Fatal(format!(
                        "{:?}: disk full (SQLSTATE 53100)",
                        op
                    )),
                })
            }
            None => Ok(()),
        }
    }

    fn leave(&self, op: Op) {
        let mut state = self.lock();
        for gate in state.gates.iter_mut().filter(|g| g.op == op && g.remaining > 0) {
            gate.remaining -= 1;
            if gate.remaining == 0 {
                gate.token.cancel();
            }
        }
    }
}

#[async_trait]
impl Connector for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        self.enter(Op::Connect)?;
        Ok(Box::new(MemoryConnection {
            db: self.clone(),
            tx: None,
        }))
    }
}

enum Mutation {
    Truncate(String),
    DropTable(String),
    CreateTable(String),
    DropIndex(String),
    CreateIndex { table: String, index: IndexDef },
    Delete {
        table: String,
        lower: Option<KeyTuple>,
        upper: Option<KeyTuple>,
    },
    Insert { table: String, rows: Vec<String> },
}

struct Transaction {
    /// Private copy the statements run against, for error detection
    working: BTreeMap<String, MemoryTable>,
    log: Vec<Mutation>,
    explicit: bool,
    aborted: bool,
}

pub struct MemoryConnection {
    db: MemoryDatabase,
    tx: Option<Transaction>,
}

impl MemoryConnection {
    fn begin(&mut self, explicit: bool) {
        let working = self.db.lock().tables.clone();
        self.tx = Some(Transaction {
            working,
            log: Vec::new(),
            explicit,
            aborted: false,
        });
    }

    fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            if tx.aborted {
                return Ok(());
            }
            let mut state = self.db.lock();
            let State {
                tables, schemas, ..
            } = &mut *state;
            for mutation in &tx.log {
                apply(tables, schemas, mutation)?;
            }
        }
        Ok(())
    }

    /// Run one mutation inside the current transaction or autocommit it
    fn mutate(&mut self, mutation: Mutation) -> Result<()> {
        match &mut self.tx {
            Some(tx) => {
                if tx.aborted {
                    return Err(TransferError::Fatal(
                        "current transaction is aborted (SQLSTATE 25P02)".into(),
                    ));
                }
                let mut schemas = self.db.lock().schemas.clone();
                match apply(&mut tx.working, &mut schemas, &mutation) {
                    Ok(()) => {
                        tx.log.push(mutation);
                        Ok(())
                    }
                    Err(e) => {
                        tx.aborted = true;
                        Err(e)
                    }
                }
            }
            None => {
                let mut state = self.db.lock();
                let State {
                    tables, schemas, ..
                } = &mut *state;
                apply(tables, schemas, &mutation)
            }
        }
    }

    fn statement(&mut self, sql: &str) -> Result<()> {
        let upper = sql.to_ascii_uppercase();
        if upper.starts_with("SET ") {
            return Ok(());
        }
        match upper.as_str() {
            "BEGIN" => {
                if self.tx.is_none() {
                    self.begin(true);
                }
                if let Some(tx) = self.tx.as_mut() {
                    tx.explicit = true;
                }
                return Ok(());
            }
            "COMMIT" => return self.commit(),
            "ROLLBACK" => {
                self.tx = None;
                return Ok(());
            }
            _ => {}
        }

        let mutation = if let Some(rest) = sql.strip_prefix("TRUNCATE TABLE ") {
            Mutation::Truncate(unquote(rest))
        } else if let Some(rest) = sql.strip_prefix("DROP TABLE IF EXISTS ") {
            Mutation::DropTable(unquote(rest.trim_end_matches(" CASCADE")))
        } else if let Some(rest) = sql.strip_prefix("CREATE TABLE IF NOT EXISTS ") {
            let name = rest.split_whitespace().next().unwrap_or_default();
            Mutation::CreateTable(unquote(name))
        } else if let Some(rest) = sql.strip_prefix("DROP INDEX IF EXISTS ") {
            let name = unquote(rest);
            Mutation::DropIndex(name.rsplit('.').next().unwrap_or_default().to_string())
        } else if upper.starts_with("CREATE INDEX") || upper.starts_with("CREATE UNIQUE INDEX") {
            let (head, tail) = sql
                .split_once(" ON ")
                .ok_or_else(|| syntax_error(sql))?;
            let name = head
                .split_whitespace()
                .last()
                .ok_or_else(|| syntax_error(sql))?;
            let table = tail.split_whitespace().next().unwrap_or_default();
            Mutation::CreateIndex {
                table: unquote(table),
                index: IndexDef {
                    name: name.to_string(),
                    definition: sql.replace("IF NOT EXISTS ", ""),
                },
            }
        } else if let Some(rest) = sql.strip_prefix("DELETE FROM ") {
            let (table, predicate) = match rest.split_once(" WHERE ") {
                Some((table, predicate)) => (table, Some(predicate)),
                None => (rest, None),
            };
            let (lower, upper) = match predicate {
                Some(p) => parse_range(p).ok_or_else(|| syntax_error(sql))?,
                None => (None, None),
            };
            Mutation::Delete {
                table: unquote(table),
                lower,
                upper,
            }
        } else if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            let table = rest.split_whitespace().next().unwrap_or_default();
            Mutation::Insert {
                table: unquote(table),
                rows: parse_values(sql).ok_or_else(|| syntax_error(sql))?,
            }
        } else {
            return Err(syntax_error(sql));
        };
        self.mutate(mutation)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn describe_table(&mut self, schema: &str, name: &str) -> Result<TableDescriptor> {
        self.db.enter(Op::Describe)?;
        let id = format!("{}.{}", schema, name);
        let state = self.db.lock();
        let table = state
            .tables
            .get(&id)
            .ok_or_else(|| TransferError::planning(&id, "table does not exist or has no columns"))?;
        let mut descriptor = table.descriptor.clone();
        descriptor.estimated_rows = table.rows.len() as i64;
        Ok(descriptor)
    }

    async fn key_after(
        &mut self,
        table: &TableDescriptor,
        after: Option<&KeyTuple>,
        offset: u64,
    ) -> Result<Option<KeyTuple>> {
        self.db.enter(Op::KeyAfter)?;
        let state = self.db.lock();
        let stored = state
            .tables
            .get(&table.id().to_string())
            .ok_or_else(|| missing_table(table.id().as_str()))?;

        let key = stored
            .rows
            .iter()
            .map(|row| row_key(&stored.descriptor, row))
            .filter(|key| match after {
                Some(after) => compare_keys(&key.0, &after.0) == Ordering::Greater,
                None => true,
            })
            .nth(offset as usize);
        Ok(key)
    }

    async fn export_range(
        &mut self,
        table: &TableDescriptor,
        lower: Option<&KeyTuple>,
        upper: Option<&KeyTuple>,
        sink: &mut dyn CopySink,
    ) -> Result<u64> {
        let rows: Vec<String> = {
            let state = self.db.lock();
            let stored = state
                .tables
                .get(&table.id().to_string())
                .ok_or_else(|| missing_table(table.id().as_str()))?;
            stored
                .rows
                .iter()
                .filter(|row| {
                    !table.has_primary_key() || in_range(&row_key(&stored.descriptor, row), lower, upper)
                })
                .cloned()
                .collect()
        };

        if let Err(e) = self.db.enter(Op::Export) {
            // The stream dies after the first row reached the client
            if let Some(first) = rows.first() {
                let _ = sink.send(Bytes::from(format!("{}\n", first))).await;
            }
            return Err(e);
        }

        let mut bytes = 0u64;
        for row in &rows {
            let line = format!("{}\n", row);
            bytes += line.len() as u64;
            sink.send(Bytes::from(line)).await?;
        }
        self.db.leave(Op::Export);
        Ok(bytes)
    }

    async fn table_ddl(&mut self, table: &TableDescriptor, include_indexes: bool) -> Result<String> {
        let state = self.db.lock();
        let stored = state
            .tables
            .get(&table.id().to_string())
            .ok_or_else(|| missing_table(table.id().as_str()))?;
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("    {} text", quote_ident(c)))
            .collect();
        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (\n{}\n);\n",
            quote_ident(&table.schema),
            quote_ident(&table.name),
            columns.join(",\n")
        );
        if include_indexes {
            for index in &stored.indexes {
                ddl.push_str(&format!("{};\n", index.definition));
            }
        }
        Ok(ddl)
    }

    async fn secondary_indexes(&mut self, table: &TableDescriptor) -> Result<Vec<IndexDef>> {
        let state = self.db.lock();
        Ok(state
            .tables
            .get(&table.id().to_string())
            .map(|t| t.indexes.clone())
            .unwrap_or_default())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.db.enter(Op::Execute)?;
        let statements = split_statements(sql);
        self.db.lock().statements.extend(statements.iter().cloned());

        let implicit = self.tx.is_none() && statements.len() > 1;
        if implicit {
            self.begin(false);
        }

        for statement in &statements {
            if let Err(e) = self.statement(statement) {
                match self.tx.as_ref().map(|tx| tx.explicit) {
                    Some(true) => {
                        if let Some(tx) = self.tx.as_mut() {
                            tx.aborted = true;
                        }
                    }
                    Some(false) => self.tx = None,
                    None => {}
                }
                return Err(e);
            }
        }

        if matches!(&self.tx, Some(tx) if !tx.explicit) {
            self.commit()?;
        }
        self.db.leave(Op::Execute);
        Ok(())
    }

    async fn bulk_load(&mut self, table: &TableDescriptor, mut data: CopyBlocks) -> Result<u64> {
        self.db.enter(Op::BulkLoad)?;
        let mut payload = Vec::new();
        while let Some(block) = data.try_next().await? {
            payload.extend_from_slice(&block);
        }
        let data = payload;
        let text = String::from_utf8_lossy(&data);
        let rows: Vec<String> = text.lines().map(|l| l.to_string()).collect();
        let count = rows.len() as u64;
        self.mutate(Mutation::Insert {
            table: table.id().to_string(),
            rows,
        })?;
        self.db.leave(Op::BulkLoad);
        Ok(count)
    }
}

fn apply(
    tables: &mut BTreeMap<String, MemoryTable>,
    schemas: &mut BTreeMap<String, TableDescriptor>,
    mutation: &Mutation,
) -> Result<()> {
    match mutation {
        Mutation::Truncate(table) => {
            tables
                .get_mut(table)
                .ok_or_else(|| missing_table(table))?
                .rows
                .clear();
        }
        Mutation::DropTable(table) => {
            tables.remove(table);
        }
        Mutation::CreateTable(table) => {
            if !tables.contains_key(table) {
                let descriptor = schemas
                    .get(table)
                    .cloned()
                    .ok_or_else(|| missing_table(table))?;
                tables.insert(
                    table.clone(),
                    MemoryTable {
                        descriptor,
                        rows: Vec::new(),
                        indexes: Vec::new(),
                    },
                );
            }
        }
        Mutation::DropIndex(name) => {
            for table in tables.values_mut() {
                table.indexes.retain(|i| &i.name != name);
            }
        }
        Mutation::CreateIndex { table, index } => {
            let entry = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
            if !entry.indexes.iter().any(|i| i.name == index.name) {
                entry.indexes.push(index.clone());
            }
        }
        Mutation::Delete {
            table,
            lower,
            upper,
        } => {
            let entry = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
            let descriptor = entry.descriptor.clone();
            if descriptor.has_primary_key() {
                entry
                    .rows
                    .retain(|row| !in_range(&row_key(&descriptor, row), lower.as_ref(), upper.as_ref()));
            } else {
                entry.rows.clear();
            }
        }
        Mutation::Insert { table, rows } => {
            let entry = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
            if entry.descriptor.has_primary_key() {
                for row in rows {
                    let key = row_key(&entry.descriptor, row);
                    if entry
                        .rows
                        .iter()
                        .any(|r| row_key(&entry.descriptor, r) == key)
                    {
                        return Err(TransferError::Fatal(format!(
                            "duplicate key value violates unique constraint: {} (SQLSTATE 23505)",
                            key
                        )));
                    }
                    entry.rows.push(row.clone());
                }
            } else {
                entry.rows.extend(rows.iter().cloned());
            }
            sort_rows(entry);
        }
    }
    Ok(())
}

fn sort_rows(table: &mut MemoryTable) {
    if table.descriptor.has_primary_key() {
        let descriptor = table.descriptor.clone();
        table
            .rows
            .sort_by(|a, b| compare_keys(&row_key(&descriptor, a).0, &row_key(&descriptor, b).0));
    }
}

fn row_key(descriptor: &TableDescriptor, row: &str) -> KeyTuple {
    let fields: Vec<&str> = row.split('\t').collect();
    KeyTuple(
        descriptor
            .primary_key
            .iter()
            .map(|column| {
                let position = descriptor
                    .columns
                    .iter()
                    .position(|c| c == column)
                    .unwrap_or(0);
                fields
                    .get(position)
                    .and_then(|f| decode_copy_field(f.as_bytes()))
                    .unwrap_or_default()
            })
            .collect(),
    )
}

/// Compare key values numerically when both parse as integers
fn compare_keys(a: &[String], b: &[String]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ordering = match (x.parse::<i64>(), y.parse::<i64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => x.cmp(y),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

fn in_range(key: &KeyTuple, lower: Option<&KeyTuple>, upper: Option<&KeyTuple>) -> bool {
    let above = lower
        .map(|l| compare_keys(&key.0, &l.0) == Ordering::Greater)
        .unwrap_or(true);
    let below = upper
        .map(|u| compare_keys(&key.0, &u.0) != Ordering::Greater)
        .unwrap_or(true);
    above && below
}

/// Split a batch into statements at lines ending with `;`
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
        if trimmed.ends_with(';') {
            statements.push(current.trim().trim_end_matches(';').to_string());
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        statements.push(current.trim().trim_end_matches(';').to_string());
    }
    statements
}

/// `"schema"."table"` or `schema.table` to `schema.table`
fn unquote(name: &str) -> String {
    name.trim().replace('"', "")
}

/// Parse `(cols) > ('a') AND (cols) <= ('b')`
fn parse_range(predicate: &str) -> Option<(Option<KeyTuple>, Option<KeyTuple>)> {
    let mut lower = None;
    let mut upper = None;
    for clause in predicate.split(" AND ") {
        if let Some((_, values)) = clause.split_once(" > ") {
            lower = Some(KeyTuple(parse_tuple(values)?.into_iter().flatten().collect()));
        } else if let Some((_, values)) = clause.split_once(" <= ") {
            upper = Some(KeyTuple(parse_tuple(values)?.into_iter().flatten().collect()));
        } else {
            return None;
        }
    }
    Some((lower, upper))
}

/// Rows of an `INSERT ... VALUES` statement, re-encoded as COPY lines
fn parse_values(sql: &str) -> Option<Vec<String>> {
    let mut rows = Vec::new();
    for line in sql.lines().skip(1) {
        let line = line.trim().trim_end_matches(',');
        if line.is_empty() {
            continue;
        }
        let values = parse_tuple(line)?;
        let fields: Vec<String> = values
            .into_iter()
            .map(|v| match v {
                Some(text) => text
                    .replace('\\', "\\\\")
                    .replace('\t', "\\t")
                    .replace('\n', "\\n"),
                None => "\\N".to_string(),
            })
            .collect();
        rows.push(fields.join("\t"));
    }
    Some(rows)
}

/// Parse `('a', NULL, 'it''s')`
fn parse_tuple(text: &str) -> Option<Vec<Option<String>>> {
    let inner = text.trim().strip_prefix('(')?.strip_suffix(')')?;
    let chars: Vec<char> = inner.chars().collect();
    let mut values = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            ' ' | ',' => i += 1,
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i)? {
                        '\'' if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        '\'' => {
                            i += 1;
                            break;
                        }
                        c => {
                            value.push(*c);
                            i += 1;
                        }
                    }
                }
                values.push(Some(value));
            }
            'N' if chars[i..].starts_with(&['N', 'U', 'L', 'L']) => {
                values.push(None);
                i += 4;
            }
            _ => return None,
        }
    }
    Some(values)
}

fn missing_table(table: &str) -> TransferError {
    TransferError::Fatal(format!("relation \"{}\" does not exist (SQLSTATE 42P01)", table))
}

fn syntax_error(sql: &str) -> TransferError {
    TransferError::Fatal(format!("syntax error in {:?} (SQLSTATE 42601)", sql))
}

/// `id<TAB>name<TAB>region` rows with ids `1..=count`
pub fn numbered_rows(count: usize) -> Vec<String> {
    (1..=count)
        .map(|i| format!("{}\tcustomer {}\t{}", i, i, if i % 2 == 0 { "eu" } else { "us" }))
        .collect()
}

/// Source with `public.orders` holding `rows` keyed rows
pub fn source_with_orders(rows: usize) -> MemoryDatabase {
    let db = MemoryDatabase::new("source");
    db.create_table(
        "public",
        "orders",
        &["id", "name", "region"],
        &["id"],
        &numbered_rows(rows),
    );
    db
}

/// Destination with an empty `public.orders` of the same shape
pub fn empty_destination() -> MemoryDatabase {
    let db = MemoryDatabase::new("target");
    db.create_table("public", "orders", &["id", "name", "region"], &["id"], &[]);
    db
}

/// Settings sized for tests: tiny chunks, millisecond backoff, one worker
pub fn test_settings(dump_dir: &Path) -> TransferSettings {
    TransferSettings {
        dump_dir: dump_dir.to_path_buf(),
        chunk_rows: 3,
        compress: true,
        max_attempts: 4,
        backoff_base_ms: 1,
        backoff_cap_ms: 2,
        parallelism: 1,
        ..TransferSettings::default()
    }
}
