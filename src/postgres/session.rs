// ABOUTME: tokio-postgres implementation of the transfer engine's database capability
// ABOUTME: Maps driver errors onto transient/fatal classes by SQLSTATE

use crate::database::{Connection, Connector, CopyBlocks, CopySink};
use crate::error::{Result, TransferError};
use crate::postgres::catalog;
use crate::postgres::connection::connect;
use crate::sql::{copy_in_statement, export_query, sample_key_query};
use crate::transfer::types::{IndexDef, KeyTuple, TableDescriptor};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{pin_mut, SinkExt, TryStreamExt};
use tokio_postgres::Client;

/// SQLSTATE codes worth retrying: the same statement may succeed on a new attempt
///
/// Connection exceptions (class 08), serialization failures and deadlocks,
/// statement cancellation, administrator shutdown and connection limits.
pub fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || matches!(
            code,
            "40001" | "40P01" | "57014" | "57P01" | "57P02" | "57P03" | "53300" | "55P03"
        )
}

/// Convert a driver error, keeping the server message and SQLSTATE visible
pub fn classify(err: tokio_postgres::Error, context: &str) -> TransferError {
    if let Some(db) = err.as_db_error() {
        let message = format!(
            "{}: {} (SQLSTATE {})",
            context,
            db.message(),
            db.code().code()
        );
        return if is_transient_sqlstate(db.code().code()) {
            TransferError::Transient(message)
        } else {
            TransferError::Fatal(message)
        };
    }

    if let Some(code) = err.code() {
        let message = format!("{}: {} (SQLSTATE {})", context, err, code.code());
        return if is_transient_sqlstate(code.code()) {
            TransferError::Transient(message)
        } else {
            TransferError::Fatal(message)
        };
    }

    let io_failure = std::error::Error::source(&err)
        .map(|source| source.is::<std::io::Error>())
        .unwrap_or(false);
    if err.is_closed() || io_failure {
        TransferError::Transient(format!("{}: {}", context, err))
    } else {
        TransferError::Fatal(format!("{}: {}", context, err))
    }
}

/// Opens PostgreSQL sessions for one named database
pub struct PgConnector {
    name: String,
    url: String,
}

impl PgConnector {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let client = connect(&self.url).await?;
        Ok(Box::new(PgSession::new(client)))
    }
}

/// One live PostgreSQL session
pub struct PgSession {
    client: Client,
}

impl PgSession {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connection for PgSession {
    async fn describe_table(&mut self, schema: &str, name: &str) -> Result<TableDescriptor> {
        catalog::describe_table(&self.client, schema, name).await
    }

    async fn key_after(
        &mut self,
        table: &TableDescriptor,
        after: Option<&KeyTuple>,
        offset: u64,
    ) -> Result<Option<KeyTuple>> {
        let query = sample_key_query(table, after, offset);
        let row = self
            .client
            .query_opt(query.as_str(), &[])
            .await
            .map_err(|e| classify(e, "sampling key"))?;

        Ok(row.map(|row| {
            KeyTuple(
                (0..row.len())
                    .map(|i| row.get::<_, Option<String>>(i).unwrap_or_default())
                    .collect(),
            )
        }))
    }

    async fn export_range(
        &mut self,
        table: &TableDescriptor,
        lower: Option<&KeyTuple>,
        upper: Option<&KeyTuple>,
        sink: &mut dyn CopySink,
    ) -> Result<u64> {
        let query = export_query(table, lower, upper);
        let stream = self
            .client
            .copy_out(query.as_str())
            .await
            .map_err(|e| classify(e, "starting COPY TO"))?;
        pin_mut!(stream);

        let mut bytes = 0u64;
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| classify(e, "streaming COPY TO"))?
        {
            bytes += chunk.len() as u64;
            sink.send(chunk).await?;
        }
        Ok(bytes)
    }

    async fn table_ddl(&mut self, table: &TableDescriptor, include_indexes: bool) -> Result<String> {
        catalog::table_ddl(&self.client, table, include_indexes).await
    }

    async fn secondary_indexes(&mut self, table: &TableDescriptor) -> Result<Vec<IndexDef>> {
        catalog::secondary_indexes(&self.client, table).await
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| classify(e, "executing statement"))
    }

    async fn bulk_load(&mut self, table: &TableDescriptor, mut data: CopyBlocks) -> Result<u64> {
        let sink = self
            .client
            .copy_in::<_, Bytes>(copy_in_statement(table).as_str())
            .await
            .map_err(|e| classify(e, "starting COPY FROM"))?;
        pin_mut!(sink);

        // Dropping the sink before finish() aborts the COPY on the server
        while let Some(block) = data.try_next().await? {
            sink.send(block)
                .await
                .map_err(|e| classify(e, "streaming COPY FROM"))?;
        }
        sink.finish()
            .await
            .map_err(|e| classify(e, "finishing COPY FROM"))
    }
}
