// ABOUTME: Database capability consumed by the transfer engine
// ABOUTME: Driver-agnostic traits for introspection, range export, statement execution and bulk load

use crate::error::Result;
use crate::transfer::types::{IndexDef, KeyTuple, TableDescriptor};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Decoded artifact payload handed to a bulk load, block by block
pub type CopyBlocks = BoxStream<'static, Result<Bytes>>;

/// Receiver of COPY text blocks streamed out of a source table
#[async_trait]
pub trait CopySink: Send {
    async fn send(&mut self, block: Bytes) -> Result<()>;
}

/// Opens connections to one named database
///
/// Every worker opens its own connection for the lifetime of the chunk it
/// is processing, so the connector is the only shared handle.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Label used for logs and for keying restore progress files
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// A single database session
#[async_trait]
pub trait Connection: Send {
    /// Read column list, primary key and row estimate for a table
    async fn describe_table(&mut self, schema: &str, name: &str) -> Result<TableDescriptor>;

    /// Key of the row `offset` positions after `after` in key order, if any
    async fn key_after(
        &mut self,
        table: &TableDescriptor,
        after: Option<&KeyTuple>,
        offset: u64,
    ) -> Result<Option<KeyTuple>>;

    /// Stream the rows of `(lower, upper]` in COPY text format into `sink`
    ///
    /// Returns the number of bytes produced by the server.
    async fn export_range(
        &mut self,
        table: &TableDescriptor,
        lower: Option<&KeyTuple>,
        upper: Option<&KeyTuple>,
        sink: &mut dyn CopySink,
    ) -> Result<u64>;

    /// `CREATE TABLE` statement, optionally followed by its index statements
    async fn table_ddl(&mut self, table: &TableDescriptor, include_indexes: bool) -> Result<String>;

    /// Indexes on the table other than the primary key
    async fn secondary_indexes(&mut self, table: &TableDescriptor) -> Result<Vec<IndexDef>>;

    /// Execute one or more statements with no result rows
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Stream COPY text rows into the table, returning the row count
    ///
    /// An error item from `data` aborts the load before anything is committed.
    async fn bulk_load(&mut self, table: &TableDescriptor, data: CopyBlocks) -> Result<u64>;
}
