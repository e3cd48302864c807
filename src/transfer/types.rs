// ABOUTME: Core data model for chunked transfers
// ABOUTME: Table descriptors, key tuples, chunk specs, chunk states and dump modes

use crate::utils::file_name_for;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a table inside a dump set (`schema.table`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(String);

impl TableId {
    pub fn new(schema: &str, name: &str) -> Self {
        Self(format!("{}.{}", schema, name))
    }

    /// Parse `schema.table`, defaulting to the `public` schema when no dot is present
    pub fn parse(value: &str) -> Self {
        match value.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new("public", value),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn schema(&self) -> &str {
        self.0.split_once('.').map(|(s, _)| s).unwrap_or("public")
    }

    pub fn name(&self) -> &str {
        self.0.split_once('.').map(|(_, n)| n).unwrap_or(&self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Description of a source table, frozen when a dump job starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    pub columns: Vec<String>,
    /// Ordered primary-key columns; empty when the table has no usable key
    pub primary_key: Vec<String>,
    pub estimated_rows: i64,
}

impl TableDescriptor {
    pub fn id(&self) -> TableId {
        TableId::new(&self.schema, &self.name)
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }
}

/// Primary-key values of one row, rendered as text in key-column order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyTuple(pub Vec<String>);

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// One transfer unit: the key interval `(lower, upper]` of a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpec {
    pub table: TableId,
    pub index: u32,
    /// Exclusive lower bound, `None` for the first chunk
    pub lower: Option<KeyTuple>,
    /// Inclusive upper bound, `None` for the last chunk
    pub upper: Option<KeyTuple>,
    pub artifact: String,
}

/// Transfer state of a chunk
///
/// Forward path is `pending -> in_progress -> done`; a failed chunk is
/// requeued with `failed -> pending`. `in_progress -> pending` covers
/// cancellation and chunks orphaned by a crashed process, and
/// `done -> pending` is reserved for operator-forced replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl ChunkState {
    pub fn can_transition(self, to: ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (Failed, Pending)
                | (Done, Pending)
        )
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkState::Pending => "pending",
            ChunkState::InProgress => "in_progress",
            ChunkState::Done => "done",
            ChunkState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Mutable per-chunk bookkeeping shared by manifests and restore progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStatus {
    pub state: ChunkState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Default for ChunkStatus {
    fn default() -> Self {
        Self {
            state: ChunkState::Pending,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Artifact format, chosen once per dump job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpMode {
    /// Native COPY text stream, reloaded with `COPY ... FROM STDIN`
    #[default]
    Copy,
    /// Self-contained SQL script of batched INSERT statements
    Insert,
}

impl DumpMode {
    pub fn extension(self, compressed: bool) -> &'static str {
        match (self, compressed) {
            (DumpMode::Copy, true) => "csv.gz",
            (DumpMode::Copy, false) => "csv",
            (DumpMode::Insert, true) => "sql.gz",
            (DumpMode::Insert, false) => "sql",
        }
    }

    /// Artifact file name for a chunk, e.g. `orders_chunk_000003.csv.gz`
    pub fn artifact_name(self, table: &str, index: u32, compressed: bool) -> String {
        format!(
            "{}_chunk_{:06}.{}",
            file_name_for(table),
            index,
            self.extension(compressed)
        )
    }
}

impl fmt::Display for DumpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpMode::Copy => f.write_str("copy"),
            DumpMode::Insert => f.write_str("insert"),
        }
    }
}

impl std::str::FromStr for DumpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "copy" => Ok(DumpMode::Copy),
            "insert" => Ok(DumpMode::Insert),
            other => Err(format!("unknown dump mode '{}' (expected copy or insert)", other)),
        }
    }
}

/// Outcome of writing one chunk artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub rows: u64,
    pub bytes: u64,
    /// Hex SHA-256 of the artifact file contents
    pub checksum: String,
}

/// How a worker left a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Done { rows: u64, bytes: u64 },
    /// Retries exhausted or fatal error; the chunk is `failed`
    Failed(String),
    /// Cancelled mid-flight; the chunk is back to `pending`
    Cancelled,
    /// Another worker or an earlier run already holds or finished the chunk
    Skipped,
}

/// A secondary index that can be dropped before a bulk load and rebuilt after
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    /// Full `CREATE INDEX` statement as reported by `pg_indexes`
    pub definition: String,
}
