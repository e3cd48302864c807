// ABOUTME: Per-table manifest of planned chunks and their dump state
// ABOUTME: The store serializes all mutations and persists them with atomic renames

use crate::error::{Result, TransferError};
use crate::transfer::planner::ChunkPlan;
use crate::transfer::state_file::{
    apply_transition, read_json, record_attempt, write_json_atomic, ChunkLedger,
};
use crate::transfer::types::{
    ChunkResult, ChunkSpec, ChunkState, ChunkStatus, DumpMode, KeyTuple, TableDescriptor, TableId,
};
use crate::utils::file_name_for;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SCHEMA_FILE: &str = "schema.sql";
const MANIFEST_VERSION: u32 = 1;

/// One planned chunk together with its dump state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestChunk {
    pub index: u32,
    pub lower: Option<KeyTuple>,
    pub upper: Option<KeyTuple>,
    pub artifact: String,
    #[serde(flatten)]
    pub status: ChunkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub rows: u64,
    pub bytes: u64,
}

/// Chunk counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn from_states<I: IntoIterator<Item = ChunkState>>(states: I) -> Self {
        let mut counts = Self::default();
        for state in states {
            match state {
                ChunkState::Pending => counts.pending += 1,
                ChunkState::InProgress => counts.in_progress += 1,
                ChunkState::Done => counts.done += 1,
                ChunkState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.done + self.failed
    }
}

/// Dump-wide options recorded with each manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestOptions {
    pub mode: DumpMode,
    pub compressed: bool,
    /// Insert-mode scripts carry their own `BEGIN;`/`COMMIT;`
    pub transactional_scripts: bool,
    pub chunk_rows: u64,
}

/// Durable record of a table's chunk plan and transfer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub table: TableDescriptor,
    pub mode: DumpMode,
    pub compressed: bool,
    pub transactional_scripts: bool,
    pub chunk_rows: u64,
    /// Planned without a usable key: one whole-table chunk
    pub degraded: bool,
    #[serde(default)]
    pub has_schema: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub totals: Totals,
    pub chunks: Vec<ManifestChunk>,
}

impl Manifest {
    pub fn table_id(&self) -> TableId {
        self.table.id()
    }

    pub fn chunk(&self, index: u32) -> Option<&ManifestChunk> {
        self.chunks.iter().find(|c| c.index == index)
    }

    pub fn spec(&self, chunk: &ManifestChunk) -> ChunkSpec {
        ChunkSpec {
            table: self.table_id(),
            index: chunk.index,
            lower: chunk.lower.clone(),
            upper: chunk.upper.clone(),
            artifact: chunk.artifact.clone(),
        }
    }

    pub fn counts(&self) -> StateCounts {
        StateCounts::from_states(self.chunks.iter().map(|c| c.status.state))
    }

    pub fn is_complete(&self) -> bool {
        self.chunks
            .iter()
            .all(|c| c.status.state == ChunkState::Done)
    }

    fn refresh_totals(&mut self) {
        let mut totals = Totals::default();
        for chunk in self.chunks.iter().filter(|c| c.status.state == ChunkState::Done) {
            totals.rows += chunk.rows.unwrap_or(0);
            totals.bytes += chunk.bytes.unwrap_or(0);
        }
        self.totals = totals;
    }
}

impl ChunkLedger for Manifest {
    fn table_id(&self) -> TableId {
        self.table.id()
    }

    fn status_mut(&mut self, index: u32) -> Option<&mut ChunkStatus> {
        self.chunks
            .iter_mut()
            .find(|c| c.index == index)
            .map(|c| &mut c.status)
    }
}

/// Owner of every manifest file under a dump directory
///
/// Each mutation re-reads the manifest from disk, applies a checked change
/// and atomically replaces the file, all under one lock.
pub struct ManifestStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn table_dir(&self, table: &TableId) -> PathBuf {
        self.root.join(file_name_for(table.as_str()))
    }

    pub fn manifest_path(&self, table: &TableId) -> PathBuf {
        self.table_dir(table).join(MANIFEST_FILE)
    }

    pub fn schema_path(&self, table: &TableId) -> PathBuf {
        self.table_dir(table).join(SCHEMA_FILE)
    }

    pub fn artifact_path(&self, table: &TableId, artifact: &str) -> PathBuf {
        self.table_dir(table).join(artifact)
    }

    pub fn exists(&self, table: &TableId) -> bool {
        self.manifest_path(table).exists()
    }

    /// Record a freshly planned table; every chunk starts `pending`
    pub fn create(
        &self,
        table: &TableDescriptor,
        plan: &ChunkPlan,
        options: ManifestOptions,
    ) -> Result<Manifest> {
        let id = table.id();
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir = self.table_dir(&id);
        fs::create_dir_all(&dir)
            .map_err(|e| TransferError::io(format!("creating {}", dir.display()), e))?;

        let path = self.manifest_path(&id);
        if path.exists() {
            return Err(TransferError::Fatal(format!(
                "Manifest for {} already exists at {}",
                id,
                path.display()
            )));
        }

        let now = Utc::now();
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            table: table.clone(),
            mode: options.mode,
            compressed: options.compressed,
            transactional_scripts: options.transactional_scripts,
            chunk_rows: options.chunk_rows,
            degraded: plan.degraded,
            has_schema: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
            totals: Totals::default(),
            chunks: plan
                .chunks
                .iter()
                .map(|spec| ManifestChunk {
                    index: spec.index,
                    lower: spec.lower.clone(),
                    upper: spec.upper.clone(),
                    artifact: spec.artifact.clone(),
                    status: ChunkStatus::default(),
                    rows: None,
                    bytes: None,
                    checksum: None,
                })
                .collect(),
        };

        write_json_atomic(&path, &manifest)?;
        tracing::debug!("Created manifest for {} with {} chunk(s)", id, manifest.chunks.len());
        Ok(manifest)
    }

    /// Load a manifest; `NotPlanned` when it was never created
    pub fn load(&self, table: &TableId) -> Result<Manifest> {
        let manifest: Manifest = read_json(&self.manifest_path(table), table.as_str())?
            .ok_or_else(|| TransferError::NotPlanned(table.clone()))?;

        if manifest.version != MANIFEST_VERSION {
            return Err(TransferError::ManifestCorruption {
                table: table.to_string(),
                message: format!("unsupported manifest version {}", manifest.version),
            });
        }
        Ok(manifest)
    }

    /// Compare-and-swap one chunk's state
    pub fn transition(
        &self,
        table: &TableId,
        index: u32,
        from: ChunkState,
        to: ChunkState,
    ) -> Result<()> {
        self.update(table, |m| apply_transition(m, index, from, to))
    }

    /// Count an attempt on a chunk this worker holds `in_progress`
    pub fn begin_attempt(&self, table: &TableId, index: u32) -> Result<u32> {
        self.update(table, |m| record_attempt(m, index))
    }

    /// `in_progress -> done`, recording the artifact's size and checksum
    pub fn complete(&self, table: &TableId, index: u32, result: &ChunkResult) -> Result<()> {
        self.update(table, |m| {
            apply_transition(m, index, ChunkState::InProgress, ChunkState::Done)?;
            if let Some(chunk) = m.chunks.iter_mut().find(|c| c.index == index) {
                chunk.rows = Some(result.rows);
                chunk.bytes = Some(result.bytes);
                chunk.checksum = Some(result.checksum.clone());
                chunk.status.last_error = None;
            }
            Ok(())
        })
    }

    /// `in_progress -> failed`, keeping the error for operator inspection
    pub fn fail(&self, table: &TableId, index: u32, error: &str) -> Result<()> {
        self.update(table, |m| {
            apply_transition(m, index, ChunkState::InProgress, ChunkState::Failed)?;
            if let Some(status) = m.status_mut(index) {
                status.last_error = Some(error.to_string());
            }
            Ok(())
        })
    }

    /// Return failed chunks and chunks orphaned `in_progress` to `pending`
    ///
    /// Called once at job start; a second engine working on the same
    /// manifest at the same time is not supported.
    pub fn requeue(&self, table: &TableId) -> Result<Vec<u32>> {
        self.update(table, |m| {
            let stale: Vec<(u32, ChunkState)> = m
                .chunks
                .iter()
                .filter(|c| matches!(c.status.state, ChunkState::Failed | ChunkState::InProgress))
                .map(|c| (c.index, c.status.state))
                .collect();
            for (index, state) in &stale {
                apply_transition(m, *index, *state, ChunkState::Pending)?;
            }
            Ok(stale.into_iter().map(|(index, _)| index).collect())
        })
    }

    pub fn mark_has_schema(&self, table: &TableId) -> Result<()> {
        self.update(table, |m| {
            m.has_schema = true;
            Ok(())
        })
    }

    /// Chunks not yet `done`, in index order
    pub fn list_unfinished(&self, table: &TableId) -> Result<Vec<ChunkSpec>> {
        let manifest = self.load(table)?;
        Ok(manifest
            .chunks
            .iter()
            .filter(|c| c.status.state != ChunkState::Done)
            .map(|c| manifest.spec(c))
            .collect())
    }

    /// Tables with a manifest under the dump directory, sorted
    pub fn list_tables(&self) -> Result<Vec<TableId>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(TransferError::io(
                    format!("listing {}", self.root.display()),
                    e,
                ))
            }
        };

        let mut tables = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| TransferError::io(format!("listing {}", self.root.display()), e))?;
            let path = entry.path().join(MANIFEST_FILE);
            if !path.is_file() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            let id = match read_json::<Manifest>(&path, &dir_name) {
                Ok(Some(manifest)) => manifest.table_id(),
                _ => TableId::parse(&dir_name),
            };
            tables.push(id);
        }
        tables.sort();
        Ok(tables)
    }

    fn update<T>(&self, table: &TableId, f: impl FnOnce(&mut Manifest) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut manifest = self.load(table)?;
        let value = f(&mut manifest)?;

        manifest.refresh_totals();
        manifest.updated_at = Utc::now();
        manifest.finished_at = if manifest.is_complete() {
            manifest.finished_at.or(Some(manifest.updated_at))
        } else {
            None
        };

        write_json_atomic(&self.manifest_path(table), &manifest)?;
        Ok(value)
    }
}
