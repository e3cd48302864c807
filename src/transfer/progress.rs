// ABOUTME: Per-destination restore progress for each table of a dump set
// ABOUTME: Tracks loaded chunks and table barriers so a restore can resume anywhere

use crate::error::{Result, TransferError};
use crate::transfer::manifest::{Manifest, StateCounts};
use crate::transfer::state_file::{
    apply_transition, read_json, record_attempt, write_json_atomic, ChunkLedger,
};
use crate::transfer::types::{ChunkState, ChunkStatus, IndexDef, TableId};
use crate::utils::file_name_for;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const PROGRESS_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreChunk {
    pub index: u32,
    #[serde(flatten)]
    pub status: ChunkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    /// Forced back to pending by an operator; its key range is cleared before reloading
    #[serde(default)]
    pub replayed: bool,
}

/// Restore state of one table against one destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreProgress {
    pub version: u32,
    pub table: TableId,
    pub destination: String,
    #[serde(default)]
    pub pre_load_applied: bool,
    /// Indexes dropped before loading, kept so they can be rebuilt after a crash
    #[serde(default)]
    pub disabled_indexes: Option<Vec<IndexDef>>,
    #[serde(default)]
    pub indexes_rebuilt: bool,
    #[serde(default)]
    pub rows_loaded: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub chunks: Vec<RestoreChunk>,
}

impl RestoreProgress {
    pub fn chunk(&self, index: u32) -> Option<&RestoreChunk> {
        self.chunks.iter().find(|c| c.index == index)
    }

    pub fn counts(&self) -> StateCounts {
        StateCounts::from_states(self.chunks.iter().map(|c| c.status.state))
    }

    pub fn is_complete(&self) -> bool {
        self.chunks
            .iter()
            .all(|c| c.status.state == ChunkState::Done)
    }

    /// Indexes still waiting to be rebuilt
    pub fn pending_rebuild(&self) -> Option<&[IndexDef]> {
        match (&self.disabled_indexes, self.indexes_rebuilt) {
            (Some(defs), false) => Some(defs),
            _ => None,
        }
    }
}

impl ChunkLedger for RestoreProgress {
    fn table_id(&self) -> TableId {
        self.table.clone()
    }

    fn status_mut(&mut self, index: u32) -> Option<&mut ChunkStatus> {
        self.chunks
            .iter_mut()
            .find(|c| c.index == index)
            .map(|c| &mut c.status)
    }
}

/// Owner of the `restore-<destination>.json` files under a dump directory
pub struct RestoreProgressStore {
    root: PathBuf,
    destination: String,
    lock: Mutex<()>,
}

impl RestoreProgressStore {
    pub fn new(root: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            destination: destination.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn progress_path(&self, table: &TableId) -> PathBuf {
        progress_path(&self.root, table, &self.destination)
    }

    /// Load the table's progress, creating it from the manifest on first use
    pub fn load_or_init(&self, manifest: &Manifest) -> Result<RestoreProgress> {
        let id = manifest.table_id();
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.progress_path(&id);

        if let Some(progress) = self.read(&path, &id)? {
            let planned: Vec<u32> = manifest.chunks.iter().map(|c| c.index).collect();
            let tracked: Vec<u32> = progress.chunks.iter().map(|c| c.index).collect();
            if planned != tracked {
                return Err(TransferError::ManifestCorruption {
                    table: id.to_string(),
                    message: format!(
                        "restore progress for '{}' tracks {} chunk(s) but the manifest has {}",
                        self.destination,
                        tracked.len(),
                        planned.len()
                    ),
                });
            }
            return Ok(progress);
        }

        let now = Utc::now();
        let progress = RestoreProgress {
            version: PROGRESS_VERSION,
            table: id.clone(),
            destination: self.destination.clone(),
            pre_load_applied: false,
            disabled_indexes: None,
            indexes_rebuilt: false,
            rows_loaded: 0,
            started_at: now,
            updated_at: now,
            finished_at: None,
            chunks: manifest
                .chunks
                .iter()
                .map(|c| RestoreChunk {
                    index: c.index,
                    status: ChunkStatus::default(),
                    rows: None,
                    replayed: false,
                })
                .collect(),
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| TransferError::io(format!("creating {}", dir.display()), e))?;
        }
        write_json_atomic(&path, &progress)?;
        tracing::debug!(
            "Started restore progress for {} -> {}",
            id,
            self.destination
        );
        Ok(progress)
    }

    /// Current progress, `None` when this destination never restored the table
    pub fn load(&self, table: &TableId) -> Result<Option<RestoreProgress>> {
        self.read(&self.progress_path(table), table)
    }

    pub fn transition(
        &self,
        table: &TableId,
        index: u32,
        from: ChunkState,
        to: ChunkState,
    ) -> Result<()> {
        self.update(table, |p| apply_transition(p, index, from, to))
    }

    pub fn begin_attempt(&self, table: &TableId, index: u32) -> Result<u32> {
        self.update(table, |p| record_attempt(p, index))
    }

    pub fn complete(&self, table: &TableId, index: u32, rows: u64) -> Result<()> {
        self.update(table, |p| {
            apply_transition(p, index, ChunkState::InProgress, ChunkState::Done)?;
            if let Some(chunk) = p.chunks.iter_mut().find(|c| c.index == index) {
                chunk.rows = Some(rows);
                chunk.replayed = false;
                chunk.status.last_error = None;
            }
            Ok(())
        })
    }

    pub fn fail(&self, table: &TableId, index: u32, error: &str) -> Result<()> {
        self.update(table, |p| {
            apply_transition(p, index, ChunkState::InProgress, ChunkState::Failed)?;
            if let Some(status) = p.status_mut(index) {
                status.last_error = Some(error.to_string());
            }
            Ok(())
        })
    }

    /// Return failed and orphaned chunks to `pending`
    pub fn requeue(&self, table: &TableId) -> Result<Vec<u32>> {
        self.update(table, |p| {
            let stale: Vec<(u32, ChunkState)> = p
                .chunks
                .iter()
                .filter(|c| matches!(c.status.state, ChunkState::Failed | ChunkState::InProgress))
                .map(|c| (c.index, c.status.state))
                .collect();
            for (index, state) in &stale {
                apply_transition(p, *index, *state, ChunkState::Pending)?;
            }
            Ok(stale.into_iter().map(|(index, _)| index).collect())
        })
    }

    /// Operator-forced replay of loaded chunks
    ///
    /// With an index only that chunk goes back to `pending` and its key range
    /// is cleared before it is reloaded. Without one every loaded chunk is
    /// reset, attempts included, and the table's barriers are re-armed so the
    /// pre-load policy runs again.
    pub fn replay(&self, table: &TableId, index: Option<u32>) -> Result<Vec<u32>> {
        self.update(table, |p| {
            let targets: Vec<u32> = match index {
                Some(index) => {
                    let chunk = p.chunk(index).ok_or_else(|| TransferError::UnknownChunk {
                        table: table.clone(),
                        index,
                    })?;
                    if chunk.status.state == ChunkState::Done {
                        vec![index]
                    } else {
                        Vec::new()
                    }
                }
                None => p
                    .chunks
                    .iter()
                    .filter(|c| c.status.state == ChunkState::Done)
                    .map(|c| c.index)
                    .collect(),
            };

            for target in &targets {
                apply_transition(p, *target, ChunkState::Done, ChunkState::Pending)?;
                if let Some(chunk) = p.chunks.iter_mut().find(|c| c.index == *target) {
                    chunk.rows = None;
                    chunk.replayed = index.is_some();
                    // A full replay starts over behind the re-armed pre-load
                    if index.is_none() {
                        chunk.status.attempts = 0;
                    }
                }
            }

            if index.is_none() {
                p.pre_load_applied = false;
                p.disabled_indexes = None;
                p.indexes_rebuilt = false;
            }
            Ok(targets)
        })
    }

    pub fn mark_pre_load_applied(&self, table: &TableId) -> Result<()> {
        self.update(table, |p| {
            p.pre_load_applied = true;
            Ok(())
        })
    }

    /// Persist index definitions before they are dropped
    pub fn set_disabled_indexes(&self, table: &TableId, indexes: Vec<IndexDef>) -> Result<()> {
        self.update(table, |p| {
            p.disabled_indexes = Some(indexes);
            p.indexes_rebuilt = false;
            Ok(())
        })
    }

    pub fn mark_indexes_rebuilt(&self, table: &TableId) -> Result<()> {
        self.update(table, |p| {
            p.indexes_rebuilt = true;
            Ok(())
        })
    }

    /// Indices of chunks not yet loaded, in order
    pub fn list_unfinished(&self, table: &TableId) -> Result<Vec<u32>> {
        let progress = self
            .load(table)?
            .ok_or_else(|| TransferError::NotPlanned(table.clone()))?;
        Ok(progress
            .chunks
            .iter()
            .filter(|c| c.status.state != ChunkState::Done)
            .map(|c| c.index)
            .collect())
    }

    fn read(&self, path: &Path, table: &TableId) -> Result<Option<RestoreProgress>> {
        let progress: Option<RestoreProgress> = read_json(path, table.as_str())?;
        match progress {
            Some(p) if p.version != PROGRESS_VERSION => Err(TransferError::ManifestCorruption {
                table: table.to_string(),
                message: format!("unsupported restore progress version {}", p.version),
            }),
            other => Ok(other),
        }
    }

    fn update<T>(
        &self,
        table: &TableId,
        f: impl FnOnce(&mut RestoreProgress) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.progress_path(table);

        let mut progress = self
            .read(&path, table)?
            .ok_or_else(|| TransferError::NotPlanned(table.clone()))?;
        let value = f(&mut progress)?;

        progress.rows_loaded = progress
            .chunks
            .iter()
            .filter(|c| c.status.state == ChunkState::Done)
            .filter_map(|c| c.rows)
            .sum();
        progress.updated_at = Utc::now();
        progress.finished_at = if progress.is_complete() {
            progress.finished_at.or(Some(progress.updated_at))
        } else {
            None
        };

        write_json_atomic(&path, &progress)?;
        Ok(value)
    }
}

/// `<root>/<schema>.<table>/restore-<destination>.json`
pub fn progress_path(root: &Path, table: &TableId, destination: &str) -> PathBuf {
    root.join(file_name_for(table.as_str()))
        .join(format!("restore-{}.json", file_name_for(destination)))
}
