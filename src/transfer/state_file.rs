// ABOUTME: Crash-safe JSON persistence and compare-and-swap chunk bookkeeping
// ABOUTME: Every write goes to a synced temp file that is atomically renamed into place

use crate::error::{Result, TransferError};
use crate::transfer::types::{ChunkState, ChunkStatus, TableId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Read a JSON document, `Ok(None)` when the file does not exist
///
/// A file that exists but cannot be parsed is reported as
/// `ManifestCorruption` for `label`.
pub fn read_json<D: DeserializeOwned>(path: &Path, label: &str) -> Result<Option<D>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TransferError::io(format!("reading {}", path.display()), e)),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| TransferError::ManifestCorruption {
            table: label.to_string(),
            message: format!("{}: {}", path.display(), e),
        })
}

/// Atomically replace `path` with the pretty-printed JSON of `value`
pub fn write_json_atomic<D: Serialize>(path: &Path, value: &D) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| TransferError::Fatal(format!("serializing {}: {}", path.display(), e)))?;
    bytes.push(b'\n');
    write_bytes_atomic(path, &bytes)
}

/// Atomically replace `path` with `bytes`
///
/// The temp file lives in the destination directory so the final rename
/// never crosses filesystems. Readers observe either the previous contents
/// or the new contents, never a partial file.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| TransferError::io(format!("creating temp file in {}", dir.display()), e))?;
    tmp.write_all(bytes)
        .map_err(|e| TransferError::io(format!("writing temp file for {}", path.display()), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| TransferError::io(format!("syncing temp file for {}", path.display()), e))?;
    tmp.persist(path)
        .map_err(|e| TransferError::io(format!("renaming into {}", path.display()), e.error))?;

    sync_dir(dir);
    Ok(())
}

/// Flush directory metadata so a completed rename survives power loss
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// Run a store update on the blocking pool
///
/// Store updates take the store lock and fsync; off the runtime they stall
/// only the worker awaiting them.
pub async fn blocking_update<S, T, F>(store: &Arc<S>, update: F) -> Result<T>
where
    S: Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || update(&store))
        .await
        .map_err(|e| TransferError::Fatal(format!("state update task failed: {}", e)))?
}

/// A persisted document that tracks per-chunk state
pub trait ChunkLedger {
    fn table_id(&self) -> TableId;

    fn status_mut(&mut self, index: u32) -> Option<&mut ChunkStatus>;

    /// Hook run after a successful transition, e.g. to maintain counters
    fn after_transition(&mut self, _index: u32, _from: ChunkState, _to: ChunkState) {}
}

/// Compare-and-swap a chunk from `from` to `to`
pub fn apply_transition<L: ChunkLedger>(
    doc: &mut L,
    index: u32,
    from: ChunkState,
    to: ChunkState,
) -> Result<()> {
    let table = doc.table_id();
    if !from.can_transition(to) {
        return Err(TransferError::IllegalTransition {
            table,
            index,
            from,
            to,
        });
    }

    let status = doc
        .status_mut(index)
        .ok_or_else(|| TransferError::UnknownChunk {
            table: table.clone(),
            index,
        })?;

    if status.state != from {
        return Err(TransferError::StaleState {
            table,
            index,
            expected: from,
            actual: status.state,
        });
    }

    status.state = to;
    doc.after_transition(index, from, to);
    Ok(())
}

/// Count one more attempt on a chunk currently held `in_progress`
pub fn record_attempt<L: ChunkLedger>(doc: &mut L, index: u32) -> Result<u32> {
    let table = doc.table_id();
    let status = doc
        .status_mut(index)
        .ok_or_else(|| TransferError::UnknownChunk {
            table: table.clone(),
            index,
        })?;

    if status.state != ChunkState::InProgress {
        return Err(TransferError::StaleState {
            table,
            index,
            expected: ChunkState::InProgress,
            actual: status.state,
        });
    }

    status.attempts += 1;
    Ok(status.attempts)
}
