// ABOUTME: Restore loader applying chunk artifacts to a destination database
// ABOUTME: Handles pre-load policy, index disable/rebuild and per-chunk transactions with retry

use crate::config::PreLoadPolicy;
use crate::database::{Connection, Connector};
use crate::error::{Result, TransferError};
use crate::sql::{delete_range_statement, drop_index_statement, drop_table_statement, truncate_statement};
use crate::transfer::manifest::{Manifest, ManifestStore};
use crate::transfer::progress::{RestoreProgress, RestoreProgressStore};
use crate::transfer::spool::open_artifact;
use crate::transfer::state_file::blocking_update;
use crate::transfer::types::{ChunkOutcome, ChunkSpec, ChunkState, DumpMode, IndexDef};
use crate::utils::{retry_until_cancelled, RetryPolicy};
use futures::TryStreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Destination-side options for a restore job
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub pre_load: PreLoadPolicy,
    pub disable_indexes: bool,
    pub use_transactions: bool,
}

pub struct RestoreLoader {
    manifests: Arc<ManifestStore>,
    progress: Arc<RestoreProgressStore>,
    options: LoadOptions,
    retry: RetryPolicy,
}

impl RestoreLoader {
    pub fn new(
        manifests: Arc<ManifestStore>,
        progress: Arc<RestoreProgressStore>,
        options: LoadOptions,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            manifests,
            progress,
            options,
            retry,
        }
    }

    pub fn progress(&self) -> &RestoreProgressStore {
        &self.progress
    }

    async fn settle<T, F>(&self, update: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RestoreProgressStore) -> Result<T> + Send + 'static,
    {
        blocking_update(&self.progress, update).await
    }

    async fn current(&self, manifest: &Manifest) -> Result<RestoreProgress> {
        let manifest = manifest.clone();
        self.settle(move |p| p.load_or_init(&manifest)).await
    }

    /// Table-level work that must happen before the first chunk loads
    ///
    /// Each step is recorded in the restore progress file so that it runs
    /// once per table across restarts. Index definitions are persisted
    /// before any index is dropped; drops use `IF EXISTS` and are repeated
    /// on resume until the rebuild has happened.
    pub async fn prepare_table(&self, conn: &mut dyn Connection, manifest: &Manifest) -> Result<()> {
        let id = manifest.table_id();
        let table = &manifest.table;
        let progress = self.current(manifest).await?;

        if !progress.pre_load_applied {
            match self.options.pre_load {
                PreLoadPolicy::Truncate => {
                    conn.execute(&truncate_statement(table)).await?;
                    tracing::info!("Truncated {} on {}", id, self.progress.destination());
                }
                PreLoadPolicy::DropRecreate => {
                    let schema_path = self.manifests.schema_path(&id);
                    let ddl = tokio::fs::read_to_string(&schema_path).await.map_err(|e| {
                        TransferError::Fatal(format!(
                            "drop_recreate needs {} (dump with include_schema enabled): {}",
                            schema_path.display(),
                            e
                        ))
                    })?;
                    conn.execute(&format!("{};\n{}", drop_table_statement(table), ddl))
                        .await?;
                    tracing::info!("Dropped and recreated {} on {}", id, self.progress.destination());
                }
                PreLoadPolicy::Skip => {}
            }
            let applied = id.clone();
            self.settle(move |p| p.mark_pre_load_applied(&applied)).await?;
        }

        if self.options.disable_indexes {
            let progress = self.current(manifest).await?;
            let indexes = match (&progress.disabled_indexes, progress.indexes_rebuilt) {
                (None, _) => {
                    let indexes = conn.secondary_indexes(table).await?;
                    let (disabled, defs) = (id.clone(), indexes.clone());
                    self.settle(move |p| p.set_disabled_indexes(&disabled, defs)).await?;
                    indexes
                }
                (Some(defs), false) => defs.clone(),
                (Some(_), true) => Vec::new(),
            };

            for index in &indexes {
                conn.execute(&drop_index_statement(&table.schema, &index.name))
                    .await?;
                tracing::debug!("Dropped index {} on {}", index.name, id);
            }
            if !indexes.is_empty() {
                tracing::info!("Disabled {} index(es) on {} for loading", indexes.len(), id);
            }
        }

        Ok(())
    }

    /// Load one chunk inside its own transaction
    ///
    /// The artifact checksum is verified against the manifest before any
    /// statement runs; a mismatch or missing file is fatal. With
    /// `clear_range` the chunk's key range is deleted first, in the same
    /// transaction as the load. Returns the rows loaded.
    pub async fn load(
        &self,
        conn: &mut dyn Connection,
        manifest: &Manifest,
        chunk: &ChunkSpec,
        clear_range: bool,
    ) -> Result<u64> {
        let entry = manifest
            .chunk(chunk.index)
            .ok_or_else(|| TransferError::UnknownChunk {
                table: chunk.table.clone(),
                index: chunk.index,
            })?;
        if entry.status.state != ChunkState::Done {
            return Err(TransferError::Fatal(format!(
                "chunk {} of {} has not been dumped ({})",
                chunk.index, chunk.table, entry.status.state
            )));
        }

        let path = self.manifests.artifact_path(&chunk.table, &chunk.artifact);
        let mut blocks =
            open_artifact(path.clone(), manifest.compressed, entry.checksum.clone()).await?;
        let clear = clear_range.then(|| {
            delete_range_statement(&manifest.table, chunk.lower.as_ref(), chunk.upper.as_ref())
        });

        let script = match manifest.mode {
            DumpMode::Copy => None,
            DumpMode::Insert => {
                let mut raw = Vec::new();
                while let Some(block) = blocks.try_next().await? {
                    raw.extend_from_slice(&block);
                }
                let script = String::from_utf8(raw).map_err(|_| {
                    TransferError::Fatal(format!("artifact {} is not valid UTF-8", path.display()))
                })?;
                Some(match &clear {
                    Some(delete) => clear_then_run(&script, delete),
                    None => script,
                })
            }
        };

        let scripted_transaction = manifest.mode == DumpMode::Insert && manifest.transactional_scripts;
        let wrap = self.options.use_transactions && !scripted_transaction;

        if wrap {
            conn.execute("BEGIN").await?;
        }

        let result = async {
            match script {
                Some(script) => {
                    conn.execute(&script).await?;
                    Ok(entry.rows.unwrap_or(0))
                }
                None => {
                    if let Some(delete) = &clear {
                        conn.execute(delete).await?;
                    }
                    conn.bulk_load(&manifest.table, blocks).await
                }
            }
        }
        .await;

        match result {
            Ok(rows) => {
                if wrap {
                    conn.execute("COMMIT").await?;
                }
                Ok(rows)
            }
            Err(e) => {
                if wrap || scripted_transaction {
                    if let Err(rollback) = conn.execute("ROLLBACK").await {
                        tracing::debug!("Rollback after failed chunk also failed: {}", rollback);
                    }
                }
                Err(e)
            }
        }
    }

    /// Claim, load and settle one chunk against the destination
    ///
    /// A chunk that was attempted before may have committed without its
    /// outcome being recorded, so every attempt after the first clears the
    /// chunk's key range before loading. Cancellation is honoured until the
    /// load commits; a committed chunk is always recorded `done`.
    pub async fn run_chunk(
        &self,
        connector: &dyn Connector,
        manifest: &Manifest,
        chunk: &ChunkSpec,
        cancel: &CancellationToken,
    ) -> Result<ChunkOutcome> {
        let table = &chunk.table;
        let index = chunk.index;

        let claimed = table.clone();
        let claim = self
            .settle(move |p| p.transition(&claimed, index, ChunkState::Pending, ChunkState::InProgress))
            .await;
        match claim {
            Ok(()) => {}
            Err(TransferError::StaleState { actual, .. }) => {
                tracing::debug!("Restore chunk {} of {} is {}, skipping", index, table, actual);
                return Ok(ChunkOutcome::Skipped);
            }
            Err(e) => return Err(e),
        }

        let loaded = table.clone();
        let replayed = self
            .settle(move |p| p.load(&loaded))
            .await?
            .and_then(|p| p.chunk(index).map(|c| c.replayed))
            .unwrap_or(false);

        let loader = self;
        let result = retry_until_cancelled(&self.retry, cancel, move |attempt| async move {
            let attempted = table.clone();
            let recorded = loader
                .settle(move |p| p.begin_attempt(&attempted, index))
                .await?;
            if attempt > 1 {
                tracing::info!("Retrying restore of chunk {} of {} (attempt {})", index, table, attempt);
            }
            let clear_range = replayed || recorded > 1;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
                loaded = async {
                    let mut conn = connector.connect().await?;
                    loader.load(conn.as_mut(), manifest, chunk, clear_range).await
                } => loaded,
            }
        })
        .await;

        let settled = table.clone();
        match result {
            Err(TransferError::Cancelled) => {
                self.settle(move |p| {
                    p.transition(&settled, index, ChunkState::InProgress, ChunkState::Pending)
                })
                .await?;
                tracing::info!("⏸ Restore of chunk {} of {} cancelled, left pending", index, table);
                Ok(ChunkOutcome::Cancelled)
            }
            Ok(rows) => {
                self.settle(move |p| p.complete(&settled, index, rows)).await?;
                let bytes = manifest
                    .chunk(index)
                    .and_then(|c| c.bytes)
                    .unwrap_or(0);
                Ok(ChunkOutcome::Done { rows, bytes })
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!("✗ Restore of chunk {} of {} failed: {}", index, table, message);
                let recorded = message.clone();
                self.settle(move |p| p.fail(&settled, index, &recorded)).await?;
                Ok(ChunkOutcome::Failed(message))
            }
        }
    }

    /// Rebuild indexes dropped by `prepare_table`, once, after the last chunk
    pub async fn finish_table(&self, conn: &mut dyn Connection, manifest: &Manifest) -> Result<()> {
        let id = manifest.table_id();
        let progress = self.current(manifest).await?;
        let Some(indexes) = progress.pending_rebuild() else {
            return Ok(());
        };

        for index in indexes {
            tracing::info!("Rebuilding index {} on {}", index.name, id);
            conn.execute(&rebuild_statement(index)).await?;
        }
        let rebuilt = id.clone();
        self.settle(move |p| p.mark_indexes_rebuilt(&rebuilt)).await?;
        tracing::info!("✓ Rebuilt {} index(es) on {}", indexes.len(), id);
        Ok(())
    }
}

/// Put a range delete ahead of an INSERT script's rows
///
/// Scripts that open their own transaction get the delete right after
/// `BEGIN;` so both commit together.
fn clear_then_run(script: &str, delete: &str) -> String {
    const BEGIN: &str = "\nBEGIN;\n";
    match script.find(BEGIN) {
        Some(pos) => {
            let split = pos + BEGIN.len();
            format!("{}{};\n{}", &script[..split], delete, &script[split..])
        }
        None => format!("{};\n{}", delete, script),
    }
}

/// `CREATE INDEX` statement that tolerates an index surviving a partial drop
pub fn rebuild_statement(index: &IndexDef) -> String {
    let definition = index.definition.trim().trim_end_matches(';');
    if definition.to_ascii_uppercase().contains("IF NOT EXISTS") {
        return definition.to_string();
    }
    match definition.find(" INDEX ") {
        Some(pos) => {
            let split = pos + " INDEX ".len();
            format!("{}IF NOT EXISTS {}", &definition[..split], &definition[split..])
        }
        None => definition.to_string(),
    }
}
