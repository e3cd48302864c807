// ABOUTME: Dump writer streaming one chunk from the source into its artifact
// ABOUTME: Writes to a .part file, fsyncs, renames, then marks the chunk done

use crate::database::{Connection, Connector};
use crate::error::{Result, TransferError};
use crate::transfer::artifact::ArtifactLayout;
use crate::transfer::manifest::{Manifest, ManifestStore};
use crate::transfer::spool::ArtifactSpool;
use crate::transfer::state_file::{blocking_update, write_bytes_atomic};
use crate::transfer::types::{ChunkOutcome, ChunkResult, ChunkSpec, ChunkState, DumpMode};
use crate::utils::{retry_until_cancelled, RetryPolicy};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Options fixed for a whole dump job
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub compress_level: u32,
    pub insert_batch_size: usize,
    pub schema_includes_indexes: bool,
}

pub struct DumpWriter {
    manifests: Arc<ManifestStore>,
    options: WriterOptions,
    retry: RetryPolicy,
}

impl DumpWriter {
    pub fn new(manifests: Arc<ManifestStore>, options: WriterOptions, retry: RetryPolicy) -> Self {
        Self {
            manifests,
            options,
            retry,
        }
    }

    /// Stream one chunk into its artifact
    ///
    /// The data lands in `<artifact>.part` on the blocking pool; only after
    /// the encoder is finished and the file fsynced is it renamed to the
    /// final name, so an artifact either exists complete or not at all.
    /// Cancellation is honoured while rows are still arriving from the
    /// source and discards the partial file.
    pub async fn write(
        &self,
        conn: &mut dyn Connection,
        manifest: &Manifest,
        chunk: &ChunkSpec,
        cancel: &CancellationToken,
    ) -> Result<ChunkResult> {
        let table = &manifest.table;
        let final_path = self.manifests.artifact_path(&chunk.table, &chunk.artifact);
        let level = manifest.compressed.then_some(self.options.compress_level);
        let layout = match manifest.mode {
            DumpMode::Copy => ArtifactLayout::Copy,
            DumpMode::Insert => ArtifactLayout::Insert {
                table: table.clone(),
                chunk_index: chunk.index,
                batch_size: self.options.insert_batch_size,
                transactional: manifest.transactional_scripts,
            },
        };

        let mut spool = ArtifactSpool::start(final_path, level, layout);
        let exported = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            exported = conn.export_range(table, chunk.lower.as_ref(), chunk.upper.as_ref(), &mut spool) => exported,
        };

        match exported {
            Ok(_) => spool.seal().await,
            Err(TransferError::Cancelled) => {
                spool.abandon().await;
                Err(TransferError::Cancelled)
            }
            // A stopped file task explains a failed send better than the send itself
            Err(e) => Err(spool.abandon().await.unwrap_or(e)),
        }
    }

    /// Claim, write and settle one chunk
    ///
    /// Transient failures are retried with backoff, each attempt persisted
    /// on the chunk. Exhausted or fatal failures leave the chunk `failed`;
    /// cancellation puts it back to `pending`.
    pub async fn run_chunk(
        &self,
        connector: &dyn Connector,
        manifest: &Manifest,
        chunk: &ChunkSpec,
        cancel: &CancellationToken,
    ) -> Result<ChunkOutcome> {
        let table = &chunk.table;
        let index = chunk.index;

        let claim = {
            let table = table.clone();
            blocking_update(&self.manifests, move |m| {
                m.transition(&table, index, ChunkState::Pending, ChunkState::InProgress)
            })
            .await
        };
        match claim {
            Ok(()) => {}
            Err(TransferError::StaleState { actual, .. }) => {
                tracing::debug!("Chunk {} of {} is {}, skipping", index, table, actual);
                return Ok(ChunkOutcome::Skipped);
            }
            Err(e) => return Err(e),
        }

        let writer = self;
        let result = retry_until_cancelled(&self.retry, cancel, move |attempt| async move {
            let attempt_table = table.clone();
            blocking_update(&writer.manifests, move |m| m.begin_attempt(&attempt_table, index)).await?;
            if attempt > 1 {
                tracing::info!("Retrying chunk {} of {} (attempt {})", index, table, attempt);
            }
            let mut conn = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                conn = connector.connect() => conn?,
            };
            writer.write(conn.as_mut(), manifest, chunk, cancel).await
        })
        .await;

        let table = table.clone();
        match result {
            Err(TransferError::Cancelled) => {
                blocking_update(&self.manifests, move |m| {
                    m.transition(&table, index, ChunkState::InProgress, ChunkState::Pending)
                })
                .await?;
                tracing::info!("⏸ Chunk {} of {} cancelled, left pending", index, chunk.table);
                Ok(ChunkOutcome::Cancelled)
            }
            Ok(result) => {
                let (rows, bytes) = (result.rows, result.bytes);
                blocking_update(&self.manifests, move |m| m.complete(&table, index, &result)).await?;
                Ok(ChunkOutcome::Done { rows, bytes })
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!("✗ Chunk {} of {} failed: {}", index, table, message);
                let recorded = message.clone();
                blocking_update(&self.manifests, move |m| m.fail(&table, index, &recorded)).await?;
                Ok(ChunkOutcome::Failed(message))
            }
        }
    }

    /// Write `schema.sql` for the table once and flag it in the manifest
    pub async fn write_schema(&self, conn: &mut dyn Connection, manifest: &Manifest) -> Result<()> {
        if manifest.has_schema {
            return Ok(());
        }

        let id = manifest.table_id();
        let ddl = conn
            .table_ddl(&manifest.table, self.options.schema_includes_indexes)
            .await?;
        write_bytes_atomic(&self.manifests.schema_path(&id), ddl.as_bytes())?;
        self.manifests.mark_has_schema(&id)?;
        tracing::info!("Wrote schema for {}", id);
        Ok(())
    }
}
