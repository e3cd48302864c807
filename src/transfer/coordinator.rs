// ABOUTME: Transfer coordinator driving dump and restore jobs over a bounded worker pool
// ABOUTME: Owns the job context, per-table barriers and the final job summary

use crate::config::TransferSettings;
use crate::database::{Connection, Connector};
use crate::error::{Result, TransferError};
use crate::transfer::loader::RestoreLoader;
use crate::transfer::manifest::{Manifest, ManifestOptions, ManifestStore, StateCounts};
use crate::transfer::planner::{plan_chunks, ArtifactNaming};
use crate::transfer::types::{ChunkOutcome, ChunkSpec, ChunkState, DumpMode, TableId};
use crate::transfer::writer::{DumpWriter, WriterOptions};
use crate::utils::{format_bytes, format_duration, retry_classified};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Everything a job's workers share
pub struct JobContext {
    pub settings: TransferSettings,
    pub manifests: Arc<ManifestStore>,
    pub cancel: CancellationToken,
    pub progress: ProgressBar,
}

impl JobContext {
    pub fn new(settings: TransferSettings, cancel: CancellationToken) -> Self {
        let manifests = Arc::new(ManifestStore::new(settings.dump_dir.clone()));
        Self {
            settings,
            manifests,
            cancel,
            progress: ProgressBar::hidden(),
        }
    }

    /// Show a chunk progress bar on the terminal
    pub fn with_progress_bar(mut self) -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} chunks {msg}")
        {
            bar.set_style(style.progress_chars("##-"));
        }
        self.progress = bar;
        self
    }
}

/// Final state of one table in a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableStatus {
    Complete,
    /// Some chunks are not `done`; rerunning resumes them
    Incomplete,
    /// Aborted before or outside chunk work, e.g. planning error or corrupt manifest
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSummary {
    pub table: TableId,
    pub status: TableStatus,
    pub counts: StateCounts,
    pub rows: u64,
    pub bytes: u64,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Complete,
    Incomplete,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Complete => f.write_str("complete"),
            JobStatus::Incomplete => f.write_str("incomplete"),
            JobStatus::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSummary {
    pub tables: Vec<TableSummary>,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl JobSummary {
    /// `complete` only when every chunk of every table is `done`
    pub fn status(&self) -> JobStatus {
        if self
            .tables
            .iter()
            .any(|t| matches!(t.status, TableStatus::Failed(_)))
        {
            JobStatus::Failed
        } else if self
            .tables
            .iter()
            .any(|t| t.status == TableStatus::Incomplete)
        {
            JobStatus::Incomplete
        } else {
            JobStatus::Complete
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status() == JobStatus::Complete
    }

    pub fn table(&self, id: &TableId) -> Option<&TableSummary> {
        self.tables.iter().find(|t| &t.table == id)
    }

    pub fn log(&self, action: &str) {
        tracing::info!("");
        tracing::info!("========================================");
        tracing::info!("{} Summary", action);
        tracing::info!("========================================");
        for table in &self.tables {
            let counts = &table.counts;
            let line = format!(
                "{}: {}/{} done, {} failed, {} pending ({} rows, {})",
                table.table,
                counts.done,
                counts.total(),
                counts.failed,
                counts.pending + counts.in_progress,
                table.rows,
                format_bytes(table.bytes)
            );
            match &table.status {
                TableStatus::Complete => tracing::info!("  ✓ {}", line),
                TableStatus::Incomplete => tracing::warn!("  ⚠ {}", line),
                TableStatus::Failed(reason) => tracing::error!("  ✗ {}: {}", table.table, reason),
            }
            if table.degraded {
                tracing::warn!("    {} was dumped as a single chunk (no primary key)", table.table);
            }
        }
        tracing::info!("Status: {} in {}", self.status(), format_duration(self.elapsed));
        tracing::info!("========================================");
        if self.status() != JobStatus::Complete {
            tracing::info!("Rerun the same command to resume unfinished chunks");
        }
    }
}

/// Per-table ordering points for a restore
///
/// The once-cell runs table preparation before the first chunk of the
/// table; the counter triggers the index rebuild after the last one.
struct TableBarrier {
    prepared: OnceCell<std::result::Result<(), String>>,
    remaining: AtomicUsize,
}

impl TableBarrier {
    fn new(chunks: usize) -> Self {
        Self {
            prepared: OnceCell::new(),
            remaining: AtomicUsize::new(chunks),
        }
    }

    /// True for the worker that finished the table's last scheduled chunk
    fn finish_one(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Dump `tables` from `source` into the dump directory
///
/// Tables already planned are resumed from their manifests: orphaned and
/// failed chunks are requeued and only chunks not `done` are written.
pub async fn run_dump(
    ctx: &JobContext,
    source: &dyn Connector,
    tables: &[TableId],
) -> Result<JobSummary> {
    let started = Instant::now();
    let retry = ctx.settings.retry_policy();
    let writer = DumpWriter::new(
        ctx.manifests.clone(),
        WriterOptions {
            compress_level: ctx.settings.compress_level,
            insert_batch_size: ctx.settings.insert_batch_size,
            schema_includes_indexes: ctx.settings.schema_includes_indexes,
        },
        retry,
    );

    let mut failures: BTreeMap<TableId, String> = BTreeMap::new();
    let mut manifests: Vec<Arc<Manifest>> = Vec::new();

    for id in tables {
        if ctx.cancel.is_cancelled() {
            break;
        }
        tracing::info!("Preparing {}...", id);
        let writer = &writer;
        let prepared = retry_classified(&retry, move |_| async move {
            let mut conn = source.connect().await?;
            prepare_dump_manifest(ctx, writer, conn.as_mut(), id).await
        })
        .await;

        match prepared {
            Ok(manifest) => manifests.push(Arc::new(manifest)),
            Err(e) => {
                tracing::error!("✗ {}: {}", id, e);
                failures.insert(id.clone(), e.to_string());
            }
        }
    }

    let work: Vec<(Arc<Manifest>, ChunkSpec)> = manifests
        .iter()
        .flat_map(|m| {
            m.chunks
                .iter()
                .filter(|c| c.status.state != ChunkState::Done)
                .map(move |c| (m.clone(), m.spec(c)))
        })
        .collect();

    start_progress(ctx, &manifests, |m| m.counts().done);
    tracing::info!(
        "Dumping {} chunk(s) across {} table(s) with {} worker(s)",
        work.len(),
        manifests.len(),
        ctx.settings.parallelism
    );

    let results: Vec<(TableId, Result<ChunkOutcome>)> = stream::iter(work)
        .map(|(manifest, chunk)| {
            let writer = &writer;
            async move {
                if ctx.cancel.is_cancelled() {
                    return (chunk.table.clone(), Ok(ChunkOutcome::Cancelled));
                }
                let outcome = writer.run_chunk(source, &manifest, &chunk, &ctx.cancel).await;
                record_progress(ctx, &chunk, &outcome);
                (chunk.table, outcome)
            }
        })
        .buffer_unordered(ctx.settings.parallelism.max(1))
        .collect()
        .await;

    collect_store_errors(results, &mut failures);
    ctx.progress.finish_and_clear();

    let summary = summarize(ctx, tables, &failures, started, |id| {
        let manifest = ctx.manifests.load(id)?;
        Ok(table_summary(&manifest, manifest.counts(), manifest.totals.rows, manifest.totals.bytes))
    });
    Ok(summary)
}

/// Load or plan the manifest for one table and write its schema artifact
async fn prepare_dump_manifest(
    ctx: &JobContext,
    writer: &DumpWriter,
    conn: &mut dyn Connection,
    id: &TableId,
) -> Result<Manifest> {
    let settings = &ctx.settings;
    let descriptor = conn
        .describe_table(id.schema(), id.name())
        .await
        .map_err(|e| match e {
            TransferError::Transient(_) | TransferError::Planning { .. } => e,
            other => TransferError::planning(id, other.to_string()),
        })?;

    let manifest = if ctx.manifests.exists(id) {
        let existing = ctx.manifests.load(id)?;
        if existing.table.primary_key != descriptor.primary_key {
            return Err(TransferError::planning(
                id,
                format!(
                    "primary key changed from {:?} to {:?} since the manifest was created; \
                     remove {} to re-plan",
                    existing.table.primary_key,
                    descriptor.primary_key,
                    ctx.manifests.table_dir(id).display()
                ),
            ));
        }
        if existing.table.columns != descriptor.columns {
            tracing::warn!(
                "⚠ Columns of {} changed since planning; dumping the planned column list",
                id
            );
        }
        if existing.mode != settings.dump_mode {
            tracing::warn!(
                "⚠ {} was planned in {} mode; keeping it for the resumed dump",
                id,
                existing.mode
            );
        }

        let requeued = ctx.manifests.requeue(id)?;
        if !requeued.is_empty() {
            tracing::info!("Requeued {} unfinished chunk(s) of {}", requeued.len(), id);
        }
        ctx.manifests.load(id)?
    } else {
        let naming = ArtifactNaming {
            mode: settings.dump_mode,
            compressed: settings.compress,
        };
        let plan = plan_chunks(conn, &descriptor, settings.chunk_rows, naming).await?;
        ctx.manifests.create(
            &descriptor,
            &plan,
            ManifestOptions {
                mode: settings.dump_mode,
                compressed: settings.compress,
                transactional_scripts: settings.use_transactions,
                chunk_rows: settings.chunk_rows,
            },
        )?
    };

    if (manifest.mode == DumpMode::Insert || settings.include_schema) && !manifest.has_schema {
        writer.write_schema(conn, &manifest).await?;
        return ctx.manifests.load(id);
    }
    Ok(manifest)
}

/// Restore `tables` from the dump directory into the loader's destination
///
/// Only chunks whose dump is `done` are loaded; the rest stay pending and
/// keep the table incomplete.
pub async fn run_restore(
    ctx: &JobContext,
    destination: &dyn Connector,
    loader: &RestoreLoader,
    tables: &[TableId],
) -> Result<JobSummary> {
    let started = Instant::now();
    let retry = ctx.settings.retry_policy();
    let progress_store = loader.progress();

    let mut failures: BTreeMap<TableId, String> = BTreeMap::new();
    let mut manifests: Vec<Arc<Manifest>> = Vec::new();
    let mut work: Vec<(Arc<Manifest>, ChunkSpec)> = Vec::new();

    for id in tables {
        let prepared = ctx.manifests.load(id).and_then(|manifest| {
            progress_store.load_or_init(&manifest)?;
            let requeued = progress_store.requeue(id)?;
            if !requeued.is_empty() {
                tracing::info!("Requeued {} unfinished restore chunk(s) of {}", requeued.len(), id);
            }
            Ok(manifest)
        });

        let manifest = match prepared {
            Ok(manifest) => Arc::new(manifest),
            Err(e) => {
                tracing::error!("✗ {}: {}", id, e);
                failures.insert(id.clone(), e.to_string());
                continue;
            }
        };

        let unfinished = progress_store.list_unfinished(id)?;
        let mut not_dumped = 0;
        for index in unfinished {
            match manifest.chunk(index) {
                Some(chunk) if chunk.status.state == ChunkState::Done => {
                    work.push((manifest.clone(), manifest.spec(chunk)))
                }
                _ => not_dumped += 1,
            }
        }
        if not_dumped > 0 {
            tracing::warn!(
                "⚠ {} chunk(s) of {} have not been dumped yet and will stay pending",
                not_dumped,
                id
            );
        }
        manifests.push(manifest);
    }

    let mut barriers: HashMap<TableId, TableBarrier> = manifests
        .iter()
        .map(|m| (m.table_id(), TableBarrier::new(0)))
        .collect();
    for (_, chunk) in &work {
        if let Some(barrier) = barriers.get_mut(&chunk.table) {
            *barrier.remaining.get_mut() += 1;
        }
    }

    // Tables with nothing left to load may still owe an index rebuild
    for manifest in &manifests {
        let id = manifest.table_id();
        let idle = barriers
            .get(&id)
            .map(|b| b.remaining.load(Ordering::Acquire) == 0)
            .unwrap_or(false);
        if idle && !ctx.cancel.is_cancelled() {
            if let Err(e) = finish_restore_table(ctx, destination, loader, manifest).await {
                tracing::error!("✗ {}: {}", id, e);
                failures.insert(id, e.to_string());
            }
        }
    }

    start_progress(ctx, &manifests, |m| {
        progress_store
            .load(&m.table_id())
            .ok()
            .flatten()
            .map(|p| p.counts().done)
            .unwrap_or(0)
    });
    tracing::info!(
        "Restoring {} chunk(s) across {} table(s) into {} with {} worker(s)",
        work.len(),
        manifests.len(),
        progress_store.destination(),
        ctx.settings.parallelism
    );

    let barriers = &barriers;
    let results: Vec<(TableId, Result<ChunkOutcome>)> = stream::iter(work)
        .map(|(manifest, chunk)| async move {
            let outcome = restore_chunk(ctx, destination, loader, barriers, &manifest, &chunk).await;
            record_progress(ctx, &chunk, &outcome);
            (chunk.table, outcome)
        })
        .buffer_unordered(ctx.settings.parallelism.max(1))
        .collect()
        .await;

    collect_store_errors(results, &mut failures);
    for (id, barrier) in barriers {
        if let Some(Err(reason)) = barrier.prepared.get() {
            failures.entry(id.clone()).or_insert_with(|| reason.clone());
        }
    }
    ctx.progress.finish_and_clear();

    let summary = summarize(ctx, tables, &failures, started, |id| {
        let manifest = ctx.manifests.load(id)?;
        let progress = progress_store
            .load(id)?
            .ok_or_else(|| TransferError::NotPlanned(id.clone()))?;
        let bytes = progress
            .chunks
            .iter()
            .filter(|c| c.status.state == ChunkState::Done)
            .filter_map(|c| manifest.chunk(c.index).and_then(|m| m.bytes))
            .sum();
        let mut summary = table_summary(&manifest, progress.counts(), progress.rows_loaded, bytes);
        if summary.status == TableStatus::Complete && progress.pending_rebuild().is_some() {
            tracing::warn!("⚠ Indexes on {} are still waiting to be rebuilt", id);
            summary.status = TableStatus::Incomplete;
        }
        Ok(summary)
    });
    Ok(summary)
}

async fn restore_chunk(
    ctx: &JobContext,
    destination: &dyn Connector,
    loader: &RestoreLoader,
    barriers: &HashMap<TableId, TableBarrier>,
    manifest: &Manifest,
    chunk: &ChunkSpec,
) -> Result<ChunkOutcome> {
    if ctx.cancel.is_cancelled() {
        return Ok(ChunkOutcome::Cancelled);
    }
    let barrier = barriers
        .get(&chunk.table)
        .ok_or_else(|| TransferError::NotPlanned(chunk.table.clone()))?;

    let prepared = barrier
        .prepared
        .get_or_init(|| async move {
            let retry = ctx.settings.retry_policy();
            retry_classified(&retry, move |_| async move {
                let mut conn = destination.connect().await?;
                loader.prepare_table(conn.as_mut(), manifest).await
            })
            .await
            .map_err(|e| {
                tracing::error!("✗ Preparing {} failed: {}", chunk.table, e);
                e.to_string()
            })
        })
        .await;

    if let Err(reason) = prepared {
        return Ok(ChunkOutcome::Failed(format!("table preparation failed: {}", reason)));
    }

    let outcome = loader.run_chunk(destination, manifest, chunk, &ctx.cancel).await;

    if barrier.finish_one() && !ctx.cancel.is_cancelled() {
        if let Err(e) = finish_restore_table(ctx, destination, loader, manifest).await {
            tracing::error!("✗ Rebuilding indexes on {} failed: {}", chunk.table, e);
        }
    }
    outcome
}

/// Rebuild indexes once every chunk of the table is loaded
async fn finish_restore_table(
    ctx: &JobContext,
    destination: &dyn Connector,
    loader: &RestoreLoader,
    manifest: &Manifest,
) -> Result<()> {
    let complete = loader
        .progress()
        .load(&manifest.table_id())?
        .map(|p| p.is_complete() && p.pending_rebuild().is_some())
        .unwrap_or(false);
    if !complete {
        return Ok(());
    }

    let retry = ctx.settings.retry_policy();
    retry_classified(&retry, move |_| async move {
        let mut conn = destination.connect().await?;
        loader.finish_table(conn.as_mut(), manifest).await
    })
    .await
}

fn start_progress(ctx: &JobContext, manifests: &[Arc<Manifest>], done: impl Fn(&Manifest) -> usize) {
    let total: usize = manifests.iter().map(|m| m.chunks.len()).sum();
    let finished: usize = manifests.iter().map(|m| done(m.as_ref())).sum();
    ctx.progress.set_length(total as u64);
    ctx.progress.set_position(finished as u64);
}

fn record_progress(ctx: &JobContext, chunk: &ChunkSpec, outcome: &Result<ChunkOutcome>) {
    match outcome {
        Ok(ChunkOutcome::Done { rows, .. }) => {
            ctx.progress.inc(1);
            ctx.progress
                .set_message(format!("{} #{} ({} rows)", chunk.table, chunk.index, rows));
        }
        Ok(ChunkOutcome::Failed(_)) => {
            ctx.progress
                .set_message(format!("{} #{} failed", chunk.table, chunk.index));
        }
        _ => {}
    }
}

/// Errors returned by the stores themselves mean a chunk's state could not be recorded
fn collect_store_errors(
    results: Vec<(TableId, Result<ChunkOutcome>)>,
    failures: &mut BTreeMap<TableId, String>,
) {
    for (table, result) in results {
        if let Err(e) = result {
            tracing::error!("✗ {}: {}", table, e);
            if e.is_table_fatal() {
                failures.entry(table).or_insert_with(|| e.to_string());
            }
        }
    }
}

fn table_summary(manifest: &Manifest, counts: StateCounts, rows: u64, bytes: u64) -> TableSummary {
    let status = if counts.total() > 0 && counts.done == counts.total() {
        TableStatus::Complete
    } else {
        TableStatus::Incomplete
    };
    TableSummary {
        table: manifest.table_id(),
        status,
        counts,
        rows,
        bytes,
        degraded: manifest.degraded,
    }
}

fn summarize(
    ctx: &JobContext,
    tables: &[TableId],
    failures: &BTreeMap<TableId, String>,
    started: Instant,
    summarize_table: impl Fn(&TableId) -> Result<TableSummary>,
) -> JobSummary {
    let tables = tables
        .iter()
        .map(|id| {
            let summary = summarize_table(id);
            match (failures.get(id), summary) {
                (Some(reason), Ok(mut summary)) => {
                    summary.status = TableStatus::Failed(reason.clone());
                    summary
                }
                (Some(reason), Err(_)) => failed_table(id, reason.clone()),
                (None, Ok(summary)) => summary,
                (None, Err(TransferError::NotPlanned(_))) if ctx.cancel.is_cancelled() => {
                    let mut summary = failed_table(id, String::new());
                    summary.status = TableStatus::Incomplete;
                    summary
                }
                (None, Err(e)) => failed_table(id, e.to_string()),
            }
        })
        .collect();

    JobSummary {
        tables,
        elapsed: started.elapsed(),
        cancelled: ctx.cancel.is_cancelled(),
    }
}

fn failed_table(id: &TableId, reason: String) -> TableSummary {
    TableSummary {
        table: id.clone(),
        status: TableStatus::Failed(reason),
        counts: StateCounts::default(),
        rows: 0,
        bytes: 0,
        degraded: false,
    }
}
