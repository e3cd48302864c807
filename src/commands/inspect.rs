// ABOUTME: Inspect command: reports dump and restore progress from the files on disk
// ABOUTME: Never connects to a database

use crate::transfer::manifest::StateCounts;
use crate::transfer::{ChunkState, ManifestStore, RestoreProgressStore, TableId};
use crate::utils::format_bytes;
use anyhow::{Context, Result};
use std::path::Path;

/// Dump-side view of one table
#[derive(Debug, Clone)]
pub struct TableReport {
    pub table: TableId,
    pub mode: String,
    pub compressed: bool,
    pub degraded: bool,
    pub has_schema: bool,
    pub counts: StateCounts,
    pub rows: u64,
    pub bytes: u64,
    /// `(chunk index, last error)` for failed chunks
    pub failures: Vec<(u32, String)>,
    pub restore: Option<RestoreReport>,
}

/// Restore-side view of one table for a single destination
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub destination: String,
    pub counts: StateCounts,
    pub rows_loaded: u64,
    pub pre_load_applied: bool,
    pub pending_rebuild: usize,
    pub failures: Vec<(u32, String)>,
}

/// Summarize the dump set in `dump_dir`
///
/// With a `destination`, restore progress recorded for that destination is
/// included as well.
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use postgres_chunk_dump::commands::inspect;
/// # use std::path::Path;
/// # fn example() -> Result<()> {
/// let reports = inspect(Path::new("./dumps"), &[], Some("staging"))?;
/// for report in reports {
///     println!("{}: {}/{}", report.table, report.counts.done, report.counts.total());
/// }
/// # Ok(())
/// # }
/// ```
pub fn inspect(
    dump_dir: &Path,
    tables: &[String],
    destination: Option<&str>,
) -> Result<Vec<TableReport>> {
    let manifests = ManifestStore::new(dump_dir);
    let ids: Vec<TableId> = if tables.is_empty() {
        manifests.list_tables().context("Failed to list dumped tables")?
    } else {
        tables.iter().map(|t| TableId::parse(t)).collect()
    };
    let progress = destination.map(|d| RestoreProgressStore::new(dump_dir, d));

    let mut reports = Vec::with_capacity(ids.len());
    for id in &ids {
        let manifest = manifests
            .load(id)
            .with_context(|| format!("Failed to read manifest for {}", id))?;

        let restore = match &progress {
            Some(store) => store.load(id)?.map(|p| RestoreReport {
                destination: p.destination.clone(),
                counts: p.counts(),
                rows_loaded: p.rows_loaded,
                pre_load_applied: p.pre_load_applied,
                pending_rebuild: p.pending_rebuild().map(|defs| defs.len()).unwrap_or(0),
                failures: p
                    .chunks
                    .iter()
                    .filter(|c| c.status.state == ChunkState::Failed)
                    .map(|c| (c.index, c.status.last_error.clone().unwrap_or_default()))
                    .collect(),
            }),
            None => None,
        };

        reports.push(TableReport {
            table: id.clone(),
            mode: manifest.mode.to_string(),
            compressed: manifest.compressed,
            degraded: manifest.degraded,
            has_schema: manifest.has_schema,
            counts: manifest.counts(),
            rows: manifest.totals.rows,
            bytes: manifest.totals.bytes,
            failures: manifest
                .chunks
                .iter()
                .filter(|c| c.status.state == ChunkState::Failed)
                .map(|c| (c.index, c.status.last_error.clone().unwrap_or_default()))
                .collect(),
            restore,
        });
    }

    log_reports(dump_dir, &reports, destination);
    Ok(reports)
}

fn log_reports(dump_dir: &Path, reports: &[TableReport], destination: Option<&str>) {
    tracing::info!("Dump set: {}", dump_dir.display());
    if reports.is_empty() {
        tracing::info!("  (no tables)");
        return;
    }

    for report in reports {
        let counts = &report.counts;
        let marker = if counts.done == counts.total() { "✓" } else { "⚠" };
        tracing::info!(
            "{} {} [{}{}]: {}/{} chunks done, {} failed, {} rows, {}",
            marker,
            report.table,
            report.mode,
            if report.compressed { ", gzip" } else { "" },
            counts.done,
            counts.total(),
            counts.failed,
            report.rows,
            format_bytes(report.bytes)
        );
        if report.degraded {
            tracing::info!("    single chunk: table has no primary key");
        }
        for (index, error) in &report.failures {
            tracing::info!("    chunk {} failed: {}", index, error);
        }

        match (&report.restore, destination) {
            (Some(restore), _) => {
                tracing::info!(
                    "    restore into '{}': {}/{} chunks loaded, {} rows{}",
                    restore.destination,
                    restore.counts.done,
                    restore.counts.total(),
                    restore.rows_loaded,
                    if restore.pending_rebuild > 0 {
                        format!(", {} index(es) awaiting rebuild", restore.pending_rebuild)
                    } else {
                        String::new()
                    }
                );
                for (index, error) in &restore.failures {
                    tracing::info!("    restore chunk {} failed: {}", index, error);
                }
            }
            (None, Some(dest)) => tracing::info!("    not restored into '{}' yet", dest),
            (None, None) => {}
        }
    }
}
