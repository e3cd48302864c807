// ABOUTME: Restore command: loads a dump set into a destination database
// ABOUTME: Resumes from per-destination progress, with optional operator replay of chunks

use crate::config::{PreLoadPolicy, TransferSettings};
use crate::postgres::PgConnector;
use crate::transfer::{
    run_restore, JobContext, JobSummary, LoadOptions, RestoreLoader, RestoreProgressStore, TableId,
};
use anyhow::{bail, Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Destination and selection for one restore run
#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    /// Profile name; keys the restore progress files
    pub destination_name: String,
    pub destination_url: String,
    /// Tables to restore, every dumped table when empty
    pub tables: Vec<String>,
    /// `table` or `table:index` entries to force back to pending
    pub replay: Vec<String>,
    pub skip_confirmation: bool,
}

/// Restore a dump set into the destination database
///
/// Each table gets its pre-load policy once, each chunk loads in its own
/// transaction, and progress is recorded per destination so the command
/// can be rerun until every chunk is loaded.
pub async fn restore(
    request: &RestoreRequest,
    settings: TransferSettings,
    cancel: CancellationToken,
) -> Result<JobSummary> {
    settings.validate()?;
    tracing::info!(
        "Starting restore into '{}' (pre-load: {}, transactions: {}, disable indexes: {})",
        request.destination_name,
        settings.pre_load,
        if settings.use_transactions { "on" } else { "off" },
        if settings.disable_indexes { "yes" } else { "no" }
    );
    if !settings.use_transactions {
        tracing::warn!("⚠ Transactions are off: a chunk that fails midway can stay partially applied");
    }

    let ctx = JobContext::new(settings, cancel).with_progress_bar();

    let ids: Vec<TableId> = if request.tables.is_empty() {
        ctx.manifests
            .list_tables()
            .context("Failed to list dumped tables")?
    } else {
        request.tables.iter().map(|t| TableId::parse(t)).collect()
    };
    if ids.is_empty() {
        bail!(
            "No dumped tables found in {}",
            ctx.settings.dump_dir.display()
        );
    }

    if ctx.settings.pre_load == PreLoadPolicy::DropRecreate && !request.skip_confirmation {
        confirm_drop(&request.destination_name, &ids)?;
    }

    let progress = Arc::new(RestoreProgressStore::new(
        ctx.settings.dump_dir.clone(),
        request.destination_name.clone(),
    ));

    for entry in &request.replay {
        let (table, index) = parse_replay(entry)?;
        let manifest = ctx
            .manifests
            .load(&table)
            .with_context(|| format!("Cannot replay {}", entry))?;
        progress.load_or_init(&manifest)?;
        let replayed = progress.replay(&table, index)?;
        if replayed.is_empty() {
            tracing::warn!("⚠ Nothing to replay for {}: no loaded chunk matched", entry);
        } else {
            tracing::info!("Replaying {} chunk(s) of {}", replayed.len(), table);
        }
    }

    let loader = RestoreLoader::new(
        ctx.manifests.clone(),
        progress,
        LoadOptions {
            pre_load: ctx.settings.pre_load,
            disable_indexes: ctx.settings.disable_indexes,
            use_transactions: ctx.settings.use_transactions,
        },
        ctx.settings.retry_policy(),
    );
    let connector = PgConnector::new(
        request.destination_name.clone(),
        request.destination_url.clone(),
    );

    let summary = run_restore(&ctx, &connector, &loader, &ids)
        .await
        .context("Restore job failed")?;

    summary.log("Restore");
    Ok(summary)
}

fn confirm_drop(destination: &str, tables: &[TableId]) -> Result<()> {
    println!();
    println!("The following tables will be DROPPED and recreated on '{}':", destination);
    for table in tables {
        println!("  - {}", table);
    }
    println!();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Drop and recreate these tables?")
        .default(false)
        .interact()
        .context("Failed to get confirmation")?;

    if !confirmed {
        tracing::warn!("⚠ User cancelled operation");
        bail!("Restore cancelled by user");
    }
    Ok(())
}

/// Parse `schema.table` or `schema.table:index`
pub fn parse_replay(entry: &str) -> Result<(TableId, Option<u32>)> {
    match entry.rsplit_once(':') {
        Some((table, index)) => {
            let index: u32 = index
                .parse()
                .with_context(|| format!("Invalid chunk index in replay entry '{}'", entry))?;
            if table.is_empty() {
                bail!("Replay entry '{}' has no table", entry);
            }
            Ok((TableId::parse(table), Some(index)))
        }
        None if entry.is_empty() => bail!("Empty replay entry"),
        None => Ok((TableId::parse(entry), None)),
    }
}
