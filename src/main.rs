// ABOUTME: CLI entry point for postgres-chunk-dump
// ABOUTME: Parses commands, layers flags over the config file and routes to handlers

use clap::{Args, Parser, Subcommand};
use postgres_chunk_dump::commands::{self, RestoreRequest};
use postgres_chunk_dump::config::{ConfigFile, PreLoadPolicy, TransferSettings, DEFAULT_CONFIG_PATH};
use postgres_chunk_dump::transfer::{DumpMode, JobStatus, JobSummary};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "postgres-chunk-dump")]
#[command(about = "Resumable, chunked PostgreSQL table dump and restore", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

/// Flags that override `[settings]` from the config file
#[derive(Args, Clone, Default)]
struct SettingsArgs {
    /// Directory holding the dump set
    #[arg(long)]
    dump_dir: Option<PathBuf>,
    /// Number of chunks transferred concurrently
    #[arg(long)]
    parallelism: Option<usize>,
    /// Attempts per chunk before it is marked failed
    #[arg(long)]
    max_attempts: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump tables into chunk files, resuming unfinished chunks
    Dump {
        /// Connection profile name or postgresql:// URL
        #[arg(long)]
        source: String,
        /// Tables to dump (schema.table, comma-separated); all tables when omitted
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        /// Target rows per chunk
        #[arg(long)]
        chunk_rows: Option<u64>,
        /// Artifact format: copy or insert
        #[arg(long)]
        mode: Option<DumpMode>,
        /// gzip the artifacts
        #[arg(long, overrides_with = "no_compress")]
        compress: bool,
        /// Write uncompressed artifacts
        #[arg(long, overrides_with = "compress")]
        no_compress: bool,
        /// Write schema.sql next to the chunks
        #[arg(long, overrides_with = "no_schema")]
        include_schema: bool,
        /// Do not write schema.sql
        #[arg(long, overrides_with = "include_schema")]
        no_schema: bool,
        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Load a dump set into a destination database
    Restore {
        /// Connection profile name or postgresql:// URL
        #[arg(long)]
        destination: String,
        /// Tables to restore (schema.table, comma-separated); all dumped tables when omitted
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        /// Pre-load policy: truncate, drop_recreate or none
        #[arg(long)]
        pre_load: Option<PreLoadPolicy>,
        /// Drop secondary indexes while loading and rebuild them afterwards
        #[arg(long, overrides_with = "keep_indexes")]
        disable_indexes: bool,
        /// Keep secondary indexes in place while loading
        #[arg(long, overrides_with = "disable_indexes")]
        keep_indexes: bool,
        /// Load each chunk inside its own transaction
        #[arg(long, overrides_with = "no_transactions")]
        transactions: bool,
        /// Load chunks without wrapping them in transactions
        #[arg(long, overrides_with = "transactions")]
        no_transactions: bool,
        /// Reload `table` or `table:index` even if already loaded (repeatable)
        #[arg(long)]
        replay: Vec<String>,
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Show dump and restore progress from the files on disk
    Inspect {
        /// Tables to show (schema.table, comma-separated)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        /// Also show restore progress for this destination
        #[arg(long)]
        destination: Option<String>,
        #[arg(long)]
        dump_dir: Option<PathBuf>,
    },
    /// Copy the dump directory to a configured remote
    Push {
        #[arg(long)]
        remote: String,
        /// Name of the dump set on the remote, defaults to the dump directory name
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        dump_dir: Option<PathBuf>,
    },
    /// Copy a dump set from a configured remote into the dump directory
    Pull {
        #[arg(long)]
        remote: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        dump_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging - default to INFO level if RUST_LOG not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ConfigFile::load(&cli.config)?;

    match cli.command {
        Commands::Dump {
            source,
            tables,
            chunk_rows,
            mode,
            compress,
            no_compress,
            include_schema,
            no_schema,
            settings,
        } => {
            let mut resolved = config.settings.clone();
            apply_common(&mut resolved, &settings);
            if let Some(rows) = chunk_rows {
                resolved.chunk_rows = rows;
            }
            if let Some(mode) = mode {
                resolved.dump_mode = mode;
            }
            if let Some(compress) = toggle(compress, no_compress) {
                resolved.compress = compress;
            }
            if let Some(include) = toggle(include_schema, no_schema) {
                resolved.include_schema = include;
            }

            let (label, url) = config.resolve_connection(&source)?;
            let cancel = cancel_on_ctrl_c();
            let summary = commands::dump(&label, &url, &tables, resolved, cancel).await?;
            finish(summary)
        }
        Commands::Restore {
            destination,
            tables,
            pre_load,
            disable_indexes,
            keep_indexes,
            transactions,
            no_transactions,
            replay,
            yes,
            settings,
        } => {
            let mut resolved = config.settings.clone();
            apply_common(&mut resolved, &settings);
            if let Some(policy) = pre_load {
                resolved.pre_load = policy;
            }
            if let Some(disable) = toggle(disable_indexes, keep_indexes) {
                resolved.disable_indexes = disable;
            }
            if let Some(wrap) = toggle(transactions, no_transactions) {
                resolved.use_transactions = wrap;
            }

            let (label, url) = config.resolve_connection(&destination)?;
            let request = RestoreRequest {
                destination_name: label,
                destination_url: url,
                tables,
                replay,
                skip_confirmation: yes,
            };
            let cancel = cancel_on_ctrl_c();
            let summary = commands::restore(&request, resolved, cancel).await?;
            finish(summary)
        }
        Commands::Inspect {
            tables,
            destination,
            dump_dir,
        } => {
            let dump_dir = dump_dir.unwrap_or_else(|| config.settings.dump_dir.clone());
            let destination = match destination {
                Some(dest) => Some(config.resolve_connection(&dest)?.0),
                None => None,
            };
            commands::inspect(&dump_dir, &tables, destination.as_deref())?;
            Ok(())
        }
        Commands::Push {
            remote,
            name,
            dump_dir,
        } => {
            if let Some(dir) = dump_dir {
                config.settings.dump_dir = dir;
            }
            commands::push(&config, &remote, name.as_deref())
        }
        Commands::Pull {
            remote,
            name,
            dump_dir,
        } => {
            if let Some(dir) = dump_dir {
                config.settings.dump_dir = dir;
            }
            commands::pull(&config, &remote, name.as_deref())
        }
    }
}

fn apply_common(settings: &mut TransferSettings, args: &SettingsArgs) {
    if let Some(dir) = &args.dump_dir {
        settings.dump_dir = dir.clone();
    }
    if let Some(parallelism) = args.parallelism {
        settings.parallelism = parallelism;
    }
    if let Some(attempts) = args.max_attempts {
        settings.max_attempts = attempts;
    }
}

/// Resolve a `--flag`/`--no-flag` pair; neither keeps the config file value
fn toggle(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

/// First Ctrl+C stops claiming new chunks; in-flight chunks go back to pending
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("⚠ Interrupt received, stopping after in-flight chunks are released...");
            token.cancel();
        }
    });
    cancel
}

fn finish(summary: JobSummary) -> anyhow::Result<()> {
    match summary.status() {
        JobStatus::Complete => Ok(()),
        JobStatus::Incomplete => anyhow::bail!("Job incomplete; rerun the same command to resume"),
        JobStatus::Failed => anyhow::bail!("Job failed; see the summary above for failed tables"),
    }
}
