// ABOUTME: Push and pull commands for copying dump sets between machines
// ABOUTME: Resolves a named remote profile and warns about unfinished dumps

use crate::config::ConfigFile;
use crate::remote::remote_from_profile;
use crate::transfer::ManifestStore;
use anyhow::{Context, Result};
use std::path::Path;

/// Copy the local dump directory to a configured remote
///
/// `set_name` defaults to the dump directory's own name.
pub fn push(config: &ConfigFile, remote: &str, set_name: Option<&str>) -> Result<()> {
    let dump_dir = &config.settings.dump_dir;
    if !dump_dir.is_dir() {
        anyhow::bail!("Dump directory {} does not exist", dump_dir.display());
    }
    warn_unfinished(dump_dir)?;

    let name = match set_name {
        Some(name) => name.to_string(),
        None => default_set_name(dump_dir),
    };
    let target = remote_from_profile(config.remote(remote)?);
    tracing::info!("Pushing {} to {} as '{}'...", dump_dir.display(), target.describe(), name);
    target
        .push(dump_dir, &name)
        .with_context(|| format!("Failed to push dump set to remote '{}'", remote))
}

/// Copy a dump set from a configured remote into the local dump directory
pub fn pull(config: &ConfigFile, remote: &str, set_name: Option<&str>) -> Result<()> {
    let dump_dir = &config.settings.dump_dir;
    let name = match set_name {
        Some(name) => name.to_string(),
        None => default_set_name(dump_dir),
    };
    let target = remote_from_profile(config.remote(remote)?);
    tracing::info!("Pulling '{}' from {} into {}...", name, target.describe(), dump_dir.display());
    target
        .pull(&name, dump_dir)
        .with_context(|| format!("Failed to pull dump set from remote '{}'", remote))?;

    let tables = ManifestStore::new(dump_dir).list_tables()?;
    tracing::info!("✓ {} table manifest(s) available locally", tables.len());
    Ok(())
}

fn default_set_name(dump_dir: &Path) -> String {
    dump_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "dump".to_string())
}

fn warn_unfinished(dump_dir: &Path) -> Result<()> {
    let manifests = ManifestStore::new(dump_dir);
    for table in manifests.list_tables()? {
        let manifest = manifests.load(&table)?;
        if !manifest.is_complete() {
            let counts = manifest.counts();
            tracing::warn!(
                "⚠ {} is not fully dumped ({}/{} chunks done)",
                table,
                counts.done,
                counts.total()
            );
        }
    }
    Ok(())
}
