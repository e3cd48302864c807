// ABOUTME: TOML configuration for dump/restore settings, connection profiles and remotes
// ABOUTME: Every setting has a default so a partial or missing file is valid

use crate::transfer::types::DumpMode;
use crate::utils::{validate_connection_string, RetryPolicy};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = ".chunkdump/config.toml";

/// What happens to a destination table before its first chunk is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreLoadPolicy {
    #[default]
    Truncate,
    /// Drop the table and recreate it from the dumped `schema.sql`
    DropRecreate,
    #[serde(rename = "none")]
    Skip,
}

impl std::str::FromStr for PreLoadPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "truncate" => Ok(Self::Truncate),
            "drop_recreate" | "drop-recreate" => Ok(Self::DropRecreate),
            "none" => Ok(Self::Skip),
            other => Err(format!(
                "unknown pre-load policy '{}' (expected truncate, drop_recreate or none)",
                other
            )),
        }
    }
}

impl std::fmt::Display for PreLoadPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncate => f.write_str("truncate"),
            Self::DropRecreate => f.write_str("drop_recreate"),
            Self::Skip => f.write_str("none"),
        }
    }
}

/// Dump and restore settings, the `[settings]` table of the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub dump_dir: PathBuf,
    pub chunk_rows: u64,
    pub compress: bool,
    /// gzip level, 1 (fast) to 9 (small)
    pub compress_level: u32,
    pub dump_mode: DumpMode,
    /// Write `schema.sql` in copy mode too (always written in insert mode)
    pub include_schema: bool,
    pub schema_includes_indexes: bool,
    pub insert_batch_size: usize,
    /// Wrap every chunk in its own transaction
    pub use_transactions: bool,
    pub pre_load: PreLoadPolicy,
    pub disable_indexes: bool,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub parallelism: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            dump_dir: PathBuf::from("./dumps"),
            chunk_rows: 500_000,
            compress: true,
            compress_level: 6,
            dump_mode: DumpMode::Copy,
            include_schema: true,
            schema_includes_indexes: true,
            insert_batch_size: 1000,
            use_transactions: true,
            pre_load: PreLoadPolicy::Truncate,
            disable_indexes: false,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_cap_ms: 60_000,
            parallelism: 2,
        }
    }
}

impl TransferSettings {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_rows == 0 {
            bail!("chunk_rows must be at least 1");
        }
        if !(1..=9).contains(&self.compress_level) {
            bail!("compress_level must be between 1 and 9, got {}", self.compress_level);
        }
        if self.insert_batch_size == 0 {
            bail!("insert_batch_size must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.parallelism == 0 {
            bail!("parallelism must be at least 1");
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            bail!(
                "backoff_cap_ms ({}) must not be below backoff_base_ms ({})",
                self.backoff_cap_ms,
                self.backoff_base_ms
            );
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }
}

/// A named database, either as a full URL or as its parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
}

impl ConnectionProfile {
    /// PostgreSQL connection URL for this profile
    pub fn url(&self) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }

        let host = self
            .host
            .as_deref()
            .context("connection profile needs either 'url' or 'host'")?;
        let user = self.user.as_deref().unwrap_or("postgres");
        let credentials = match &self.password {
            Some(password) => format!("{}:{}", user, password),
            None => user.to_string(),
        };
        Ok(format!(
            "postgresql://{}@{}:{}/{}",
            credentials,
            host,
            self.port.unwrap_or(5432),
            self.database.as_deref().unwrap_or("postgres")
        ))
    }
}

/// Where `push`/`pull` copy a dump directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteProfile {
    /// A directory on a mounted filesystem
    Mirror { path: PathBuf },
    /// External copy commands, e.g. `kubectl cp {src} mypod:{dst}`
    ///
    /// `{src}` and `{dst}` are substituted; `remote_dir` is the path on the
    /// remote side.
    Command {
        push: String,
        pull: String,
        remote_dir: String,
    },
}

/// Full contents of the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub settings: TransferSettings,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionProfile>,
    #[serde(default)]
    pub remotes: BTreeMap<String, RemoteProfile>,
}

impl ConfigFile {
    /// Load `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.settings.validate()?;
        Ok(config)
    }

    /// Resolve a profile name or a literal connection URL
    ///
    /// Returns a label for logs and progress files together with the URL.
    pub fn resolve_connection(&self, name_or_url: &str) -> Result<(String, String)> {
        if let Some(profile) = self.connections.get(name_or_url) {
            let url = profile
                .url()
                .with_context(|| format!("Connection profile '{}' is incomplete", name_or_url))?;
            validate_connection_string(&url)?;
            return Ok((name_or_url.to_string(), url));
        }

        if name_or_url.starts_with("postgres://") || name_or_url.starts_with("postgresql://") {
            validate_connection_string(name_or_url)?;
            return Ok((connection_label(name_or_url), name_or_url.to_string()));
        }

        let known: Vec<&str> = self.connections.keys().map(|k| k.as_str()).collect();
        bail!(
            "Unknown connection '{}'. Known profiles: {}",
            name_or_url,
            if known.is_empty() {
                "(none)".to_string()
            } else {
                known.join(", ")
            }
        )
    }

    pub fn remote(&self, name: &str) -> Result<&RemoteProfile> {
        self.remotes
            .get(name)
            .with_context(|| format!("Unknown remote '{}'", name))
    }
}

/// `host_port_db` label for an ad-hoc URL, without credentials
fn connection_label(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let rest = rest.rsplit_once('@').map(|(_, r)| r).unwrap_or(rest);
    let rest = rest.split('?').next().unwrap_or(rest);
    rest.replace([':', '/'], "_")
}
