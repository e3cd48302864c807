// ABOUTME: Remote copy of dump directories for push/pull
// ABOUTME: Local mirror directories and external command templates such as kubectl cp

use crate::config::RemoteProfile;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Somewhere a dump set can be copied to and from
pub trait RemoteTarget {
    fn describe(&self) -> String;

    /// Copy the local directory `local` to `name` on the remote side
    fn push(&self, local: &Path, name: &str) -> Result<()>;

    /// Copy `name` from the remote side into the local directory `local`
    fn pull(&self, name: &str, local: &Path) -> Result<()>;
}

pub fn remote_from_profile(profile: &RemoteProfile) -> Box<dyn RemoteTarget> {
    match profile {
        RemoteProfile::Mirror { path } => Box::new(LocalMirror::new(path.clone())),
        RemoteProfile::Command {
            push,
            pull,
            remote_dir,
        } => Box::new(CommandRemote::new(push.clone(), pull.clone(), remote_dir.clone())),
    }
}

/// A directory on a mounted filesystem
pub struct LocalMirror {
    root: PathBuf,
}

impl LocalMirror {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl RemoteTarget for LocalMirror {
    fn describe(&self) -> String {
        format!("mirror {}", self.root.display())
    }

    fn push(&self, local: &Path, name: &str) -> Result<()> {
        let copied = copy_tree(local, &self.root.join(name))?;
        tracing::info!("✓ Copied {} file(s) to {}", copied, self.describe());
        Ok(())
    }

    fn pull(&self, name: &str, local: &Path) -> Result<()> {
        let source = self.root.join(name);
        if !source.is_dir() {
            bail!("{} does not exist on {}", name, self.describe());
        }
        let copied = copy_tree(&source, local)?;
        tracing::info!("✓ Copied {} file(s) from {}", copied, self.describe());
        Ok(())
    }
}

/// External copy commands with `{src}` and `{dst}` placeholders
pub struct CommandRemote {
    push_template: String,
    pull_template: String,
    remote_dir: String,
}

impl CommandRemote {
    pub fn new(push_template: String, pull_template: String, remote_dir: String) -> Self {
        Self {
            push_template,
            pull_template,
            remote_dir,
        }
    }

    fn remote_path(&self, name: &str) -> String {
        format!("{}/{}", self.remote_dir.trim_end_matches('/'), name)
    }

    fn run(&self, template: &str, src: &str, dst: &str) -> Result<()> {
        let argv = expand_template(template, src, dst);
        let (program, args) = argv
            .split_first()
            .context("Remote copy command template is empty")?;

        tracing::info!("$ {}", argv.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute {}. Is it installed?", program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} failed: {}", program, stderr.trim());
        }
        Ok(())
    }
}

impl RemoteTarget for CommandRemote {
    fn describe(&self) -> String {
        format!("command remote {}", self.remote_dir)
    }

    fn push(&self, local: &Path, name: &str) -> Result<()> {
        let src = local.to_string_lossy();
        self.run(&self.push_template, &src, &self.remote_path(name))?;
        tracing::info!("✓ Pushed {} to {}", local.display(), self.remote_path(name));
        Ok(())
    }

    fn pull(&self, name: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let dst = local.to_string_lossy();
        self.run(&self.pull_template, &self.remote_path(name), &dst)?;
        tracing::info!("✓ Pulled {} into {}", self.remote_path(name), local.display());
        Ok(())
    }
}

/// Split a template on whitespace and substitute the placeholders per argument
pub fn expand_template(template: &str, src: &str, dst: &str) -> Vec<String> {
    template
        .split_whitespace()
        .map(|arg| arg.replace("{src}", src).replace("{dst}", dst))
        .collect()
}

/// Recursively copy `src` into `dst`, skipping unfinished `.part` artifacts
fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst).with_context(|| format!("Failed to create {}", dst.display()))?;

    let mut copied = 0;
    for entry in fs::read_dir(src).with_context(|| format!("Failed to read {}", src.display()))? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());

        if path.is_dir() {
            copied += copy_tree(&path, &target)?;
        } else if path.extension().map(|ext| ext == "part").unwrap_or(false) {
            tracing::debug!("Skipping unfinished artifact {}", path.display());
        } else {
            fs::copy(&path, &target).with_context(|| {
                format!("Failed to copy {} to {}", path.display(), target.display())
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}
