//! Per-session working directories on the host.
//!
//! The directory is the only path mounted into the sandbox. It is created
//! fresh for each session and never reused, so concurrent sessions cannot
//! observe each other's files.

use crate::constants::SESSION_DIR_PREFIX;
use crate::language::validate_file_name;
use crate::session::SessionId;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    pub fn create(work_root: &Path, id: &SessionId) -> Result<Self> {
        std::fs::create_dir_all(work_root)
            .with_context(|| format!("Failed to create work root {}", work_root.display()))?;

        let path = work_root.join(dir_name(id));
        // create_dir (not _all): an existing directory means a collision
        std::fs::create_dir(&path)
            .with_context(|| format!("Failed to create session directory {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // The sandbox user (uid 1000) writes build artifacts here
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777))
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_file(&self, name: &str, contents: &[u8]) -> Result<()> {
        validate_file_name(name)?;
        let target = self.path.join(name);
        std::fs::write(&target, contents)
            .with_context(|| format!("Failed to write {}", target.display()))
    }

    /// Total size of regular files below the directory
    pub fn disk_usage(&self) -> u64 {
        WalkDir::new(&self.path)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    pub fn remove(self) -> Result<()> {
        remove_dir(&self.path)
    }
}

pub fn dir_name(id: &SessionId) -> String {
    format!("{}{}", SESSION_DIR_PREFIX, id)
}

fn remove_dir(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Remove session directories left behind by a previous process.
///
/// Directories of sessions in `live` are kept. Returns the removed paths.
pub fn sweep_stale(work_root: &Path, live: &HashSet<SessionId>) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(work_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list {}", work_root.display()))
        }
    };

    let mut removed = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(id) = name
            .to_str()
            .and_then(|n| n.strip_prefix(SESSION_DIR_PREFIX))
            .and_then(|raw| raw.parse::<SessionId>().ok())
        else {
            continue;
        };
        if live.contains(&id) {
            continue;
        }
        let path = entry.path();
        match remove_dir(&path) {
            Ok(()) => removed.push(path),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to sweep session directory"),
        }
    }
    Ok(removed)
}
