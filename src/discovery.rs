//! Repository root discovery
//!
//! A repository root is any directory holding a `.git_config` record. Roots are
//! found either by walking upward from a working directory (the nearest
//! enclosing root) or by enumerating every root below a base directory.

use std::collections::{HashSet, VecDeque};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use path_clean::PathClean;
use tracing::{debug, error, warn};

use crate::config::{RepoConfig, RESERVED_DIR_NAMES, STAGING_DIR_NAME};

/// Nearest directory at or above `start` that holds a config record
pub fn find_root(start: &Path) -> Option<PathBuf> {
    let start = absolute(start);
    start
        .ancestors()
        .find(|dir| RepoConfig::exists_in(dir))
        .map(Path::to_path_buf)
}

/// Every root at or below `base`, sorted, including roots nested in other roots
pub fn enumerate_roots(base: &Path, max_depth: usize) -> Vec<PathBuf> {
    let base = absolute(base);
    let mut roots = Vec::new();
    let mut visited = HashSet::new();
    let mut pending = VecDeque::from([(base, 0usize)]);

    while let Some((dir, depth)) = pending.pop_front() {
        let canonical = dir.canonicalize().unwrap_or_else(|_| dir.clone());
        if !visited.insert(canonical) {
            continue;
        }

        if RepoConfig::exists_in(&dir) {
            debug!("Found repository root {}", dir.display());
            roots.push(dir.clone());
        }

        if depth >= max_depth {
            continue;
        }

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                continue;
            }
        };

        for entry in entries.flatten() {
            // file_type() does not follow symlinks
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir && !is_skipped_dir(&entry.file_name()) {
                pending.push_back((entry.path(), depth + 1));
            }
        }
    }

    roots.sort();
    roots
}

/// [`enumerate_roots`] on the blocking thread pool
pub async fn scan_roots(base: &Path, max_depth: usize) -> std::io::Result<Vec<PathBuf>> {
    let base = base.to_path_buf();
    tokio::task::spawn_blocking(move || enumerate_roots(&base, max_depth))
        .await
        .map_err(std::io::Error::other)
}

fn is_skipped_dir(name: &OsStr) -> bool {
    name == STAGING_DIR_NAME || RESERVED_DIR_NAMES.iter().any(|reserved| name == *reserved)
}

pub(crate) fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf().clean()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
            .clean()
    }
}

/// What the daemon loop reconciles on each iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonTarget {
    /// One root, re-checked every iteration
    Single(PathBuf),
    /// Every root below a base directory, re-enumerated every iteration
    Tree { base: PathBuf },
}

impl DaemonTarget {
    /// The single enclosing root of `cwd` unless `all` is set or there is none
    pub fn select(cwd: &Path, all: bool) -> Self {
        match find_root(cwd) {
            Some(root) if !all => DaemonTarget::Single(root),
            _ => DaemonTarget::Tree {
                base: absolute(cwd),
            },
        }
    }

    /// Roots for the current iteration
    ///
    /// A single root is always returned, even if its record has gone missing,
    /// so the failure shows up in that iteration's summary.
    pub async fn roots(&self, max_depth: usize) -> Vec<PathBuf> {
        match self {
            DaemonTarget::Single(root) => vec![root.clone()],
            DaemonTarget::Tree { base } => match scan_roots(base, max_depth).await {
                Ok(roots) => roots,
                Err(e) => {
                    error!("Failed to scan {} for repository roots: {}", base.display(), e);
                    Vec::new()
                }
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DaemonTarget::Single(root) => root.display().to_string(),
            DaemonTarget::Tree { base } => format!("all roots under {}", base.display()),
        }
    }
}
