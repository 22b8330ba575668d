//! Reconciler - clean update of a repository root
//!
//! A clean update downloads the remote tree into a staging directory inside
//! the root, and only after that download fully succeeds clears the root and
//! moves the snapshot into place:
//!
//! 1. recreate `.git_temp_update` (dropping any stale copy from a crashed run)
//! 2. download the remote tree into it; on any failure discard it and stop
//! 3. delete every root entry outside the exclusion set
//! 4. move the staged entries into the root
//! 5. remove the staging directory
//!
//! Nested repository roots (any directory below the root holding its own
//! `.git_config`) belong to another mirror. Step 3 prunes around them instead
//! of deleting their ancestors, and step 4 merges into those ancestors and
//! reports a failure rather than replace a nested root.
//!
//! A crash between steps 3 and 4 leaves a partially emptied root, but the
//! next run starts over from step 1 and restores it.

use regex::Regex;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{
    default_max_depth, RepoConfig, CONFIG_FILE_NAME, RESERVED_DIR_NAMES, STAGING_DIR_NAME,
};
use crate::discovery::{absolute, scan_roots};
use crate::download::{SyncResult, TreeDownloader};
use crate::github::{Credentials, RemoteContents};

/// Root-level names a clean update never deletes
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    program_name: Option<OsString>,
    preserve: Vec<Regex>,
}

impl Exclusions {
    pub fn new(program_name: Option<OsString>, preserve_patterns: &[String]) -> Self {
        let preserve = preserve_patterns
            .iter()
            .filter_map(|pattern| match glob_to_regex(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Ignoring invalid preserve pattern {:?}: {}", pattern, e);
                    None
                }
            })
            .collect();

        Self {
            program_name,
            preserve,
        }
    }

    /// Exclusions that protect the running executable
    pub fn for_current_process(preserve_patterns: &[String]) -> Self {
        let program_name = std::env::current_exe()
            .ok()
            .and_then(|path| path.file_name().map(OsStr::to_os_string));
        Self::new(program_name, preserve_patterns)
    }

    pub fn is_excluded(&self, name: &OsStr) -> bool {
        if name == CONFIG_FILE_NAME || name == STAGING_DIR_NAME {
            return true;
        }
        if RESERVED_DIR_NAMES.iter().any(|reserved| name == *reserved) {
            return true;
        }
        if self.program_name.as_deref() == Some(name) {
            return true;
        }
        match name.to_str() {
            Some(name) => self.preserve.iter().any(|re| re.is_match(name)),
            None => false,
        }
    }
}

/// Simple glob pattern matching: `*` matches any run of characters
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped))
}

/// Applies clean updates and pulls to repository roots
pub struct Reconciler<'a> {
    remote: &'a dyn RemoteContents,
    exclusions: &'a Exclusions,
    max_depth: usize,
}

impl<'a> Reconciler<'a> {
    pub fn new(remote: &'a dyn RemoteContents, exclusions: &'a Exclusions) -> Self {
        Self {
            remote,
            exclusions,
            max_depth: default_max_depth(),
        }
    }

    /// How deep to look for nested roots before deleting a directory
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Make `root` an exact mirror of the configured remote branch
    pub async fn reconcile(&self, root: &Path, config: &RepoConfig) -> SyncResult {
        let (repo, branch) = match config.target() {
            Ok(target) => target,
            Err(e) => return SyncResult::failed(root.display().to_string(), e),
        };
        let url = match self.remote.contents_url(repo, branch) {
            Ok(url) => url,
            Err(e) => return SyncResult::failed(repo, e),
        };

        let staging = root.join(STAGING_DIR_NAME);
        if let Err(e) = fresh_dir(&staging).await {
            return SyncResult::failed(staging.display().to_string(), e);
        }

        info!("Updating {} from {} ({})", root.display(), repo, branch);
        let credentials = Credentials::from(config);
        let mut result = TreeDownloader::new(self.remote, &credentials)
            .quiet(config.quiet)
            .download(&url, &staging)
            .await;

        if !result.success() {
            warn!(
                "Download of {} failed, leaving {} untouched: {}",
                repo,
                root.display(),
                result.failure_reason().unwrap_or_default()
            );
            if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                warn!("Failed to remove staging directory {}: {}", staging.display(), e);
            }
            return result;
        }

        self.clear_root(root, &mut result).await;
        self.move_entries(&staging, root, &mut result).await;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            result.record_failure(staging.display().to_string(), e);
        }

        if result.success() {
            info!(
                "Updated {}: {} files, {} new directories",
                root.display(),
                result.files_written,
                result.dirs_created
            );
        }
        result
    }

    /// Download the remote branch over `root` without deleting anything
    pub async fn pull(&self, root: &Path, config: &RepoConfig) -> SyncResult {
        let (repo, branch) = match config.target() {
            Ok(target) => target,
            Err(e) => return SyncResult::failed(root.display().to_string(), e),
        };
        let url = match self.remote.contents_url(repo, branch) {
            Ok(url) => url,
            Err(e) => return SyncResult::failed(repo, e),
        };

        info!("Pulling {} ({}) into {}", repo, branch, root.display());
        let credentials = Credentials::from(config);
        TreeDownloader::new(self.remote, &credentials)
            .quiet(config.quiet)
            .download(&url, root)
            .await
    }

    /// Step 3: delete every root entry outside the exclusion set
    async fn clear_root(&self, root: &Path, result: &mut SyncResult) {
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                result.record_failure(root.display().to_string(), e);
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    result.record_failure(root.display().to_string(), e);
                    break;
                }
            };

            let name = entry.file_name();
            if self.exclusions.is_excluded(&name) {
                debug!("Keeping {}", name.to_string_lossy());
                continue;
            }

            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                match self.nested_roots(&path).await {
                    Ok(nested) if nested.is_empty() => {}
                    Ok(nested) => {
                        prune_around(&absolute(&path), &nested, result).await;
                        continue;
                    }
                    Err(e) => {
                        warn!("Keeping {}, scan for nested roots failed: {}", path.display(), e);
                        result.record_failure(path.display().to_string(), e);
                        continue;
                    }
                }
            }

            delete(&path, result).await;
        }
    }

    /// Step 4: move every staged entry into `root`, replacing same-named entries
    ///
    /// A staged directory whose target holds nested roots is merged entry by
    /// entry. A staged entry that would replace a nested root itself is left
    /// behind and recorded as a failure.
    async fn move_entries(&self, staging: &Path, root: &Path, result: &mut SyncResult) {
        let mut pending = vec![(staging.to_path_buf(), root.to_path_buf())];

        while let Some((from, into)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&from).await {
                Ok(entries) => entries,
                Err(e) => {
                    result.record_failure(from.display().to_string(), e);
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        result.record_failure(from.display().to_string(), e);
                        break;
                    }
                };

                let source = entry.path();
                let target = into.join(entry.file_name());
                if let Ok(existing) = tokio::fs::symlink_metadata(&target).await {
                    let nested = if existing.is_dir() {
                        match self.nested_roots(&target).await {
                            Ok(nested) => nested,
                            Err(e) => {
                                result.record_failure(target.display().to_string(), e);
                                continue;
                            }
                        }
                    } else {
                        Vec::new()
                    };

                    if !nested.is_empty() {
                        let source_is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                        if source_is_dir && !RepoConfig::exists_in(&target) {
                            pending.push((source, target));
                        } else {
                            warn!("Not replacing nested repository root at {}", target.display());
                            result.record_failure(
                                target.display().to_string(),
                                "a nested repository root is in the way",
                            );
                        }
                        continue;
                    }

                    if let Err(e) = remove_entry(&target).await {
                        result.record_failure(target.display().to_string(), e);
                        continue;
                    }
                }

                if let Err(e) = tokio::fs::rename(&source, &target).await {
                    warn!("Failed to move {} into place: {}", target.display(), e);
                    result.record_failure(target.display().to_string(), e);
                }
            }
        }
    }

    /// Repository roots at or below `dir`
    async fn nested_roots(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        scan_roots(dir, self.max_depth).await
    }
}

/// Delete everything under `dir` except the roots in `keep` and their ancestors
async fn prune_around(dir: &Path, keep: &[PathBuf], result: &mut SyncResult) {
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        if keep.contains(&current) {
            debug!("Keeping nested repository root {}", current.display());
            continue;
        }
        if !keep.iter().any(|root| root.starts_with(&current)) {
            delete(&current, result).await;
            continue;
        }

        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) => {
                result.record_failure(current.display().to_string(), e);
                continue;
            }
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => pending.push(entry.path()),
                Ok(None) => break,
                Err(e) => {
                    result.record_failure(current.display().to_string(), e);
                    break;
                }
            }
        }
    }
}

async fn delete(path: &Path, result: &mut SyncResult) {
    if let Err(e) = remove_entry(path).await {
        warn!("Failed to delete {}: {}", path.display(), e);
        result.record_failure(path.display().to_string(), e);
    } else {
        debug!("Deleted {}", path.display());
    }
}

async fn remove_entry(path: &Path) -> std::io::Result<()> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

/// Step 1: an empty directory at `path`, whatever was there before
async fn fresh_dir(path: &Path) -> std::io::Result<()> {
    if tokio::fs::symlink_metadata(path).await.is_ok() {
        warn!("Removing stale staging directory {}", path.display());
        remove_entry(path).await?;
    }
    tokio::fs::create_dir(path).await
}
