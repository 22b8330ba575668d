//! Tree Downloader - materializes a remote directory tree on local disk
//!
//! The walk is driven by a work-list of `(listing url, local directory)` pairs
//! rather than recursion. Failures are collected per entry and never stop the
//! walk: a broken file or an unlistable sub-tree is recorded and the remaining
//! siblings are still attempted.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{CONFIG_FILE_NAME, STAGING_DIR_NAME};
use crate::github::{Credentials, EntryKind, RemoteContents};

/// Outcome of a download or update step
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub files_written: usize,
    pub dirs_created: usize,
    pub failures: Vec<EntryFailure>,
}

/// One entry that could not be materialized
#[derive(Debug, Clone)]
pub struct EntryFailure {
    /// Repository-relative path, or a local path for filesystem steps
    pub path: String,
    pub reason: String,
}

impl fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

impl SyncResult {
    /// A result that failed before doing any work
    pub fn failed(path: impl Into<String>, reason: impl ToString) -> Self {
        let mut result = Self::default();
        result.record_failure(path, reason);
        result
    }

    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    /// First failure, with a count of the others
    pub fn failure_reason(&self) -> Option<String> {
        let first = self.failures.first()?;
        Some(match self.failures.len() {
            1 => first.to_string(),
            n => format!("{} (and {} more)", first, n - 1),
        })
    }

    pub fn record_failure(&mut self, path: impl Into<String>, reason: impl ToString) {
        self.failures.push(EntryFailure {
            path: path.into(),
            reason: reason.to_string(),
        });
    }
}

/// Downloads one repository tree with one set of credentials
pub struct TreeDownloader<'a> {
    remote: &'a dyn RemoteContents,
    credentials: &'a Credentials,
    quiet: bool,
}

impl<'a> TreeDownloader<'a> {
    pub fn new(remote: &'a dyn RemoteContents, credentials: &'a Credentials) -> Self {
        Self {
            remote,
            credentials,
            quiet: false,
        }
    }

    /// Log per-file progress at debug level instead of info
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Mirror the remote directory at `remote_url` into `destination`
    ///
    /// Existing files with the same name are overwritten; nothing is deleted
    /// apart from an entry whose kind changed between file and directory.
    pub async fn download(&self, remote_url: &str, destination: &Path) -> SyncResult {
        let mut result = SyncResult::default();
        let mut pending: VecDeque<(String, PathBuf, String)> = VecDeque::new();
        pending.push_back((remote_url.to_string(), destination.to_path_buf(), String::new()));

        while let Some((url, dir, relative)) = pending.pop_front() {
            let entries = match self.remote.list_directory(&url, self.credentials).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Failed to list {}: {}", display_path(&relative), e);
                    result.record_failure(display_path(&relative), e);
                    continue;
                }
            };

            for entry in entries {
                if entry.name == CONFIG_FILE_NAME {
                    debug!("Skipping remote {}", entry.path);
                    continue;
                }
                if entry.name == STAGING_DIR_NAME {
                    warn!("Skipping remote entry with reserved name: {}", entry.path);
                    continue;
                }
                if !is_plain_name(&entry.name) {
                    result.record_failure(&entry.path, format!("unsafe entry name {:?}", entry.name));
                    continue;
                }

                let target = dir.join(&entry.name);
                match entry.kind {
                    EntryKind::File => {
                        let bytes = match self.remote.fetch_file(entry.raw_url(), self.credentials).await {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!("Failed to fetch {}: {}", entry.path, e);
                                result.record_failure(&entry.path, e);
                                continue;
                            }
                        };

                        match write_file(&target, &bytes).await {
                            Ok(()) => {
                                result.files_written += 1;
                                self.progress(format_args!("Downloaded {} ({} bytes)", entry.path, bytes.len()));
                            }
                            Err(e) => {
                                warn!("Failed to write {}: {}", target.display(), e);
                                result.record_failure(&entry.path, e);
                            }
                        }
                    }
                    EntryKind::Directory => match ensure_dir(&target).await {
                        Ok(created) => {
                            if created {
                                result.dirs_created += 1;
                                self.progress(format_args!("Created {}/", entry.path));
                            }
                            pending.push_back((entry.content_url.clone(), target, entry.path.clone()));
                        }
                        Err(e) => {
                            warn!("Failed to create {}: {}", target.display(), e);
                            result.record_failure(&entry.path, e);
                        }
                    },
                    EntryKind::Unsupported => {
                        warn!("Skipping {} (unsupported entry type)", entry.path);
                    }
                }
            }
        }

        result
    }

    fn progress(&self, message: fmt::Arguments<'_>) {
        if self.quiet {
            debug!("{}", message);
        } else {
            info!("{}", message);
        }
    }
}

fn display_path(relative: &str) -> String {
    if relative.is_empty() {
        "/".to_string()
    } else {
        relative.to_string()
    }
}

/// A single path component that cannot escape its parent directory
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Write `bytes` as a regular file, replacing whatever else stands at `target`
///
/// A symlink is removed rather than written through, so remote content never
/// lands outside the destination tree.
async fn write_file(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    match tokio::fs::symlink_metadata(target).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(target).await?,
        Ok(metadata) if !metadata.is_file() => tokio::fs::remove_file(target).await?,
        _ => {}
    }
    tokio::fs::write(target, bytes).await
}

/// Create `dir` if absent; returns whether it was created
async fn ensure_dir(dir: &Path) -> std::io::Result<bool> {
    match tokio::fs::symlink_metadata(dir).await {
        Ok(metadata) if metadata.is_dir() => return Ok(false),
        Ok(_) => tokio::fs::remove_file(dir).await?,
        Err(_) => {}
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(true)
}
