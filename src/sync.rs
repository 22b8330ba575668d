//! Sync Engine - per-root orchestration of clone, pull, update and push
//!
//! The engine loads the repository record owned by a root, validates it and
//! hands it to the [`Reconciler`]. Every call threads that root's own record
//! through, so credentials never leak from one root into another.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{split_identifier, Config, RepoConfig, RESERVED_DIR_NAMES, STAGING_DIR_NAME};
use crate::discovery::{absolute, find_root};
use crate::download::SyncResult;
use crate::error::{Result, SyncError};
use crate::github::{Credentials, GitHubClient, PushOutcome, RemoteContents};
use crate::reconcile::{Exclusions, Reconciler};

/// Results from one pass over a set of roots
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub total_roots: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration: Duration,
    pub outcomes: Vec<RootOutcome>,
}

/// What happened to one root during a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootOutcome {
    Updated { path: PathBuf, files_written: usize },
    Failed { path: PathBuf, error: String },
}

impl RootOutcome {
    pub fn path(&self) -> &Path {
        match self {
            RootOutcome::Updated { path, .. } | RootOutcome::Failed { path, .. } => path,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RootOutcome::Updated { .. })
    }
}

/// Tally outcomes into a summary
pub fn compile_summary(outcomes: Vec<RootOutcome>, duration: Duration) -> SyncSummary {
    let successful = outcomes.iter().filter(|o| o.is_success()).count();

    SyncSummary {
        total_roots: outcomes.len(),
        successful,
        failed: outcomes.len() - successful,
        duration,
        outcomes,
    }
}

/// Runs sync operations against repository roots
pub struct SyncEngine<R = GitHubClient> {
    config: Arc<Config>,
    remote: R,
    exclusions: Exclusions,
}

impl SyncEngine<GitHubClient> {
    /// Engine talking to the configured GitHub API
    pub fn connect(config: Arc<Config>) -> Result<Self> {
        let remote = GitHubClient::new(&config.github)?;
        Ok(Self::new(config, remote))
    }

    /// Default branch reported by the API, or the configured fallback
    pub async fn resolve_branch(&self, identifier: &str) -> String {
        let credentials = Credentials {
            username: self.config.github.username.clone(),
            token: self.config.github.token.clone(),
        };

        match self.remote.default_branch(identifier, &credentials).await {
            Ok(branch) => branch,
            Err(e) => {
                warn!(
                    "Could not resolve default branch of {}, using {}: {}",
                    identifier, self.config.sync.default_branch, e
                );
                self.config.sync.default_branch.clone()
            }
        }
    }

    /// Upload one local file to the branch of its enclosing root
    pub async fn push_file(&self, file: &Path) -> Result<PushOutcome> {
        let file = absolute(file);
        let parent = file.parent().unwrap_or(&file).to_path_buf();
        let root = find_root(&parent).ok_or_else(|| SyncError::NotFound { path: parent.clone() })?;

        let relative = file
            .strip_prefix(&root)
            .map_err(|_| SyncError::config(format!("{} is outside {}", file.display(), root.display())))?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();

        if parts.is_empty() || file == RepoConfig::path_in(&root) {
            return Err(SyncError::config(format!("Refusing to push {}", file.display())));
        }
        if parts
            .iter()
            .any(|p| p == STAGING_DIR_NAME || RESERVED_DIR_NAMES.contains(&p.as_str()))
        {
            return Err(SyncError::config(format!(
                "Refusing to push {} from a reserved directory",
                file.display()
            )));
        }

        let record = RepoConfig::load_async(&root).await?;
        let (repo, branch) = record.target()?;
        let content = tokio::fs::read(&file).await.map_err(|e| SyncError::fs(&file, e))?;

        let path = parts.join("/");
        let message = format!("Update {}", path);
        self.remote
            .put_file(repo, branch, &path, &content, &message, &Credentials::from(&record))
            .await
    }
}

impl<R: RemoteContents> SyncEngine<R> {
    /// Engine that protects the running executable during clean updates
    pub fn new(config: Arc<Config>, remote: R) -> Self {
        let exclusions = Exclusions::for_current_process(&config.sync.preserve);
        Self {
            config,
            remote,
            exclusions,
        }
    }

    pub fn with_exclusions(mut self, exclusions: Exclusions) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.remote, &self.exclusions).max_depth(self.config.discovery.max_depth)
    }

    /// Clean update of one root from its own record
    pub async fn update_root(&self, root: &Path) -> Result<SyncResult> {
        let record = RepoConfig::load_async(root).await?;
        record.target()?;
        debug!("Loaded {:?} for {}", record, root.display());
        Ok(self.reconciler().reconcile(root, &record).await)
    }

    /// Download over one root without deleting anything
    pub async fn pull_root(&self, root: &Path) -> Result<SyncResult> {
        let record = RepoConfig::load_async(root).await?;
        record.target()?;
        Ok(self.reconciler().pull(root, &record).await)
    }

    /// Create `parent/<name>` with a fresh record and pull into it
    pub async fn clone_into(
        &self,
        parent: &Path,
        identifier: &str,
        branch: &str,
    ) -> Result<(PathBuf, SyncResult)> {
        let (_, name) = split_identifier(identifier)?;
        let root = absolute(&parent.join(name));

        if RepoConfig::exists_in(&root) {
            return Err(SyncError::config(format!(
                "{} is already a repository root",
                root.display()
            )));
        }
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| SyncError::fs(&root, e))?;

        let record = RepoConfig {
            username: self.config.github.username.clone(),
            token: self.config.github.token.clone(),
            ..RepoConfig::new(identifier, branch)
        };
        record.save(&root)?;
        info!("Cloning {} ({}) into {}", identifier, branch, root.display());

        let result = self.reconciler().pull(&root, &record).await;
        Ok((root, result))
    }

    /// Clean update that turns every error and panic into a failed outcome
    pub async fn update_isolated(&self, root: &Path) -> RootOutcome {
        let attempt = AssertUnwindSafe(self.update_root(root)).catch_unwind().await;

        let error = match attempt {
            Ok(Ok(result)) if result.success() => {
                return RootOutcome::Updated {
                    path: root.to_path_buf(),
                    files_written: result.files_written,
                }
            }
            Ok(Ok(result)) => result.failure_reason().unwrap_or_default(),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };

        error!("Update of {} failed: {}", root.display(), error);
        RootOutcome::Failed {
            path: root.to_path_buf(),
            error,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
