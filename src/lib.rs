//! repomirror - keep local directories mirrored from GitHub repositories
//!
//! A directory becomes a repository root once it holds a `.git_config` record
//! naming an `owner/name` repository and a branch. repomirror downloads that
//! branch through the GitHub contents API and makes the root an exact copy of
//! it, either on demand or from a background polling loop.
//!
//! ## Modules
//!
//! - [`config`]: tool configuration (YAML) and per-root records (JSON)
//! - [`github`]: contents API client and the [`RemoteContents`] seam
//! - [`download`]: best-effort recursive tree download
//! - [`reconcile`]: staging-then-swap clean update, and pull
//! - [`discovery`]: upward and downward repository root discovery
//! - [`sync`]: per-root orchestration with failure isolation
//! - [`daemon`]: polling loop, PID file and service management

pub mod config;
pub mod daemon;
pub mod discovery;
pub mod download;
pub mod error;
pub mod github;
pub mod reconcile;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{Config, RepoConfig};
pub use daemon::Daemon;
pub use discovery::DaemonTarget;
pub use download::SyncResult;
pub use error::SyncError;
pub use github::{Credentials, GitHubClient, RemoteContents};
pub use reconcile::Exclusions;
pub use sync::{RootOutcome, SyncEngine, SyncSummary};
