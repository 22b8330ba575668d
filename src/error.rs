//! Error taxonomy for sync operations

use std::path::{Path, PathBuf};

/// Result type for library operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while mirroring a repository
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Remote host unreachable, timed out, or answered with a non-success status
    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    /// No repository config record where one was required
    #[error("No repository config found at or above {}", path.display())]
    NotFound { path: PathBuf },

    /// Create, delete, move or write failure on the local tree
    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Missing or malformed configuration
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl SyncError {
    pub fn network(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Network {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn fs(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the failure came from the remote side rather than the local tree
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network { .. })
    }
}
