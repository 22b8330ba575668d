use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;

/// File name of the per-root repository record
pub const CONFIG_FILE_NAME: &str = ".git_config";

/// Directory inside a root that holds a snapshot while it is being downloaded
pub const STAGING_DIR_NAME: &str = ".git_temp_update";

/// Directory names that belong to other tools and are never touched or scanned
pub const RESERVED_DIR_NAMES: &[&str] = &[".git"];

/// Main configuration structure for repomirror
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// GitHub API access settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Repository root discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub configuration
#[derive(Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// API endpoint (override for GitHub Enterprise)
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Username copied into records created by `clone`
    pub username: Option<String>,

    /// Token copied into records created by `clone`
    pub token: Option<String>,

    /// Timeout for push requests in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,

    /// Timeout for read requests in seconds; unset leaves it to the transport
    #[serde(default)]
    pub read_timeout: Option<u64>,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Root-level names kept by a clean update (supports `*` wildcards)
    #[serde(default)]
    pub preserve: Vec<String>,

    /// Branch used by `clone` when the API cannot report a default branch
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

/// Discovery configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DiscoveryConfig {
    /// Deepest directory level visited when enumerating roots
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// Sync interval
    #[serde(default = "default_interval")]
    pub interval: String, // "300s", "5m"

    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"
}

// Default value functions
fn default_api_base() -> String {
    "https://api.github.com".to_string()
}
fn default_write_timeout() -> u64 {
    30
}
fn default_branch() -> String {
    "main".to_string()
}
pub(crate) fn default_max_depth() -> usize {
    32
}
fn default_interval() -> String {
    "300s".to_string()
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/repomirror.pid", runtime_dir)
    } else {
        "/tmp/repomirror.pid".to_string()
    }
}

fn default_log_file() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/repomirror/daemon.log", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/repomirror/daemon.log", home)
    } else {
        "/tmp/repomirror-daemon.log".to_string()
    }
}
fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            username: None,
            token: None,
            write_timeout: default_write_timeout(),
            read_timeout: None,
        }
    }
}

impl fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("api_base", &self.api_base)
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("write_timeout", &self.write_timeout)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            preserve: Vec::new(),
            default_branch: default_branch(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Parsed sync interval
    pub fn interval_duration(&self) -> Result<Duration> {
        parse_duration(&self.interval).map(Duration::from_secs)
    }
}

/// Parse duration strings like "300", "30s", "5m", "1h", "2d" into seconds
pub fn parse_duration(duration_str: &str) -> Result<u64> {
    let duration_str = duration_str.trim().to_lowercase();

    let seconds = if let Some(value) = duration_str.strip_suffix('s') {
        value.parse::<u64>().context("Invalid seconds value")?
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value.parse::<u64>().map(|v| v * 60).context("Invalid minutes value")?
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value.parse::<u64>().map(|v| v * 3600).context("Invalid hours value")?
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value.parse::<u64>().map(|v| v * 86400).context("Invalid days value")?
    } else {
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '300', '30s', '5m', '1h'")?
    };

    if seconds == 0 {
        anyhow::bail!("Interval must be greater than zero");
    }
    Ok(seconds)
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repomirror").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.daemon.pid_file = shellexpand::full(&self.daemon.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        self.daemon.log_file = shellexpand::full(&self.daemon.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        Ok(())
    }
}

/// Per-root repository record, stored as JSON in [`CONFIG_FILE_NAME`]
#[derive(Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct RepoConfig {
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    /// Repository identifier in `owner/name` form
    #[serde(default)]
    pub repo: Option<String>,

    #[serde(default)]
    pub branch: Option<String>,

    /// Log per-file progress at debug level only
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub quiet: bool,
}

impl fmt::Debug for RepoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoConfig")
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .field("quiet", &self.quiet)
            .finish()
    }
}

impl RepoConfig {
    /// Keys accepted by [`RepoConfig::set`]
    pub const KEYS: &'static [&'static str] = &["username", "token", "repo", "branch", "quiet"];

    pub fn new(repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo: Some(repo.into()),
            branch: Some(branch.into()),
            ..Default::default()
        }
    }

    /// Path of the record owned by `root`
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE_NAME)
    }

    /// Whether `dir` holds a repository record
    pub fn exists_in(dir: &Path) -> bool {
        Self::path_in(dir).is_file()
    }

    /// Read the record owned by `root`
    pub fn load(root: &Path) -> crate::error::Result<Self> {
        let path = Self::path_in(root);
        if !path.is_file() {
            return Err(SyncError::NotFound {
                path: root.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(&path).map_err(|e| SyncError::fs(&path, e))?;
        Self::parse(&path, &content)
    }

    /// [`RepoConfig::load`] through `tokio::fs`, for use inside the runtime
    pub async fn load_async(root: &Path) -> crate::error::Result<Self> {
        let path = Self::path_in(root);
        let is_file = tokio::fs::metadata(&path)
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(SyncError::NotFound {
                path: root.to_path_buf(),
            });
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SyncError::fs(&path, e))?;
        Self::parse(&path, &content)
    }

    fn parse(path: &Path, content: &str) -> crate::error::Result<Self> {
        serde_json::from_str(content).map_err(|e| {
            SyncError::config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Write the record into `root`
    pub fn save(&self, root: &Path) -> crate::error::Result<()> {
        let path = Self::path_in(root);
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::config(format!("Failed to serialize repository config: {}", e)))?;
        std::fs::write(&path, content).map_err(|e| SyncError::fs(&path, e))
    }

    /// Update one field by name; an empty value clears optional fields
    pub fn set(&mut self, key: &str, value: &str) -> crate::error::Result<()> {
        let optional = if value.trim().is_empty() {
            None
        } else {
            Some(value.trim().to_string())
        };

        match key {
            "username" => self.username = optional,
            "token" => self.token = optional,
            "repo" => {
                if let Some(repo) = &optional {
                    split_identifier(repo)?;
                }
                self.repo = optional;
            }
            "branch" => self.branch = optional,
            "quiet" => {
                self.quiet = match value.trim().to_lowercase().as_str() {
                    "true" | "yes" | "on" | "1" => true,
                    "false" | "no" | "off" | "0" | "" => false,
                    other => {
                        return Err(SyncError::config(format!(
                            "Invalid value for quiet: {} (expected true or false)",
                            other
                        )))
                    }
                };
            }
            other => {
                return Err(SyncError::config(format!(
                    "Unknown config key: {} (expected one of {})",
                    other,
                    Self::KEYS.join(", ")
                )))
            }
        }

        Ok(())
    }

    /// Repository identifier and branch, both required before any sync
    pub fn target(&self) -> crate::error::Result<(&str, &str)> {
        let repo = self
            .repo
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| SyncError::config("No repository set. Run: repomirror config repo <owner>/<name>"))?;
        let branch = self
            .branch
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| SyncError::config("No branch set. Run: repomirror config branch <name>"))?;

        split_identifier(repo)?;
        Ok((repo, branch))
    }
}

/// Split an `owner/name` identifier
pub fn split_identifier(identifier: &str) -> crate::error::Result<(&str, &str)> {
    match identifier.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => Err(SyncError::config(format!(
            "Invalid repository identifier: {} (expected owner/name)",
            identifier
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.github.api_base, "https://api.github.com");
        assert!(config.github.token.is_none());
        assert_eq!(config.github.write_timeout, 30);
        assert!(config.github.read_timeout.is_none());
        assert_eq!(config.sync.default_branch, "main");
        assert!(config.sync.preserve.is_empty());
        assert_eq!(config.discovery.max_depth, 32);
        assert_eq!(config.daemon.interval, "300s");
        assert_eq!(config.daemon.interval_duration().unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("300").unwrap(), 300);
        assert_eq!(parse_duration("45s").unwrap(), 45);
        assert_eq!(parse_duration("5m").unwrap(), 300);
        assert_eq!(parse_duration("2h").unwrap(), 7200);
        assert_eq!(parse_duration("1d").unwrap(), 86400);
        assert_eq!(parse_duration(" 10M ").unwrap(), 600);

        assert!(parse_duration("0").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yml");

        let mut config = Config::default();
        config.github.api_base = "http://127.0.0.1:9999".to_string();
        config.sync.preserve = vec!["*.local".to_string()];
        config.daemon.interval = "10m".to_string();

        config.save(&config_path).expect("Failed to save config");
        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.github.api_base, "http://127.0.0.1:9999");
        assert_eq!(loaded.sync.preserve, vec!["*.local".to_string()]);
        assert_eq!(loaded.daemon.interval, "10m");
    }

    #[test]
    fn test_yaml_partial_sections_fall_back_to_defaults() {
        let yaml_content = r#"
github:
  api_base: "https://ghe.example.com/api/v3"
  write_timeout: 5
daemon:
  interval: "1h"
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.github.api_base, "https://ghe.example.com/api/v3");
        assert_eq!(config.github.write_timeout, 5);
        assert_eq!(config.daemon.interval, "1h");
        assert_eq!(config.sync.default_branch, "main");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.yml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_repo_config_round_trip() {
        let root = TempDir::new().unwrap();

        let mut record = RepoConfig::new("octo/widgets", "main");
        record.username = Some("octo".to_string());
        record.token = Some("ghp_secret".to_string());
        record.save(root.path()).unwrap();

        assert!(RepoConfig::exists_in(root.path()));
        let loaded = RepoConfig::load(root.path()).unwrap();
        assert_eq!(loaded, record);

        let raw = std::fs::read_to_string(RepoConfig::path_in(root.path())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        for key in ["username", "token", "repo", "branch"] {
            assert!(value.get(key).is_some(), "missing key {}", key);
        }
        assert!(value.get("quiet").is_none());
    }

    #[test]
    fn test_repo_config_debug_hides_token() {
        let mut record = RepoConfig::new("octo/widgets", "main");
        record.token = Some("ghp_secret".to_string());

        let rendered = format!("{:?}", record);
        assert!(!rendered.contains("ghp_secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_repo_config_load_missing_is_not_found() {
        let root = TempDir::new().unwrap();
        assert_matches!(RepoConfig::load(root.path()), Err(SyncError::NotFound { .. }));
    }

    #[test]
    fn test_repo_config_load_garbage_is_config_error() {
        let root = TempDir::new().unwrap();
        std::fs::write(RepoConfig::path_in(root.path()), "{not json").unwrap();
        assert_matches!(RepoConfig::load(root.path()), Err(SyncError::Config { .. }));
    }

    #[tokio::test]
    async fn test_repo_config_load_async() {
        let root = TempDir::new().unwrap();
        assert_matches!(
            RepoConfig::load_async(root.path()).await,
            Err(SyncError::NotFound { .. })
        );

        RepoConfig::new("octo/widgets", "dev").save(root.path()).unwrap();
        let loaded = RepoConfig::load_async(root.path()).await.unwrap();
        assert_eq!(loaded, RepoConfig::load(root.path()).unwrap());
        assert_eq!(loaded.branch.as_deref(), Some("dev"));
    }

    #[test]
    fn test_repo_config_set() {
        let mut record = RepoConfig::default();

        record.set("repo", "octo/widgets").unwrap();
        record.set("branch", "develop").unwrap();
        record.set("quiet", "true").unwrap();
        record.set("token", "abc").unwrap();
        assert_eq!(record.target().unwrap(), ("octo/widgets", "develop"));
        assert!(record.quiet);

        record.set("token", "").unwrap();
        assert!(record.token.is_none());

        assert_matches!(record.set("repo", "widgets"), Err(SyncError::Config { .. }));
        assert_matches!(record.set("quiet", "maybe"), Err(SyncError::Config { .. }));
        assert_matches!(record.set("colour", "blue"), Err(SyncError::Config { .. }));
    }

    #[test]
    fn test_target_requires_repo_and_branch() {
        let mut record = RepoConfig::default();
        assert_matches!(record.target(), Err(SyncError::Config { .. }));

        record.repo = Some("octo/widgets".to_string());
        assert_matches!(record.target(), Err(SyncError::Config { .. }));

        record.branch = Some("main".to_string());
        assert!(record.target().is_ok());
    }

    #[test]
    fn test_split_identifier() {
        assert_eq!(split_identifier("octo/widgets").unwrap(), ("octo", "widgets"));
        assert!(split_identifier("widgets").is_err());
        assert!(split_identifier("/widgets").is_err());
        assert!(split_identifier("octo/").is_err());
        assert!(split_identifier("a/b/c").is_err());
    }
}
