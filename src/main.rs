use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repomirror::config::{parse_duration, CONFIG_FILE_NAME};
use repomirror::daemon::{daemonize, is_daemon_running, stop_daemon};
use repomirror::discovery::find_root;
use repomirror::{Config, Daemon, DaemonTarget, RepoConfig, SyncEngine, SyncError, SyncResult};

#[derive(Parser)]
#[command(name = "repomirror")]
#[command(about = "Mirror GitHub repositories into local directories over the contents API")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Set a field of the repository record in the current root
    Config {
        /// One of: username, token, repo, branch, quiet
        key: String,

        /// New value; an empty string clears the field
        value: String,
    },

    /// Create ./<name> from a remote repository and download it
    Clone {
        /// Repository identifier (owner/name)
        repository: String,

        /// Branch to track (defaults to the repository's default branch)
        branch: Option<String>,
    },

    /// Download the remote branch over the current root without deleting anything
    Pull,

    /// Make the current root an exact mirror of the remote branch
    Update,

    /// Upload one file to the remote branch
    Push {
        file: PathBuf,
    },

    /// Keep updating in the foreground on a timer
    Daemon {
        /// Interval between updates (e.g. 300, 30s, 5m, 1h)
        interval: Option<String>,

        /// Update every root below the current directory
        #[arg(long)]
        all: bool,
    },

    /// Start the daemon as a background service
    Service {
        /// Interval between updates (e.g. 300, 30s, 5m, 1h)
        interval: Option<String>,

        /// Update every root below the current directory
        #[arg(long)]
        all: bool,
    },

    /// Stop a running background service
    Stop,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    // Forking is only safe before the runtime spawns its worker threads
    if let Commands::Service { interval, .. } = &cli.command {
        if !prepare_service(&config, interval.as_deref())? {
            return Ok(());
        }
    }

    init_logging(cli.verbose, &config.logging.level)?;
    debug!("Starting repomirror v{}", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    match runtime.block_on(run(cli.command, config)) {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            println!("❌ {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Initialize logging: RUST_LOG wins, then --verbose, then the configured level
fn init_logging(verbose: bool, level: &str) -> Result<()> {
    let fallback = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// Run one command; `Ok(false)` means a failure line was already printed
async fn run(command: Commands, config: Config) -> Result<bool> {
    let config = Arc::new(config);

    match command {
        Commands::Config { key, value } => cmd_config(&key, &value),
        Commands::Clone { repository, branch } => cmd_clone(config, &repository, branch).await,
        Commands::Pull => cmd_pull(config).await,
        Commands::Update => cmd_update(config).await,
        Commands::Push { file } => cmd_push(config, &file).await,
        Commands::Daemon { interval, all } | Commands::Service { interval, all } => {
            cmd_daemon(config, interval.as_deref(), all).await
        }
        Commands::Stop => cmd_stop(&config),
    }
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("Failed to read current directory")
}

/// The enclosing root of the current directory, or a printed failure
fn current_root() -> Result<Option<PathBuf>> {
    let cwd = current_dir()?;
    match find_root(&cwd) {
        Some(root) => Ok(Some(root)),
        None => {
            println!("❌ {}", SyncError::NotFound { path: cwd });
            println!("   Run 'repomirror clone <owner>/<repo>' or 'repomirror config repo <owner>/<repo>'");
            Ok(None)
        }
    }
}

fn parse_interval(interval: Option<&str>) -> Result<Option<Duration>> {
    interval
        .map(|value| parse_duration(value).map(Duration::from_secs))
        .transpose()
        .context("Invalid interval")
}

fn cmd_config(key: &str, value: &str) -> Result<bool> {
    let root = match find_root(&current_dir()?) {
        Some(root) => root,
        None => current_dir()?,
    };

    let mut record = match RepoConfig::load(&root) {
        Ok(record) => record,
        Err(SyncError::NotFound { .. }) => RepoConfig::default(),
        Err(e) => {
            println!("❌ {}", e);
            return Ok(false);
        }
    };

    if let Err(e) = record.set(key, value) {
        println!("❌ {}", e);
        return Ok(false);
    }
    record.save(&root)?;

    let shown = if key == "token" && !value.is_empty() {
        "<redacted>"
    } else {
        value
    };
    println!("✅ Set {} = {} in {}", key, shown, root.join(CONFIG_FILE_NAME).display());
    Ok(true)
}

async fn cmd_clone(config: Arc<Config>, repository: &str, branch: Option<String>) -> Result<bool> {
    let engine = SyncEngine::connect(config)?;
    let branch = match branch {
        Some(branch) => branch,
        None => engine.resolve_branch(repository).await,
    };

    println!("📥 Cloning {} ({})...", repository, branch);
    match engine.clone_into(&current_dir()?, repository, &branch).await {
        Ok((root, result)) => Ok(report("Cloned", &root, &result)),
        Err(e) => {
            println!("❌ Clone failed: {}", e);
            Ok(false)
        }
    }
}

async fn cmd_pull(config: Arc<Config>) -> Result<bool> {
    let Some(root) = current_root()? else {
        return Ok(false);
    };
    let engine = SyncEngine::connect(config)?;

    println!("🔄 Pulling into {}...", root.display());
    match engine.pull_root(&root).await {
        Ok(result) => Ok(report("Pulled", &root, &result)),
        Err(e) => {
            println!("❌ Pull failed: {}", e);
            Ok(false)
        }
    }
}

async fn cmd_update(config: Arc<Config>) -> Result<bool> {
    let Some(root) = current_root()? else {
        return Ok(false);
    };
    let engine = SyncEngine::connect(config)?;

    println!("🔄 Updating {}...", root.display());
    match engine.update_root(&root).await {
        Ok(result) => Ok(report("Updated", &root, &result)),
        Err(e) => {
            println!("❌ Update failed: {}", e);
            Ok(false)
        }
    }
}

async fn cmd_push(config: Arc<Config>, file: &Path) -> Result<bool> {
    let engine = SyncEngine::connect(config)?;

    println!("📤 Pushing {}...", file.display());
    match engine.push_file(file).await {
        Ok(outcome) => {
            let verb = if outcome.created { "Created" } else { "Updated" };
            println!("✅ {} {}", verb, outcome.path);
            if let Some(sha) = outcome.commit_sha {
                println!("   Commit: {}", sha);
            }
            Ok(true)
        }
        Err(e) => {
            println!("❌ Push failed: {}", e);
            Ok(false)
        }
    }
}

/// Print the outcome of a download step
fn report(verb: &str, root: &Path, result: &SyncResult) -> bool {
    if result.success() {
        println!("✅ {} {}", verb, root.display());
        println!("   📄 Files written: {}", result.files_written);
        println!("   📁 Directories created: {}", result.dirs_created);
        true
    } else {
        println!(
            "❌ {} failed: {}",
            root.display(),
            result.failure_reason().unwrap_or_default()
        );
        for failure in result.failures.iter().skip(1) {
            println!("   ❌ {}", failure);
        }
        false
    }
}

/// Check and detach for `service`; returns false when nothing should run
fn prepare_service(config: &Config, interval: Option<&str>) -> Result<bool> {
    if is_daemon_running(config)? {
        println!("⚠️  Daemon is already running!");
        println!("   Use 'repomirror stop' to stop it first");
        return Ok(false);
    }
    parse_interval(interval)?;

    println!("🚀 Starting repomirror service...");
    println!("   PID file: {}", config.daemon.pid_file);
    println!("   Log file: {}", config.daemon.log_file);
    println!("   Sync interval: {}", interval.unwrap_or(&config.daemon.interval));

    daemonize(config)?;
    Ok(true)
}

async fn cmd_daemon(config: Arc<Config>, interval: Option<&str>, all: bool) -> Result<bool> {
    let interval = parse_interval(interval)?;
    let target = DaemonTarget::select(&current_dir()?, all);

    let engine = SyncEngine::connect(config)?;
    let mut daemon = Daemon::new(engine, target.clone(), interval)?;

    println!("🖥️  Mirroring {} every {:?} (Ctrl+C to stop)", target.describe(), daemon.interval());
    daemon.run().await?;

    let stats = daemon.stats();
    info!(
        "Daemon finished: {} iterations, {} updates, {} failures",
        stats.iterations, stats.successful_updates, stats.failed_updates
    );
    println!("✅ Daemon stopped");
    Ok(true)
}

fn cmd_stop(config: &Config) -> Result<bool> {
    println!("🛑 Stopping repomirror daemon...");

    if stop_daemon(config)? {
        println!("✅ Daemon stop signal sent");
    } else {
        println!("⚠️  No daemon appears to be running");
    }
    Ok(true)
}
