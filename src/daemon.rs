//! Daemon Infrastructure - the polling loop that keeps roots mirrored
//!
//! The loop is sequential: scan for roots, update each in turn, sleep, repeat.
//! Shutdown is only observed between roots and while sleeping, so an update
//! that has started always runs to completion.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::discovery::DaemonTarget;
use crate::github::RemoteContents;
use crate::sync::{compile_summary, SyncEngine, SyncSummary};

/// Running totals across iterations
#[derive(Debug, Clone, Default)]
pub struct DaemonStats {
    pub iterations: u64,
    pub successful_updates: u64,
    pub failed_updates: u64,
    pub last_iteration: Option<Instant>,
}

/// Stops a running [`Daemon`] from the signal task
#[derive(Clone)]
pub(crate) struct ShutdownHandle {
    sender: broadcast::Sender<()>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub(crate) fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }
}

/// Daemon state and control
pub struct Daemon<R: RemoteContents> {
    engine: SyncEngine<R>,
    target: DaemonTarget,
    interval: Duration,
    pid_file_path: Option<PathBuf>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_requested: Arc<AtomicBool>,
    stats: DaemonStats,
}

impl<R: RemoteContents> Daemon<R> {
    /// Create a daemon; `interval` overrides `daemon.interval` from the config
    pub fn new(engine: SyncEngine<R>, target: DaemonTarget, interval: Option<Duration>) -> Result<Self> {
        let config = engine.config();
        let interval = match interval {
            Some(interval) => interval,
            None => config
                .daemon
                .interval_duration()
                .context("Failed to parse daemon sync interval")?,
        };
        if interval.is_zero() {
            anyhow::bail!("Daemon interval must be greater than zero");
        }

        let pid_file_path = pid_file_path(config)?;
        let (shutdown_sender, _) = broadcast::channel(1);

        Ok(Self {
            engine,
            target,
            interval,
            pid_file_path,
            shutdown_sender,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            stats: DaemonStats::default(),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    pub(crate) fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: self.shutdown_sender.clone(),
            requested: self.shutdown_requested.clone(),
        }
    }

    /// Run the loop in the foreground until a shutdown signal arrives
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Starting repomirror daemon for {} (interval {:?})",
            self.target.describe(),
            self.interval
        );

        self.write_pid_file().context("Failed to write PID file")?;

        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        let handle = self.shutdown_handle();
        let signal_task = tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            handle.trigger();
        });

        while !self.stop_requested() {
            let summary = self.run_iteration().await;
            self.log_summary(&summary);

            if self.stop_requested() {
                break;
            }

            debug!("Sleeping for {:?}", self.interval);
            tokio::select! {
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received in daemon loop");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        signal_task.abort();
        self.cleanup().context("Failed to cleanup daemon")?;
        Ok(())
    }

    /// One scan-and-update pass over the target
    ///
    /// Every root is isolated: an error or panic while updating one root is
    /// recorded and the remaining roots are still processed.
    pub async fn run_iteration(&mut self) -> SyncSummary {
        let start = Instant::now();
        let roots = self.target.roots(self.engine.config().discovery.max_depth).await;
        debug!("Scanned {} repository roots", roots.len());

        let mut outcomes = Vec::with_capacity(roots.len());
        for root in &roots {
            if self.stop_requested() {
                info!("Stopping iteration early, {} roots not processed", roots.len() - outcomes.len());
                break;
            }
            outcomes.push(self.engine.update_isolated(root).await);
        }

        let summary = compile_summary(outcomes, start.elapsed());
        self.stats.iterations += 1;
        self.stats.successful_updates += summary.successful as u64;
        self.stats.failed_updates += summary.failed as u64;
        self.stats.last_iteration = Some(start);
        summary
    }

    fn stop_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    fn log_summary(&self, summary: &SyncSummary) {
        info!(
            "Iteration {} completed in {:.2}s: {} roots, {} updated, {} failed",
            self.stats.iterations,
            summary.duration.as_secs_f64(),
            summary.total_roots,
            summary.successful,
            summary.failed
        );
        for outcome in summary.outcomes.iter().filter(|o| !o.is_success()) {
            warn!("Failed to update {}", outcome.path().display());
        }
    }

    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }
            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        info!(
            "Daemon stopped after {} iterations ({} updates, {} failures)",
            self.stats.iterations, self.stats.successful_updates, self.stats.failed_updates
        );
        Ok(())
    }
}

/// Wait for SIGTERM or Ctrl+C
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                    _ = terminate.recv() => debug!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("Failed to listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn pid_file_path(config: &Config) -> Result<Option<PathBuf>> {
    if config.daemon.pid_file.is_empty() {
        return Ok(None);
    }
    let expanded = shellexpand::full(&config.daemon.pid_file).context("Failed to expand PID file path")?;
    Ok(Some(PathBuf::from(expanded.as_ref())))
}

fn read_pid(pid_file: &Path) -> Result<u32> {
    let pid_str = fs::read_to_string(pid_file).context("Failed to read PID file")?;
    pid_str.trim().parse().context("Invalid PID in PID file")
}

/// Detach into the background (Unix platforms)
///
/// Must be called before any async runtime is started.
#[cfg(unix)]
pub fn daemonize(config: &Config) -> Result<()> {
    use daemonize::Daemonize;

    let mut daemonize = Daemonize::new()
        .working_directory(std::env::current_dir().context("Failed to read current directory")?);

    if let Some(pid_path) = pid_file_path(config)? {
        daemonize = daemonize.pid_file(pid_path);
    }

    if !config.daemon.log_file.is_empty() {
        let log_path = PathBuf::from(
            shellexpand::full(&config.daemon.log_file)
                .context("Failed to expand log file path")?
                .as_ref(),
        );
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file: {}", log_path.display()))?;

        daemonize = daemonize.stdout(log_file.try_clone()?).stderr(log_file);
    }

    daemonize.start().context("Failed to daemonize process")?;
    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize(_config: &Config) -> Result<()> {
    anyhow::bail!("Running as a background service is only supported on Unix platforms")
}

/// Send SIGTERM to the daemon recorded in the PID file
///
/// Returns whether a signal was sent.
pub fn stop_daemon(config: &Config) -> Result<bool> {
    let Some(pid_file) = pid_file_path(config)? else {
        warn!("No PID file configured, cannot stop daemon");
        return Ok(false);
    };
    if !is_daemon_running(config)? {
        return Ok(false);
    }

    let pid = read_pid(&pid_file)?;

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .context("Failed to send SIGTERM to daemon process")?;
        info!("Shutdown signal sent to daemon process {}", pid);
        Ok(true)
    }

    #[cfg(not(unix))]
    {
        warn!("Daemon stop not implemented for this platform (PID {})", pid);
        Ok(false)
    }
}

/// Check if daemon is currently running by checking PID file
pub fn is_daemon_running(config: &Config) -> Result<bool> {
    let Some(pid_file) = pid_file_path(config)? else {
        return Ok(false);
    };
    if !pid_file.exists() {
        return Ok(false);
    }

    let pid = read_pid(&pid_file)?;

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => Ok(true),
            Err(Errno::ESRCH) => {
                debug!("Removing stale PID file for process {}", pid);
                let _ = fs::remove_file(&pid_file);
                Ok(false)
            }
            // Exists but owned by someone else
            Err(_) => Ok(true),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Ok(true)
    }
}
