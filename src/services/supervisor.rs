//! Singleton daemon guard and launcher.
//!
//! Exactly one reconciler runs per host: a lock file under the base directory
//! holds the daemon PID, liveness is probed before trusting it, and a stale
//! lock is deleted and replaced. The foreground process spawns the daemon as
//! a detached child running the hidden `daemon-internal` subcommand with its
//! output redirected to `daemon.log`.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::paths::{AppPaths, PathError};
use crate::services::client::BatchClient;
use crate::services::reconciler::{Reconciler, ReconcilerOptions};
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to resolve current executable: {0}")]
    CurrentExe(#[source] io::Error),
    #[error("failed to spawn daemon process: {0}")]
    Spawn(#[source] io::Error),
}

/// Result of an `ensure_daemon` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonLaunch {
    AlreadyRunning(u32),
    Spawned(u32),
}

/// PID of a live daemon, if any. A lock file pointing at a dead or invalid
/// PID is deleted on the way.
pub fn live_daemon_pid(paths: &AppPaths) -> Option<u32> {
    let lock = paths.daemon_lock_path();
    let data = fs::read_to_string(&lock).ok()?;
    let pid = match data.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => pid,
        _ => {
            let _ = fs::remove_file(&lock);
            return None;
        }
    };
    if probe_pid(pid) {
        Some(pid)
    } else {
        info!(pid, "stale daemon lock; removing");
        let _ = fs::remove_file(&lock);
        None
    }
}

/// Start the daemon unless one is already running. Idempotent.
pub fn ensure_daemon(paths: &AppPaths, config_path: &Path) -> Result<DaemonLaunch, SupervisorError> {
    if let Some(pid) = live_daemon_pid(paths) {
        return Ok(DaemonLaunch::AlreadyRunning(pid));
    }

    let exe = std::env::current_exe().map_err(SupervisorError::CurrentExe)?;
    let log_path = paths.daemon_log_path()?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|source| SupervisorError::Io {
            path: log_path.clone(),
            source,
        })?;
    let log_err = log.try_clone().map_err(|source| SupervisorError::Io {
        path: log_path.clone(),
        source,
    })?;

    let child = Command::new(exe)
        .arg("--config")
        .arg(config_path)
        .arg("daemon-internal")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .map_err(SupervisorError::Spawn)?;

    let pid = child.id();
    info!(pid, log = %log_path.display(), "daemon spawned");
    Ok(DaemonLaunch::Spawned(pid))
}

/// Daemon child entry point: claim the lock, run the reconciler until a
/// termination signal arrives, release the lock on the way out.
pub async fn run_daemon_internal(
    store: Arc<Store>,
    paths: AppPaths,
    config: Arc<AppConfig>,
    client: Arc<dyn BatchClient>,
) -> Result<(), SupervisorError> {
    if let Some(pid) = live_daemon_pid(&paths) {
        if pid != std::process::id() {
            info!(pid, "daemon already running; exiting");
            return Ok(());
        }
    }
    let _lock = LockGuard::acquire(&paths)?;
    info!(pid = std::process::id(), "daemon lock acquired");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        if shutdown_tx.send(true).is_err() {
            warn!("reconciler already gone at shutdown");
        }
    });

    let reconciler = Arc::new(Reconciler::new(
        store,
        paths,
        config,
        client,
        ReconcilerOptions::default(),
    ));
    reconciler.run(shutdown_rx).await;
    Ok(())
}

/// Holds the daemon lock; releases it on drop if this process still owns it.
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
}

impl LockGuard {
    pub fn acquire(paths: &AppPaths) -> Result<Self, SupervisorError> {
        let path = paths.daemon_lock_path();
        let pid = std::process::id();
        let tmp = path.with_extension("lock.tmp");
        fs::write(&tmp, pid.to_string()).map_err(|source| SupervisorError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| SupervisorError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path, pid })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(data) if data.trim() == self.pid.to_string() => {
                let _ = fs::remove_file(&self.path);
            }
            _ => {}
        }
    }
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(error) => {
                warn!(%error, "failed to capture SIGTERM");
                return std::future::pending().await;
            }
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(quit) => quit,
            Err(error) => {
                warn!(%error, "failed to capture SIGQUIT");
                return std::future::pending().await;
            }
        };
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received"),
            _ = quit.recv() => info!("SIGQUIT received"),
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("termination signal received"),
            Err(error) => {
                warn!(%error, "failed to capture termination signal");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(unix)]
fn probe_pid(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(windows)]
fn probe_pid(pid: u32) -> bool {
    let output = Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
        .output();
    match output {
        Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&format!("\"{pid}\"")),
        Err(_) => false,
    }
}
