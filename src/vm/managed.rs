//! A detached helper process tracked through its pidfile.
//!
//! The child runs in its own process group so a terminal Ctrl-C reaches
//! only the orchestrator, which then tears the child down deliberately. Its
//! stdout and stderr go to a log file. The child outlives the orchestrator
//! on a successful `start`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::vm::pidfile;

/// How often a watcher polls a process it did not spawn itself.
const ADOPTED_POLL: Duration = Duration::from_secs(1);

pub struct ManagedChild {
    label: String,
    pidfile: PathBuf,
    log_path: PathBuf,
    stop_grace: Duration,
    child: Mutex<Option<Child>>,
}

impl ManagedChild {
    pub fn new(label: impl Into<String>, pidfile: PathBuf, log_path: PathBuf) -> Self {
        Self {
            label: label.into(),
            pidfile,
            log_path,
            stop_grace: Duration::from_secs(10),
            child: Mutex::new(None),
        }
    }

    /// Time between SIGTERM and SIGKILL.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pidfile(&self) -> &Path {
        &self.pidfile
    }

    /// Spawn `cmd` detached and record its pid.
    pub async fn spawn(&self, mut cmd: Command) -> Result<u32> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("failed to open log file {}", self.log_path.display()))?;
        let log_err = log.try_clone().context("failed to clone log handle")?;

        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .kill_on_drop(false);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.label))?;
        let pid = child
            .id()
            .with_context(|| format!("{} exited before reporting a pid", self.label))?;

        pidfile::write(&self.pidfile, pid)
            .with_context(|| format!("failed to write {} pid file", self.label))?;
        *self.child.lock().await = Some(child);

        info!(label = %self.label, pid, "process started");
        Ok(pid)
    }

    pub async fn is_running(&self) -> bool {
        if let Some(child) = self.child.lock().await.as_mut() {
            // Reap our own child so an exited process is not seen as a zombie.
            return matches!(child.try_wait(), Ok(None));
        }
        pidfile::is_running(&self.pidfile)
    }

    /// SIGTERM, then SIGKILL once the grace period lapses. A process that is
    /// already gone is not an error.
    pub async fn stop(&self) -> Result<()> {
        let Some(pid) = pidfile::read(&self.pidfile) else {
            debug!(label = %self.label, "no pid recorded; nothing to stop");
            return Ok(());
        };

        if self.is_running().await {
            info!(label = %self.label, pid, "sending SIGTERM");
            let _ = pidfile::signal(pid, libc::SIGTERM);

            if !self.wait_for_exit(self.stop_grace).await {
                warn!(label = %self.label, pid, "did not exit after SIGTERM; killing");
                let _ = pidfile::signal(pid, libc::SIGKILL);
                if !self.wait_for_exit(Duration::from_secs(5)).await {
                    anyhow::bail!("{} (pid {pid}) survived SIGKILL", self.label);
                }
            }
            info!(label = %self.label, pid, "process stopped");
        }

        pidfile::remove(&self.pidfile)
            .with_context(|| format!("failed to remove {} pid file", self.label))
    }

    async fn wait_for_exit(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if !self.is_running().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Block (in a task) until the process exits by any means, then send our
    /// label on `notify`.
    pub fn watch(self: &Arc<Self>, notify: mpsc::Sender<String>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let child = this.child.lock().await.take();
            match child {
                Some(mut child) => match child.wait().await {
                    Ok(status) => info!(label = %this.label, ?status, "process exited"),
                    Err(e) => warn!(label = %this.label, error = %e, "wait failed"),
                },
                None => {
                    // Started by an earlier invocation; only the pidfile is left.
                    while pidfile::is_running(&this.pidfile) {
                        tokio::time::sleep(ADOPTED_POLL).await;
                    }
                    info!(label = %this.label, "process exited");
                }
            }
            let _ = notify.send(this.label.clone()).await;
        })
    }
}
