//! Ordered start, crash watching and teardown of the helper processes.
//!
//! Processes start in the order given (networking helper, then hypervisor)
//! and are stopped in reverse. Every started process gets a watcher that
//! reports its label on one shared channel; the control loop waits on that
//! channel and the cancellation future together, and either one leads to
//! the same teardown.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::vm::{StartOptions, SupervisedProcess};

/// Exit status after any teardown, the same for cancellation and helper death.
pub const TEARDOWN_EXIT_CODE: i32 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl-C, SIGTERM or another external cancellation.
    Cancelled,
    /// A supervised process exited; carries its label.
    ProcessExited(String),
}

impl ShutdownReason {
    pub fn exit_code(&self) -> i32 {
        TEARDOWN_EXIT_CODE
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("received shutdown signal"),
            Self::ProcessExited(label) => write!(f, "{label} exited unexpectedly"),
        }
    }
}

/// Result of running a unit of work under supervision.
#[derive(Debug)]
pub enum Supervised<T> {
    Completed(T),
    ShutDown(ShutdownReason),
}

pub struct Supervisor {
    processes: Vec<Arc<dyn SupervisedProcess>>,
    notify_tx: mpsc::Sender<String>,
    notify_rx: Mutex<mpsc::Receiver<String>>,
    watchers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl Supervisor {
    /// `processes` in start order.
    pub fn new(processes: Vec<Arc<dyn SupervisedProcess>>) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(processes.len().max(1));
        Self {
            processes,
            notify_tx,
            notify_rx: Mutex::new(notify_rx),
            watchers: std::sync::Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Start every process in order, each fully started before the next,
    /// and watch it. Stops at the first failure; the caller tears down.
    pub async fn start_all(&self, options: &StartOptions) -> Result<()> {
        for process in &self.processes {
            let label = process.label().to_string();
            info!(label = %label, "starting");
            process
                .start(options)
                .await
                .with_context(|| format!("failed to start {label}"))?;

            let handle = process.watch(self.notify_tx.clone());
            self.watchers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }
        Ok(())
    }

    /// Block until a watched process exits or `cancel` resolves.
    pub async fn wait_for_shutdown<C>(&self, cancel: C) -> ShutdownReason
    where
        C: Future<Output = ()>,
    {
        let mut rx = self.notify_rx.lock().await;
        tokio::select! {
            Some(label) = rx.recv() => {
                warn!(label = %label, "supervised process exited");
                ShutdownReason::ProcessExited(label)
            }
            () = cancel => {
                info!("cancellation requested");
                ShutdownReason::Cancelled
            }
        }
    }

    /// Drive `work` to completion unless a shutdown fires first. Teardown is
    /// left to the caller so it runs exactly once on every path.
    pub async fn run<F, C, T>(&self, work: F, cancel: C) -> Supervised<T>
    where
        F: Future<Output = T>,
        C: Future<Output = ()>,
    {
        tokio::select! {
            reason = self.wait_for_shutdown(cancel) => Supervised::ShutDown(reason),
            out = work => Supervised::Completed(out),
        }
    }

    /// Stop processes in reverse start order and drop the watchers. Later
    /// calls do nothing.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Watchers first so a deliberate stop is not reported as a crash.
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in watchers.drain(..) {
            handle.abort();
        }
        drop(watchers);
        for process in self.processes.iter().rev() {
            if let Err(e) = process.stop().await {
                warn!(label = %process.label(), error = %e, "failed to stop");
            }
        }
    }
}
