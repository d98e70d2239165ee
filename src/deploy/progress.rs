//! Convergence progress of a cluster deployment.
//!
//! A background task polls the cluster at a fixed interval and sends one
//! [`Progress`] per poll. Until the deployment has any hosts, the number of
//! uploaded releases is reported instead. The stream ends once every host
//! is up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// One VM of a deployment, as the director reports it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostInfo {
    #[serde(default)]
    pub job_name: String,
    #[serde(default)]
    pub process_state: String,
    #[serde(default)]
    pub processes: Vec<serde_json::Value>,
}

impl HostInfo {
    pub fn is_up(&self) -> bool {
        self.process_state == "running" && !self.processes.is_empty()
    }
}

#[async_trait]
pub trait ClusterState: Send + Sync {
    async fn hosts(&self, deployment: &str) -> anyhow::Result<Vec<HostInfo>>;
    async fn releases(&self) -> anyhow::Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Uploaded releases; only set while the deployment has no hosts yet.
    pub releases: usize,
    pub done: usize,
    pub total: usize,
    pub elapsed: Duration,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.done >= self.total
    }
}

/// Start polling `deployment`. Polls that fail or see no hosts yet are
/// skipped. The task stops after the complete record or once the receiver
/// is dropped.
pub fn report_progress(
    state: Arc<dyn ClusterState>,
    deployment: String,
    interval: Duration,
) -> (mpsc::Receiver<Progress>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move {
        let start = Instant::now();
        let mut seen_hosts = false;
        loop {
            tokio::time::sleep(interval).await;

            let hosts = match state.hosts(&deployment).await {
                Ok(hosts) if !hosts.is_empty() => hosts,
                other => {
                    if let Err(e) = other {
                        debug!(deployment = %deployment, error = %e, "cluster state unavailable");
                    }
                    if seen_hosts {
                        continue;
                    }
                    let Ok(releases) = state.releases().await else {
                        continue;
                    };
                    let progress = Progress {
                        releases,
                        done: 0,
                        total: 0,
                        elapsed: start.elapsed(),
                    };
                    if tx.send(progress).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            seen_hosts = true;

            let progress = Progress {
                releases: 0,
                done: hosts.iter().filter(|h| h.is_up()).count(),
                total: hosts.len(),
                elapsed: start.elapsed(),
            };
            if tx.send(progress).await.is_err() || progress.is_complete() {
                return;
            }
        }
    });
    (rx, handle)
}
