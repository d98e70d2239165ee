//! VM host processes: the user-mode networking helper, the hypervisor, and
//! the supervisor that starts, watches and tears them down.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod hypervisor;
pub mod managed;
pub mod network_helper;
pub mod pidfile;
pub mod supervisor;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Resources for a `start`.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Number of virtual CPUs to give the VM.
    pub cpus: u32,
    /// Memory allocation in megabytes.
    pub memory_mb: u32,
    /// Deployment image attached to the VM.
    pub image_path: PathBuf,
}

/// Control surface of a long-running helper process.
#[async_trait]
pub trait SupervisedProcess: Send + Sync {
    fn label(&self) -> &str;
    async fn start(&self, options: &StartOptions) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    async fn is_running(&self) -> anyhow::Result<bool>;
    /// Spawn a watcher that sends [`label`](Self::label) on `notify` once the
    /// process exits.
    fn watch(&self, notify: mpsc::Sender<String>) -> JoinHandle<()>;
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use hypervisor::Hypervisor;
pub use network_helper::NetworkHelper;
pub use supervisor::{ShutdownReason, Supervised, Supervisor, TEARDOWN_EXIT_CODE};
