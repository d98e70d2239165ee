//! User-mode networking helper for the VM.
//!
//! The helper owns the datagram socket the hypervisor's virtio-net device
//! attaches to, so it has to be up, socket created, before the VM launches.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::paths::FoundryPaths;
use crate::vm::managed::ManagedChild;
use crate::vm::{StartOptions, SupervisedProcess};

pub const NETWORK_LABEL: &str = "org.localfoundry.network";

pub struct NetworkHelper {
    program: PathBuf,
    vm_socket: PathBuf,
    api_socket: PathBuf,
    ready_timeout: Duration,
    child: Arc<ManagedChild>,
}

impl NetworkHelper {
    pub fn new(program: PathBuf, paths: &FoundryPaths) -> Self {
        Self {
            program,
            vm_socket: vm_socket(paths),
            api_socket: paths.net_state.join("network.sock"),
            ready_timeout: Duration::from_secs(10),
            child: Arc::new(ManagedChild::new(
                NETWORK_LABEL,
                paths.network_pidfile.clone(),
                paths.logs.join("network.log"),
            )),
        }
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "-listen-vfkit".to_string(),
            format!("unixgram://{}", self.vm_socket.display()),
            "-listen".to_string(),
            format!("unix://{}", self.api_socket.display()),
        ]
    }
}

/// Socket the hypervisor's network device connects to.
pub fn vm_socket(paths: &FoundryPaths) -> PathBuf {
    paths.net_state.join("vm-net.sock")
}

#[async_trait]
impl SupervisedProcess for NetworkHelper {
    fn label(&self) -> &str {
        NETWORK_LABEL
    }

    async fn start(&self, _options: &StartOptions) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args());
        self.child.spawn(cmd).await?;

        if !wait_for_path(&self.vm_socket, self.ready_timeout).await {
            bail!(
                "networking helper did not create {} within {}s",
                self.vm_socket.display(),
                self.ready_timeout.as_secs()
            );
        }
        info!(socket = %self.vm_socket.display(), "networking helper ready");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.child.stop().await
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.child.is_running().await)
    }

    fn watch(&self, notify: mpsc::Sender<String>) -> JoinHandle<()> {
        self.child.watch(notify)
    }
}

async fn wait_for_path(path: &Path, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    path.exists()
}
