//! The VM itself, run by vfkit (macOS Virtualization.framework wrapper).
//!
//! ## Architecture
//!
//! ```text
//! Hypervisor::start(StartOptions)
//!     └─► tokio::process::Command  →  vfkit child process (own pgid)
//!             ├─► hypervisor.pid
//!             ├─► virtio-net  ⇄  networking helper datagram socket
//!             └─► watch()  →  label on the supervisor's crash channel
//! ```
//!
//! The command line is assembled on every platform so it can be inspected
//! and tested; launching is gated to macOS. Elsewhere `start` returns an
//! explanatory error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::paths::FoundryPaths;
use crate::vm::managed::ManagedChild;
use crate::vm::network_helper;
use crate::vm::{StartOptions, SupervisedProcess};

pub const HYPERVISOR_LABEL: &str = "org.localfoundry.hypervisor";

/// Size of the sparse data disk.
const DATA_DISK_BYTES: u64 = 80 * 1024 * 1024 * 1024;

/// Fixed MAC so the guest's DHCP lease is stable across restarts.
const GUEST_MAC: &str = "5a:94:ef:e4:0c:ee";

pub struct Hypervisor {
    program: PathBuf,
    paths: FoundryPaths,
    child: Arc<ManagedChild>,
}

impl Hypervisor {
    pub fn new(program: PathBuf, paths: &FoundryPaths) -> Self {
        Self {
            program,
            paths: paths.clone(),
            child: Arc::new(ManagedChild::new(
                HYPERVISOR_LABEL,
                paths.hypervisor_pidfile.clone(),
                paths.logs.join("hypervisor.log"),
            )),
        }
    }

    /// Build the vfkit argument vector for `options`.
    pub fn args(&self, options: &StartOptions) -> Vec<String> {
        let paths = &self.paths;
        vec![
            "--cpus".to_string(),
            options.cpus.to_string(),
            "--memory".to_string(),
            options.memory_mb.to_string(),
            "--bootloader".to_string(),
            format!("efi,variable-store={},create", paths.state.join("efi-vars.fd").display()),
            "--device".to_string(),
            format!("usb-mass-storage,path={},readonly", paths.os_image().display()),
            "--device".to_string(),
            format!("usb-mass-storage,path={},readonly", options.image_path.display()),
            "--device".to_string(),
            format!("virtio-blk,path={}", paths.data_disk().display()),
            "--device".to_string(),
            format!(
                "virtio-net,unixSocketPath={},mac={GUEST_MAC}",
                network_helper::vm_socket(paths).display()
            ),
            "--device".to_string(),
            format!("virtio-serial,logFilePath={}", paths.logs.join("console.log").display()),
            // Entropy device (required for kernel RNG).
            "--device".to_string(),
            "virtio-rng".to_string(),
        ]
    }

    fn validate(&self, options: &StartOptions) -> Result<()> {
        for (what, path) in [
            ("OS image", self.paths.os_image()),
            ("deployment image", options.image_path.clone()),
        ] {
            if !path.exists() {
                bail!("{what} does not exist: {}", path.display());
            }
        }
        Ok(())
    }
}

/// Resolve `program` against `PATH` and the Homebrew prefixes.
fn find_program(program: &Path) -> Result<PathBuf> {
    if program.components().count() > 1 {
        return Ok(program.to_path_buf());
    }
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = PathBuf::from(dir).join(program);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    for prefix in ["/opt/homebrew/bin", "/usr/local/bin"] {
        let candidate = PathBuf::from(prefix).join(program);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    bail!(
        "{} not found. Install it with: brew install {}",
        program.display(),
        program.display()
    )
}

/// Create the sparse data disk if it is not there yet.
fn ensure_data_disk(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create data disk {}", path.display()))?;
    file.set_len(DATA_DISK_BYTES)
        .with_context(|| format!("failed to size data disk {}", path.display()))
}

#[async_trait]
impl SupervisedProcess for Hypervisor {
    fn label(&self) -> &str {
        HYPERVISOR_LABEL
    }

    async fn start(&self, options: &StartOptions) -> Result<()> {
        if !cfg!(target_os = "macos") {
            bail!("VM lifecycle requires macOS (Virtualization.framework via vfkit)");
        }
        self.validate(options)?;
        ensure_data_disk(&self.paths.data_disk())?;

        let program = find_program(&self.program)?;
        info!(path = %program.display(), "found hypervisor binary");

        let mut cmd = Command::new(&program);
        cmd.args(self.args(options));
        let pid = self.child.spawn(cmd).await?;

        info!(
            pid,
            memory_mb = options.memory_mb,
            cpus = options.cpus,
            image = %options.image_path.display(),
            "VM spawned"
        );
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

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> StartOptions {
        StartOptions {
            cpus: 4,
            memory_mb: 4096,
            image_path: PathBuf::from("/tmp/lf/cache/foundry-deps.iso"),
        }
    }

    #[test]
    fn args_carry_resources_and_devices() {
        let paths = FoundryPaths::under(PathBuf::from("/tmp/lf"));
        let vm = Hypervisor::new(PathBuf::from("vfkit"), &paths);
        let args = vm.args(&options());

        let flag = |name: &str| args.iter().position(|a| a == name).map(|i| args[i + 1].clone());
        assert_eq!(flag("--cpus").as_deref(), Some("4"));
        assert_eq!(flag("--memory").as_deref(), Some("4096"));

        let devices: Vec<&String> = args
            .iter()
            .enumerate()
            .filter(|(i, _)| *i > 0 && args[i - 1] == "--device")
            .map(|(_, a)| a)
            .collect();
        assert!(devices.contains(&&"usb-mass-storage,path=/tmp/lf/cache/foundry-deps.iso,readonly".to_string()));
        assert!(devices.iter().any(|d| d.starts_with("virtio-net,unixSocketPath=/tmp/lf/net-state/vm-net.sock")));
        assert!(devices.contains(&&"virtio-rng".to_string()));
    }

    #[test]
    fn data_disk_is_sparse_and_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = tmp.path().join("disk.img");
        ensure_data_disk(&disk).unwrap();
        assert_eq!(std::fs::metadata(&disk).unwrap().len(), DATA_DISK_BYTES);
        ensure_data_disk(&disk).unwrap();
    }

    #[test]
    fn explicit_program_path_is_used_verbatim() {
        let path = PathBuf::from("/opt/vm/bin/vfkit");
        assert_eq!(find_program(&path).unwrap(), path);
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn start_requires_macos() {
        let paths = FoundryPaths::under(PathBuf::from("/tmp/lf"));
        let vm = Hypervisor::new(PathBuf::from("vfkit"), &paths);
        let err = vm.start(&options()).await.unwrap_err();
        assert!(err.to_string().contains("macOS"), "got: {err}");
    }

    #[tokio::test]
    async fn not_running_without_pidfile() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = FoundryPaths::under(tmp.path().to_path_buf());
        let vm = Hypervisor::new(PathBuf::from("vfkit"), &paths);
        assert!(!vm.is_running().await.unwrap());
    }
}
