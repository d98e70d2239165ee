//! On-disk layout for localfoundry.
//!
//! Everything lives under one home directory, `$LOCALFOUNDRY_HOME` or
//! `~/.localfoundry`:
//!
//! - `cache/`      downloaded assets (OS image, deployment image, helpers)
//! - `state/`      hypervisor state, wiped on every `start`
//! - `net-state/`  networking helper sockets, wiped on every `start`
//! - `logs/`       helper process and stage output
//! - `hypervisor.pid`, `network.pid`
//!
//! The orchestrating process is the only writer of anything in here.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

const APP_DIR: &str = ".localfoundry";

/// All resolved paths.
#[derive(Debug, Clone)]
pub struct FoundryPaths {
    pub home: PathBuf,
    pub cache: PathBuf,
    pub state: PathBuf,
    pub net_state: PathBuf,
    pub logs: PathBuf,
    pub hypervisor_pidfile: PathBuf,
    pub network_pidfile: PathBuf,
}

impl FoundryPaths {
    /// Resolve from `$LOCALFOUNDRY_HOME`, falling back to `$HOME/.localfoundry`.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        if let Ok(home) = std::env::var("LOCALFOUNDRY_HOME") {
            return Some(Self::under(PathBuf::from(home)));
        }
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::under(home.join(APP_DIR)))
    }

    /// Lay out every path below `home`.
    pub fn under(home: PathBuf) -> Self {
        Self {
            cache: home.join("cache"),
            state: home.join("state"),
            net_state: home.join("net-state"),
            logs: home.join("logs"),
            hypervisor_pidfile: home.join("hypervisor.pid"),
            network_pidfile: home.join("network.pid"),
            home,
        }
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.home, &self.cache, &self.state, &self.net_state, &self.logs] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Wipe and recreate the per-invocation state directories.
    pub fn reset_state(&self) -> anyhow::Result<()> {
        for dir in [&self.state, &self.net_state] {
            reset_dir(dir)?;
            info!("reset state directory: {}", dir.display());
        }
        Ok(())
    }

    /// Default location of the OS boot image.
    pub fn os_image(&self) -> PathBuf {
        self.cache.join("foundry-efi.iso")
    }

    /// Default location of the deployment image.
    pub fn deployment_image(&self) -> PathBuf {
        self.cache.join("foundry-deps.iso")
    }

    pub fn data_disk(&self) -> PathBuf {
        self.state.join("disk.img")
    }
}

fn reset_dir(dir: &Path) -> anyhow::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e)
                .with_context(|| format!("unable to clean up state directory {}", dir.display()));
        }
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("unable to create state directory {}", dir.display()))
}
