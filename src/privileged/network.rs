//! Loopback address aliases. Only ever executed inside `localfoundryd`.

use std::net::Ipv4Addr;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

#[async_trait]
pub trait HostNetwork: Send + Sync {
    async fn add_loopback_alias(&self, ip: Ipv4Addr) -> Result<()>;
    async fn remove_loopback_alias(&self, ip: Ipv4Addr) -> Result<()>;
}

/// `ifconfig lo0` on macOS, `ip addr` on Linux.
pub struct LoopbackAliases;

impl LoopbackAliases {
    fn add_args(ip: Ipv4Addr) -> (&'static str, Vec<String>) {
        if cfg!(target_os = "macos") {
            ("ifconfig", vec!["lo0".into(), "alias".into(), ip.to_string()])
        } else {
            ("ip", vec!["addr".into(), "add".into(), format!("{ip}/32"), "dev".into(), "lo".into()])
        }
    }

    fn remove_args(ip: Ipv4Addr) -> (&'static str, Vec<String>) {
        if cfg!(target_os = "macos") {
            ("ifconfig", vec!["lo0".into(), "-alias".into(), ip.to_string()])
        } else {
            ("ip", vec!["addr".into(), "del".into(), format!("{ip}/32"), "dev".into(), "lo".into()])
        }
    }
}

#[async_trait]
impl HostNetwork for LoopbackAliases {
    async fn add_loopback_alias(&self, ip: Ipv4Addr) -> Result<()> {
        let (program, args) = Self::add_args(ip);
        let output = Command::new(program)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("failed to spawn `{program}`"))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Re-running start re-aliases; an existing alias is not a failure.
        if output.status.success() || stderr.contains("File exists") {
            info!(%ip, "loopback alias added");
            return Ok(());
        }
        bail!("failed to alias {ip}: {}", stderr.trim())
    }

    async fn remove_loopback_alias(&self, ip: Ipv4Addr) -> Result<()> {
        let (program, args) = Self::remove_args(ip);
        let output = Command::new(program)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("failed to spawn `{program}`"))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("Cannot assign requested address") {
            info!(%ip, "loopback alias removed");
            return Ok(());
        }
        bail!("failed to remove alias {ip}: {}", stderr.trim())
    }
}
