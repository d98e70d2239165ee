//! Unprivileged client for `localfoundryd`.
//!
//! One connection per request: connect, handshake, send one command, read
//! one status byte. The broker itself never needs elevated rights; the only
//! elevated step is the initial `sudo localfoundryd install`.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::privileged::fdpass;
use crate::privileged::protocol::{
    self, Command, MAX_ALIASES, STATUS_OK, STATUS_UNIMPLEMENTED,
};

pub struct Broker {
    socket: PathBuf,
}

impl Broker {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self { socket: socket.into() }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// True when a daemon answers the handshake on our socket.
    pub async fn is_installed(&self) -> bool {
        self.connect().await.is_ok()
    }

    /// Install the daemon with elevated rights, then wait for its socket.
    pub async fn install(&self, daemon_binary: &Path) -> Result<()> {
        info!(binary = %daemon_binary.display(), "installing privileged daemon");
        let status = tokio::process::Command::new("sudo")
            .arg(daemon_binary)
            .arg("install")
            .arg("--socket")
            .arg(&self.socket)
            .status()
            .await
            .context("failed to spawn `sudo`")?;
        if !status.success() {
            bail!(
                "installing the privileged daemon failed (exit {})",
                status.code().unwrap_or(-1)
            );
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            if self.is_installed().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        bail!(
            "privileged daemon did not come up on {}",
            self.socket.display()
        )
    }

    pub async fn uninstall(&self) -> Result<()> {
        self.request(&Command::Uninstall).await
    }

    pub async fn add_ip_aliases(&self, ips: &[Ipv4Addr]) -> Result<()> {
        check_alias_count(ips)?;
        self.request(&Command::AddIpAlias(ips.to_vec())).await
    }

    pub async fn remove_ip_aliases(&self, ips: &[Ipv4Addr]) -> Result<()> {
        check_alias_count(ips)?;
        self.request(&Command::RemoveIpAlias(ips.to_vec())).await
    }

    /// Have the daemon bind `addr` and hand the listening socket back.
    pub async fn bind(&self, addr: SocketAddrV4) -> Result<std::net::TcpListener> {
        let mut conn = self.connect().await?;
        conn.write_all(&Command::Bind(addr).encode())
            .await
            .context("failed to send Bind")?;
        let (status, fd) = fdpass::recv_with_fd(&conn)
            .await
            .context("failed to read Bind status")?;
        if status != STATUS_OK {
            bail!("daemon failed to bind {addr} (status {status})");
        }
        let fd = fd.context("daemon replied without a descriptor")?;
        Ok(std::net::TcpListener::from(fd))
    }

    async fn request(&self, command: &Command) -> Result<()> {
        let mut conn = self.connect().await?;
        conn.write_all(&command.encode())
            .await
            .with_context(|| format!("failed to send {}", command.name()))?;
        let status = conn
            .read_u8()
            .await
            .with_context(|| format!("failed to read {} status", command.name()))?;
        debug!(command = command.name(), status, "daemon replied");
        match status {
            STATUS_OK => Ok(()),
            STATUS_UNIMPLEMENTED => bail!("daemon does not implement {}", command.name()),
            other => bail!("daemon failed to execute {} (status {other})", command.name()),
        }
    }

    async fn connect(&self) -> Result<UnixStream> {
        let mut conn = UnixStream::connect(&self.socket)
            .await
            .with_context(|| format!("failed to connect to {}", self.socket.display()))?;
        protocol::initiate_handshake(&mut conn)
            .await
            .context("privileged daemon handshake")?;
        Ok(conn)
    }
}

fn check_alias_count(ips: &[Ipv4Addr]) -> Result<()> {
    if ips.len() > MAX_ALIASES {
        bail!(
            "{} addresses requested; one request carries at most {MAX_ALIASES}",
            ips.len()
        );
    }
    Ok(())
}
