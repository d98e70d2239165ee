//! Background service registration with the platform service manager.
//!
//! The rest of the crate only sees [`ServiceManager`]. [`Launchd`] writes a
//! property list into `/Library/LaunchDaemons` and drives `launchctl`;
//! [`Systemd`] writes a `.service` (plus a `.socket` when the [`DaemonSpec`] carries
//! socket bindings) and drives `systemctl`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// Descriptor of a managed background process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSpec {
    pub label: String,
    pub program: PathBuf,
    /// Full argv, including `program` as the first element.
    pub program_arguments: Vec<String>,
    pub run_at_load: bool,
    /// Socket name → path. The service manager owns these sockets and hands
    /// them to the process on activation.
    pub sockets: BTreeMap<String, PathBuf>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

/// Capability interface over the OS service manager.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn add_daemon(&self, spec: &DaemonSpec) -> Result<()>;
    async fn remove_daemon(&self, label: &str) -> Result<()>;
    async fn start(&self, label: &str) -> Result<()>;
    async fn stop(&self, label: &str) -> Result<()>;
    async fn is_running(&self, label: &str) -> Result<bool>;
}

/// The service manager for the host platform.
pub fn platform_service_manager() -> Box<dyn ServiceManager> {
    if cfg!(target_os = "macos") {
        Box::new(Launchd::new("/Library/LaunchDaemons"))
    } else {
        Box::new(Systemd::new("/etc/systemd/system"))
    }
}

// ---------------------------------------------------------------------------
// launchd
// ---------------------------------------------------------------------------

pub struct Launchd {
    dir: PathBuf,
}

impl Launchd {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn plist_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.plist"))
    }
}

#[async_trait]
impl ServiceManager for Launchd {
    async fn add_daemon(&self, spec: &DaemonSpec) -> Result<()> {
        let path = self.plist_path(&spec.label);
        tokio::fs::write(&path, render_plist(spec))
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        let path_arg = path.to_string_lossy();
        run_tool("launchctl", &["load", &*path_arg]).await?;
        info!(label = %spec.label, "daemon registered with launchd");
        Ok(())
    }

    async fn remove_daemon(&self, label: &str) -> Result<()> {
        let path = self.plist_path(label);
        if !path.exists() {
            debug!(label, "no plist to remove");
            return Ok(());
        }
        let path_arg = path.to_string_lossy();
        run_tool("launchctl", &["unload", &*path_arg]).await?;
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to remove {}", path.display()))?;
        info!(label, "daemon removed from launchd");
        Ok(())
    }

    async fn start(&self, label: &str) -> Result<()> {
        run_tool("launchctl", &["start", label]).await
    }

    async fn stop(&self, label: &str) -> Result<()> {
        run_tool("launchctl", &["stop", label]).await
    }

    async fn is_running(&self, label: &str) -> Result<bool> {
        let output = Command::new("launchctl")
            .args(["list", label])
            .output()
            .await
            .context("failed to spawn `launchctl`")?;
        if !output.status.success() {
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout).contains("\"PID\""))
    }
}

/// Render a launchd property list for `spec`.
pub fn render_plist(spec: &DaemonSpec) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \
         \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
         <plist version=\"1.0\">\n<dict>\n",
    );
    let _ = writeln!(out, "  <key>Label</key>\n  <string>{}</string>", xml_escape(&spec.label));
    let _ = writeln!(
        out,
        "  <key>Program</key>\n  <string>{}</string>",
        xml_escape(&spec.program.to_string_lossy())
    );
    out.push_str("  <key>ProgramArguments</key>\n  <array>\n");
    for arg in &spec.program_arguments {
        let _ = writeln!(out, "    <string>{}</string>", xml_escape(arg));
    }
    out.push_str("  </array>\n");
    let _ = writeln!(
        out,
        "  <key>RunAtLoad</key>\n  <{}/>",
        if spec.run_at_load { "true" } else { "false" }
    );
    if !spec.sockets.is_empty() {
        out.push_str("  <key>Sockets</key>\n  <dict>\n");
        for (name, path) in &spec.sockets {
            let _ = writeln!(
                out,
                "    <key>{}</key>\n    <dict>\n      <key>SockPathName</key>\n      \
                 <string>{}</string>\n      <key>SockPathMode</key>\n      <integer>438</integer>\n    </dict>",
                xml_escape(name),
                xml_escape(&path.to_string_lossy())
            );
        }
        out.push_str("  </dict>\n");
    }
    let _ = writeln!(
        out,
        "  <key>StandardOutPath</key>\n  <string>{}</string>",
        xml_escape(&spec.stdout_path.to_string_lossy())
    );
    let _ = writeln!(
        out,
        "  <key>StandardErrorPath</key>\n  <string>{}</string>",
        xml_escape(&spec.stderr_path.to_string_lossy())
    );
    out.push_str("</dict>\n</plist>\n");
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ---------------------------------------------------------------------------
// systemd
// ---------------------------------------------------------------------------

pub struct Systemd {
    dir: PathBuf,
}

impl Systemd {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn unit_path(&self, label: &str, kind: &str) -> PathBuf {
        self.dir.join(format!("{label}.{kind}"))
    }
}

#[async_trait]
impl ServiceManager for Systemd {
    async fn add_daemon(&self, spec: &DaemonSpec) -> Result<()> {
        let service = self.unit_path(&spec.label, "service");
        tokio::fs::write(&service, render_service_unit(spec))
            .await
            .with_context(|| format!("failed to write {}", service.display()))?;

        let socket = render_socket_unit(spec);
        if let Some(socket) = &socket {
            let path = self.unit_path(&spec.label, "socket");
            tokio::fs::write(&path, socket)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        run_tool("systemctl", &["daemon-reload"]).await?;
        if socket.is_some() {
            let unit = format!("{}.socket", spec.label);
            run_tool("systemctl", &["enable", "--now", unit.as_str()]).await?;
        } else if spec.run_at_load {
            let unit = format!("{}.service", spec.label);
            run_tool("systemctl", &["enable", "--now", unit.as_str()]).await?;
        }
        info!(label = %spec.label, "daemon registered with systemd");
        Ok(())
    }

    async fn remove_daemon(&self, label: &str) -> Result<()> {
        let mut removed = false;
        for kind in ["socket", "service"] {
            let path = self.unit_path(label, kind);
            if !path.exists() {
                continue;
            }
            let unit = format!("{label}.{kind}");
            // The unit may already be stopped; removal proceeds regardless.
            let _ = run_tool("systemctl", &["disable", "--now", unit.as_str()]).await;
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("failed to remove {}", path.display()))?;
            removed = true;
        }
        if removed {
            run_tool("systemctl", &["daemon-reload"]).await?;
            info!(label, "daemon removed from systemd");
        }
        Ok(())
    }

    async fn start(&self, label: &str) -> Result<()> {
        let unit = format!("{label}.service");
        run_tool("systemctl", &["start", unit.as_str()]).await
    }

    async fn stop(&self, label: &str) -> Result<()> {
        let unit = format!("{label}.service");
        run_tool("systemctl", &["stop", unit.as_str()]).await
    }

    async fn is_running(&self, label: &str) -> Result<bool> {
        let unit = format!("{label}.service");
        let status = Command::new("systemctl")
            .args(["is-active", "--quiet", unit.as_str()])
            .status()
            .await
            .context("failed to spawn `systemctl`")?;
        Ok(status.success())
    }
}

pub fn render_service_unit(spec: &DaemonSpec) -> String {
    let exec = spec
        .program_arguments
        .iter()
        .map(|arg| systemd_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    let mut out = format!("[Unit]\nDescription={}\n", spec.label);
    if !spec.sockets.is_empty() {
        let _ = writeln!(out, "Requires={label}.socket\nAfter={label}.socket", label = spec.label);
    }
    let _ = write!(
        out,
        "\n[Service]\nExecStart={exec}\nStandardOutput=append:{}\nStandardError=append:{}\n",
        spec.stdout_path.display(),
        spec.stderr_path.display()
    );
    if spec.run_at_load {
        out.push_str("\n[Install]\nWantedBy=multi-user.target\n");
    }
    out
}

pub fn render_socket_unit(spec: &DaemonSpec) -> Option<String> {
    if spec.sockets.is_empty() {
        return None;
    }
    let mut out = format!("[Unit]\nDescription={} sockets\n\n[Socket]\n", spec.label);
    for path in spec.sockets.values() {
        let _ = writeln!(out, "ListenStream={}", path.display());
    }
    out.push_str("SocketMode=0666\n\n[Install]\nWantedBy=sockets.target\n");
    Some(out)
}

fn systemd_quote(arg: &str) -> String {
    if arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Spawn a service-manager tool, wait for it, and map non-zero exit to `Err`.
async fn run_tool(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to spawn `{program}`"))?;
    if output.status.success() {
        return Ok(());
    }
    bail!(
        "`{program}` failed (exit {}): {}",
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stderr).trim()
    )
}
