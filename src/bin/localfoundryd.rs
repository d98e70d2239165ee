//! localfoundryd: the privileged helper. Installed once with `sudo`, then
//! socket-activated by launchd/systemd for loopback aliasing and
//! privileged port binds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use localfoundry::config::DEFAULT_DAEMON_SOCKET;
use localfoundry::logging;
use localfoundry::privileged::daemon::{self, DAEMON_LABEL, Executor};
use localfoundry::privileged::daemon_spec;
use localfoundry::privileged::network::LoopbackAliases;
use localfoundry::privileged::service::platform_service_manager;

#[derive(Parser, Debug)]
#[command(name = "localfoundryd", version, about = "Privileged helper for localfoundry")]
struct Args {
    /// Directory for the daemon's own logs
    #[arg(long, global = true, default_value = "/var/tmp")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Copy this binary into place and register it with the service manager
    Install {
        #[arg(long, default_value = DEFAULT_DAEMON_SOCKET)]
        socket: PathBuf,
        /// Passed on to `run` in the registration
        #[arg(long)]
        timesync_socket: Option<PathBuf>,
    },
    /// Unregister the daemon and remove the installed binary
    Uninstall,
    /// Serve requests on the socket (invoked by the service manager)
    Run {
        #[arg(long, default_value = DEFAULT_DAEMON_SOCKET)]
        socket: PathBuf,
        /// VM socket to dial periodically so the guest clock stays in sync
        #[arg(long)]
        timesync_socket: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init_daemon(&args.log_dir);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    runtime.block_on(async {
        match args.command {
            Cmd::Install {
                socket,
                timesync_socket,
            } => install(&socket, &args.log_dir, timesync_socket.as_deref()).await,
            Cmd::Uninstall => uninstall().await,
            Cmd::Run {
                socket,
                timesync_socket,
            } => run(&socket, timesync_socket).await,
        }
    })
}

async fn install(socket: &Path, log_dir: &Path, timesync_socket: Option<&Path>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let source = std::env::current_exe().context("failed to locate own executable")?;
    let installed = daemon::installed_program();
    if let Some(parent) = installed.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if source != installed {
        std::fs::copy(&source, &installed).with_context(|| {
            format!("failed to copy {} to {}", source.display(), installed.display())
        })?;
    }
    std::fs::set_permissions(&installed, std::fs::Permissions::from_mode(0o744))
        .with_context(|| format!("failed to set permissions on {}", installed.display()))?;

    platform_service_manager()
        .add_daemon(&daemon_spec(&installed, socket, log_dir, timesync_socket))
        .await
        .context("failed to register localfoundryd")?;
    info!(program = %installed.display(), socket = %socket.display(), "installed");
    Ok(())
}

async fn uninstall() -> Result<()> {
    platform_service_manager()
        .remove_daemon(DAEMON_LABEL)
        .await
        .context("failed to unregister localfoundryd")?;

    let installed = daemon::installed_program();
    match std::fs::remove_file(&installed) {
        Ok(()) => info!(program = %installed.display(), "removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(program = %installed.display(), error = %e, "failed to remove binary"),
    }
    Ok(())
}

async fn run(socket: &Path, timesync_socket: Option<PathBuf>) -> Result<()> {
    let listener = daemon::listen(socket)?;
    if let Some(timesync) = timesync_socket {
        tokio::spawn(daemon::timesync(timesync, daemon::TIMESYNC_INTERVAL));
    }
    let executor = Arc::new(Executor::new(
        Arc::from(platform_service_manager()),
        Arc::new(LoopbackAliases),
    ));
    info!(pid = std::process::id(), "localfoundryd serving");
    daemon::serve(listener, executor).await;
    Ok(())
}
