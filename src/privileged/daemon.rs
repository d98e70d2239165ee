//! `localfoundryd` server side: accept loop, per-connection handling and
//! command execution.
//!
//! Connections are independent. Nothing is shared between them except the
//! executor's read-only collaborators; the OS serialises the actual
//! mutations.

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::privileged::fdpass;
use crate::privileged::network::HostNetwork;
use crate::privileged::protocol::{
    self, Command, STATUS_FAILED, STATUS_OK, STATUS_UNIMPLEMENTED,
};
use crate::privileged::service::ServiceManager;

/// Label the daemon registers itself under.
pub const DAEMON_LABEL: &str = "org.localfoundry.daemon";

/// Name of the socket binding handed over by the service manager.
pub const SOCKET_NAME: &str = "ListenSocket";

/// How long a client has to complete the handshake and send its command.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const TIMESYNC_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The privileged operation failed; the caller was told via the status byte.
    #[error("{command} failed: {message}")]
    Execution {
        command: &'static str,
        message: String,
    },
    /// The status byte could not be delivered.
    #[error("failed to write error code to connection: {0}")]
    Acknowledge(#[source] std::io::Error),
}

/// Executes decoded commands against the host.
pub struct Executor {
    services: Arc<dyn ServiceManager>,
    network: Arc<dyn HostNetwork>,
    label: String,
    request_timeout: Duration,
}

impl Executor {
    pub fn new(services: Arc<dyn ServiceManager>, network: Arc<dyn HostNetwork>) -> Self {
        Self {
            services,
            network,
            label: DAEMON_LABEL.to_string(),
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Run `command` and write exactly one status byte to `conn`.
    ///
    /// A failed acknowledgement is reported even when execution succeeded,
    /// and takes precedence over an execution failure.
    pub async fn execute(&self, command: Command, conn: &mut UnixStream) -> Result<(), CommandError> {
        let name = command.name();
        let outcome = match command {
            Command::Uninstall => self.services.remove_daemon(&self.label).await,
            Command::AddIpAlias(ips) => {
                let mut result = Ok(());
                for ip in ips {
                    if let Err(e) = self.network.add_loopback_alias(ip).await {
                        result = Err(e);
                        break;
                    }
                }
                result
            }
            Command::RemoveIpAlias(ips) => {
                let mut result = Ok(());
                for ip in ips {
                    if let Err(e) = self.network.remove_loopback_alias(ip).await {
                        result = Err(e);
                        break;
                    }
                }
                result
            }
            Command::Bind(addr) => {
                return match std::net::TcpListener::bind(addr) {
                    Ok(listener) => {
                        info!(%addr, "bound privileged port for caller");
                        fdpass::send_with_fd(conn, STATUS_OK, listener.as_raw_fd())
                            .await
                            .map_err(CommandError::Acknowledge)
                    }
                    Err(e) => {
                        acknowledge(conn, STATUS_FAILED).await?;
                        Err(CommandError::Execution {
                            command: name,
                            message: format!("bind {addr}: {e}"),
                        })
                    }
                };
            }
            Command::Unimplemented(code) => {
                warn!(instruction = code, "unimplemented instruction");
                return acknowledge(conn, STATUS_UNIMPLEMENTED).await;
            }
        };

        match outcome {
            Ok(()) => acknowledge(conn, STATUS_OK).await,
            Err(e) => {
                acknowledge(conn, STATUS_FAILED).await?;
                Err(CommandError::Execution {
                    command: name,
                    message: format!("{e:#}"),
                })
            }
        }
    }
}

async fn acknowledge(conn: &mut UnixStream, status: u8) -> Result<(), CommandError> {
    conn.write_all(&[status]).await.map_err(CommandError::Acknowledge)
}

/// Handle one connection end to end. Never panics, never propagates.
pub async fn handle_connection(mut conn: UnixStream, executor: Arc<Executor>) {
    let request = tokio::time::timeout(executor.request_timeout, read_request(&mut conn)).await;
    let command = match request {
        Ok(Ok(command)) => command,
        Ok(Err(e)) => {
            warn!("{e:#}");
            return;
        }
        Err(_) => {
            warn!(
                timeout_ms = executor.request_timeout.as_millis() as u64,
                "client sent no request in time"
            );
            return;
        }
    };

    let name = command.name();
    debug!(command = name, "executing");
    match executor.execute(command, &mut conn).await {
        Ok(()) => info!(command = name, "command completed"),
        Err(e) => error!(command = name, error = %e, "command failed"),
    }
}

async fn read_request(conn: &mut UnixStream) -> anyhow::Result<Command> {
    protocol::accept_handshake(conn).await.context("handshake error")?;
    protocol::decode(conn).await.context("failed to decode command")
}

/// Accept connections forever, one task per connection.
pub async fn serve(listener: UnixListener, executor: Arc<Executor>) {
    loop {
        match listener.accept().await {
            Ok((conn, _)) => {
                tokio::spawn(handle_connection(conn, Arc::clone(&executor)));
            }
            Err(e) => {
                error!(error = %e, "accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Connect to the VM's timesync socket every `interval`, forever. Each
/// connection makes the guest resync its clock; nothing is exchanged.
pub async fn timesync(socket: PathBuf, interval: Duration) {
    loop {
        match UnixStream::connect(&socket).await {
            Ok(_) => debug!(socket = %socket.display(), "timesync dial"),
            Err(e) => debug!(socket = %socket.display(), error = %e, "timesync socket unavailable"),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Obtain the listening socket: the one handed over by the service manager
/// when socket-activated, otherwise bind `path` ourselves.
///
/// Failure here is fatal to the daemon.
pub fn listen(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(listener) = activation::inherited_listener(SOCKET_NAME)? {
        info!("using socket handed over by the service manager");
        listener.set_nonblocking(true)?;
        return UnixListener::from_std(listener).context("failed to adopt inherited socket");
    }

    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to listen on {}", path.display()))?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .with_context(|| format!("failed to open up {}", path.display()))?;
    info!(path = %path.display(), "listening");
    Ok(listener)
}

/// Where the daemon executable is installed.
pub fn installed_program() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/Library/PrivilegedHelperTools").join(DAEMON_LABEL)
    } else {
        PathBuf::from("/usr/local/libexec").join(DAEMON_LABEL)
    }
}

mod activation {
    use std::os::unix::net::UnixListener;

    /// launchd: `launch_activate_socket`.
    #[cfg(target_os = "macos")]
    pub fn inherited_listener(name: &str) -> anyhow::Result<Option<UnixListener>> {
        use std::ffi::CString;
        use std::os::fd::FromRawFd;

        unsafe extern "C" {
            fn launch_activate_socket(
                name: *const libc::c_char,
                fds: *mut *mut libc::c_int,
                cnt: *mut libc::size_t,
            ) -> libc::c_int;
        }

        let name = CString::new(name)?;
        let mut fds: *mut libc::c_int = std::ptr::null_mut();
        let mut count: libc::size_t = 0;
        let rc = unsafe { launch_activate_socket(name.as_ptr(), &mut fds, &mut count) };
        if rc != 0 || fds.is_null() || count == 0 {
            // Not launched by launchd, or no such socket in our plist.
            return Ok(None);
        }
        let fd = unsafe { *fds };
        unsafe { libc::free(fds.cast()) };
        Ok(Some(unsafe { UnixListener::from_raw_fd(fd) }))
    }

    /// systemd: `LISTEN_PID` / `LISTEN_FDS`, first descriptor is 3.
    #[cfg(not(target_os = "macos"))]
    pub fn inherited_listener(_name: &str) -> anyhow::Result<Option<UnixListener>> {
        use std::os::fd::FromRawFd;

        let for_us = std::env::var("LISTEN_PID")
            .ok()
            .and_then(|pid| pid.parse::<u32>().ok())
            .is_some_and(|pid| pid == std::process::id());
        let count = std::env::var("LISTEN_FDS")
            .ok()
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0);
        if !for_us || count == 0 {
            return Ok(None);
        }
        Ok(Some(unsafe { UnixListener::from_raw_fd(3) }))
    }
}
