//! Privilege separation: the elevated `localfoundryd` daemon and the
//! unprivileged broker that talks to it over a local Unix socket.

pub mod broker;
pub mod daemon;
pub mod fdpass;
pub mod network;
pub mod protocol;
pub mod service;

use std::collections::BTreeMap;
use std::path::Path;

pub use broker::Broker;
pub use daemon::{CommandError, Executor};
pub use protocol::Command;
pub use service::{DaemonSpec, ServiceManager};

/// Registration for the daemon itself, socket-activated on `socket`.
pub fn daemon_spec(
    program: &Path,
    socket: &Path,
    log_dir: &Path,
    timesync_socket: Option<&Path>,
) -> DaemonSpec {
    let mut program_arguments = vec![
        program.to_string_lossy().into_owned(),
        "run".to_string(),
        "--socket".to_string(),
        socket.to_string_lossy().into_owned(),
    ];
    if let Some(timesync) = timesync_socket {
        program_arguments.push("--timesync-socket".to_string());
        program_arguments.push(timesync.to_string_lossy().into_owned());
    }
    DaemonSpec {
        label: daemon::DAEMON_LABEL.to_string(),
        program: program.to_path_buf(),
        program_arguments,
        run_at_load: false,
        sockets: BTreeMap::from([(daemon::SOCKET_NAME.to_string(), socket.to_path_buf())]),
        stdout_path: log_dir.join("localfoundryd.stdout.log"),
        stderr_path: log_dir.join("localfoundryd.stderr.log"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_spec_runs_socket_activated() {
        let spec = daemon_spec(
            Path::new("/usr/local/libexec/localfoundryd"),
            Path::new("/var/tmp/localfoundryd.socket"),
            Path::new("/var/tmp"),
            None,
        );
        assert_eq!(spec.label, daemon::DAEMON_LABEL);
        assert_eq!(spec.program_arguments.len(), 4);
        assert!(!spec.run_at_load);
        assert_eq!(spec.program_arguments[0], "/usr/local/libexec/localfoundryd");
        assert_eq!(spec.program_arguments[1], "run");
        assert_eq!(
            spec.sockets.get(daemon::SOCKET_NAME).map(|p| p.as_path()),
            Some(Path::new("/var/tmp/localfoundryd.socket"))
        );
    }

    #[test]
    fn timesync_socket_is_forwarded_to_run() {
        let spec = daemon_spec(
            Path::new("/usr/local/libexec/localfoundryd"),
            Path::new("/var/tmp/localfoundryd.socket"),
            Path::new("/var/tmp"),
            Some(Path::new("/var/tmp/vm/timesync.sock")),
        );
        assert_eq!(
            spec.program_arguments[4..],
            ["--timesync-socket", "/var/tmp/vm/timesync.sock"]
        );
    }
}
