//! Optional `config.toml` in the localfoundry home directory.
//!
//! Every field has a default, so a missing file and an empty file are
//! equivalent. Unknown keys are rejected to catch typos early.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Socket the privileged daemon listens on.
pub const DEFAULT_DAEMON_SOCKET: &str = "/var/tmp/localfoundryd.socket";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Unix socket owned by `localfoundryd`.
    pub daemon_socket: PathBuf,
    /// `host:port` of the container runtime exposed by the VM.
    pub runtime_address: String,
    /// Loopback alias the director is reachable on.
    pub director_ip: Ipv4Addr,
    /// Loopback alias the platform router is reachable on.
    pub router_ip: Ipv4Addr,
    pub readiness_timeout_secs: u64,
    pub readiness_interval_secs: u64,
    pub progress_interval_secs: u64,
    /// Hypervisor binary; looked up on `PATH` when relative.
    pub hypervisor_program: PathBuf,
    /// User-mode networking helper binary; looked up on `PATH` when relative.
    pub network_program: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon_socket: PathBuf::from(DEFAULT_DAEMON_SOCKET),
            runtime_address: "127.0.0.1:8888".to_string(),
            director_ip: Ipv4Addr::new(10, 245, 0, 2),
            router_ip: Ipv4Addr::new(10, 144, 0, 34),
            readiness_timeout_secs: 180,
            readiness_interval_secs: 1,
            progress_interval_secs: 1,
            hypervisor_program: PathBuf::from("vfkit"),
            network_program: PathBuf::from("gvproxy"),
        }
    }
}

impl Config {
    /// Load `path`, or the defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text)
                .with_context(|| format!("invalid config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_secs(self.readiness_interval_secs.max(1))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }

    /// Addresses aliased onto the loopback interface while the VM runs.
    pub fn loopback_aliases(&self) -> Vec<Ipv4Addr> {
        vec![self.director_ip, self.router_ip]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.runtime_address, "127.0.0.1:8888");
        assert_eq!(config.director_ip, Ipv4Addr::new(10, 245, 0, 2));
        assert_eq!(config.readiness_timeout(), Duration::from_secs(180));
        assert_eq!(config.daemon_socket, PathBuf::from(DEFAULT_DAEMON_SOCKET));
    }

    #[test]
    fn fields_override_defaults() {
        let config = Config::parse(
            r#"
runtime_address = "127.0.0.1:9999"
router_ip = "10.0.0.9"
readiness_timeout_secs = 5
"#,
        )
        .unwrap();
        assert_eq!(config.runtime_address, "127.0.0.1:9999");
        assert_eq!(config.router_ip, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(config.readiness_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.loopback_aliases(),
            vec![Ipv4Addr::new(10, 245, 0, 2), Ipv4Addr::new(10, 0, 0, 9)]
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("runtime_adress = \"x\"").is_err());
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config = Config::parse("readiness_interval_secs = 0").unwrap();
        assert_eq!(config.readiness_interval(), Duration::from_secs(1));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config.hypervisor_program, PathBuf::from("vfkit"));
    }
}
