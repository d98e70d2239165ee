//! The `start`, `stop` and `bosh-env` commands.
//!
//! `start` runs the whole deployment pipeline under the supervisor's single
//! wait point: Ctrl-C, SIGTERM or the death of either helper process
//! interrupts it, tears the helpers down and ends the run with status 128.
//! On success the helpers keep running after this process exits.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Config;
use crate::deploy::progress::Progress;
use crate::deploy::{
    DeployOutcome, DirectorConnector, Environment, GardenClient, Pipeline, PipelineOptions,
    RuntimeCredentials, Ui, fetch_credentials, parse_registries,
};
use crate::paths::FoundryPaths;
use crate::privileged::Broker;
use crate::vm::{
    Hypervisor, NetworkHelper, StartOptions, Supervised, SupervisedProcess, Supervisor,
    TEARDOWN_EXIT_CODE,
};

/// Arguments of `localfoundry start`.
#[derive(Debug, Clone)]
pub struct StartArgs {
    pub image: Option<PathBuf>,
    pub registries: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub provision: bool,
}

/// Plain stdout output.
pub struct ConsoleUi;

impl Ui for ConsoleUi {
    fn say(&self, message: &str) {
        println!("{message}");
    }

    fn progress(&self, p: &Progress) {
        if p.total == 0 {
            println!("  uploaded {} releases ({}s)", p.releases, p.elapsed.as_secs());
        } else {
            println!("  {} of {} VMs running ({}s)", p.done, p.total, p.elapsed.as_secs());
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM. Never resolves if neither can be
/// listened for.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// The helper processes in start order.
fn helpers(config: &Config, paths: &FoundryPaths) -> (Arc<Hypervisor>, Vec<Arc<dyn SupervisedProcess>>) {
    let network: Arc<dyn SupervisedProcess> =
        Arc::new(NetworkHelper::new(config.network_program.clone(), paths));
    let hypervisor = Arc::new(Hypervisor::new(config.hypervisor_program.clone(), paths));
    let vm: Arc<dyn SupervisedProcess> = hypervisor.clone();
    (hypervisor, vec![network, vm])
}

/// `localfoundryd` is shipped next to this executable.
fn daemon_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to locate own executable")?;
    Ok(exe.with_file_name("localfoundryd"))
}

/// Host side of the environment: state directory, privileged daemon,
/// loopback aliases and the supervised helpers.
struct HostEnvironment {
    paths: FoundryPaths,
    broker: Broker,
    aliases: Vec<Ipv4Addr>,
    hypervisor: Arc<Hypervisor>,
    supervisor: Arc<Supervisor>,
    options: StartOptions,
    ui: Arc<dyn Ui>,
}

#[async_trait]
impl Environment for HostEnvironment {
    async fn is_running(&self) -> Result<bool> {
        self.hypervisor.is_running().await
    }

    async fn bring_up(&self) -> Result<()> {
        self.paths.reset_state()?;

        if !self.broker.is_installed().await {
            self.ui.say("Installing localfoundryd network helper...");
            self.broker.install(&daemon_binary()?).await?;
        }
        self.broker
            .add_ip_aliases(&self.aliases)
            .await
            .context("failed to alias loopback addresses")?;

        self.ui.say("Starting the VM...");
        self.supervisor.start_all(&self.options).await
    }
}

pub async fn start(config: &Config, paths: &FoundryPaths, args: StartArgs) -> Result<i32> {
    let registries = parse_registries(&args.registries).context("Unable to parse docker registries")?;
    let image = match args.image {
        Some(path) => std::path::absolute(&path)
            .with_context(|| format!("determining absolute path to {}", path.display()))?,
        None => paths.deployment_image(),
    };
    paths.ensure().context("failed to create localfoundry directories")?;

    let ui: Arc<dyn Ui> = Arc::new(ConsoleUi);
    let (hypervisor, processes) = helpers(config, paths);
    let supervisor = Arc::new(Supervisor::new(processes));

    let environment = HostEnvironment {
        paths: paths.clone(),
        broker: Broker::new(&config.daemon_socket),
        aliases: config.loopback_aliases(),
        hypervisor,
        supervisor: Arc::clone(&supervisor),
        options: StartOptions {
            cpus: args.cpus,
            memory_mb: args.memory_mb,
            image_path: image.clone(),
        },
        ui: Arc::clone(&ui),
    };

    let mut options = PipelineOptions::new(image, config.director_ip);
    options.registries = registries;
    options.readiness_timeout = config.readiness_timeout();
    options.readiness_interval = config.readiness_interval();
    options.progress_interval = config.progress_interval();
    options.provision = args.provision;
    options.log_dir = Some(paths.logs.clone());

    let pipeline = Pipeline::new(
        Arc::new(GardenClient::new(&config.runtime_address)?),
        Arc::new(environment),
        Arc::new(DirectorConnector),
        Arc::clone(&ui),
        options,
    );

    match supervisor.run(pipeline.deploy(), shutdown_signal()).await {
        Supervised::Completed(Ok(outcome)) => {
            match outcome {
                DeployOutcome::Deployed { splash_message } => {
                    ui.say("Done!");
                    if let Some(message) = splash_message {
                        ui.say(&message);
                    }
                }
                DeployOutcome::AlreadyRunning => ui.say("localfoundry is already running"),
                DeployOutcome::ProvisionSkipped => {
                    ui.say("VM is up; skipping provisioning as requested")
                }
            }
            Ok(0)
        }
        Supervised::Completed(Err(e)) => Err(e.into()),
        Supervised::ShutDown(reason) => {
            eprintln!("{reason}; shutting down");
            supervisor.teardown().await;
            Ok(reason.exit_code())
        }
    }
}

pub async fn stop(config: &Config, paths: &FoundryPaths) -> Result<()> {
    let (_, processes) = helpers(config, paths);
    Supervisor::new(processes).teardown().await;

    let broker = Broker::new(&config.daemon_socket);
    if broker.is_installed().await {
        broker
            .remove_ip_aliases(&config.loopback_aliases())
            .await
            .context("failed to remove loopback aliases")?;
    } else {
        warn!(socket = %broker.socket().display(), "privileged daemon not reachable; aliases left");
    }
    info!("stopped");
    Ok(())
}

/// Shell `export` lines for talking to the director.
pub fn render_env(creds: &RuntimeCredentials, ca_path: &Path, key_path: &Path) -> String {
    format!(
        "export BOSH_ENVIRONMENT=\"{}\";\n\
         export BOSH_CLIENT=\"{}\";\n\
         export BOSH_CLIENT_SECRET=\"{}\";\n\
         export BOSH_CA_CERT=\"{}\";\n\
         export BOSH_GW_HOST=\"{}\";\n\
         export BOSH_GW_USER=\"{}\";\n\
         export BOSH_GW_PRIVATE_KEY=\"{}\";",
        creds.director_address,
        creds.admin_username,
        creds.admin_password,
        ca_path.display(),
        creds.gateway_host,
        creds.gateway_username,
        key_path.display(),
    )
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict {}", path.display()))
}

pub async fn bosh_env(config: &Config, paths: &FoundryPaths) -> Result<i32> {
    let work = async {
        let garden = GardenClient::new(&config.runtime_address)?;
        let creds = fetch_credentials(&garden, config.director_ip)
            .await
            .context("failed to fetch bosh configuration")?;

        std::fs::create_dir_all(&paths.state)
            .with_context(|| format!("failed to create {}", paths.state.display()))?;
        let ca_path = paths.state.join("bosh-ca.crt");
        let key_path = paths.state.join("jumpbox.key");
        write_private(&ca_path, &creds.ca_certificate)?;
        write_private(&key_path, &creds.gateway_private_key)?;

        println!("{}", render_env(&creds, &ca_path, &key_path));
        Ok::<_, anyhow::Error>(())
    };

    tokio::select! {
        result = work => result.map(|()| 0),
        () = shutdown_signal() => Ok(TEARDOWN_EXIT_CODE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_exports_cover_director_and_gateway() {
        let creds = RuntimeCredentials {
            admin_username: "admin".into(),
            admin_password: "s3cret".into(),
            ca_certificate: "CA".into(),
            director_address: Ipv4Addr::new(10, 245, 0, 2),
            gateway_host: Ipv4Addr::new(10, 245, 0, 2),
            gateway_username: "jumpbox".into(),
            gateway_private_key: "KEY".into(),
        };
        let env = render_env(&creds, Path::new("/s/bosh-ca.crt"), Path::new("/s/jumpbox.key"));
        let lines: Vec<&str> = env.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "export BOSH_ENVIRONMENT=\"10.245.0.2\";");
        assert!(lines.contains(&"export BOSH_CLIENT_SECRET=\"s3cret\";"));
        assert!(lines.contains(&"export BOSH_GW_PRIVATE_KEY=\"/s/jumpbox.key\";"));
    }

    #[test]
    fn private_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("jumpbox.key");
        write_private(&path, "KEY").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn helpers_start_network_before_vm() {
        let paths = FoundryPaths::under(PathBuf::from("/tmp/lf"));
        let (_, processes) = helpers(&Config::default(), &paths);
        let labels: Vec<&str> = processes.iter().map(|p| p.label()).collect();
        assert_eq!(labels, ["org.localfoundry.network", "org.localfoundry.hypervisor"]);
    }
}
