//! localfoundry: start and stop a local platform deployment.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use localfoundry::config::Config;
use localfoundry::logging;
use localfoundry::orchestrator::{self, StartArgs};
use localfoundry::paths::FoundryPaths;

#[derive(Parser, Debug)]
#[command(name = "localfoundry", version, about = "Local platform deployment in a VM")]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Start the VM and deploy the platform
    Start {
        /// Deployment image (.iso or unpacked directory)
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,

        /// Docker registries to skip TLS validation for (comma-separated host:port)
        #[arg(short = 'r', long, default_value = "")]
        registries: String,

        /// Number of CPUs for the VM
        #[arg(short = 'c', long, default_value_t = 4)]
        cpus: u32,

        /// Memory for the VM in MB
        #[arg(short = 'm', long, default_value_t = 4096)]
        memory: u32,

        /// Bring the VM up without deploying anything
        #[arg(short = 'n', long)]
        no_provision: bool,
    },
    /// Stop the VM and its helpers
    Stop,
    /// Print shell exports for the director
    BoshEnv,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let paths = FoundryPaths::resolve()
        .context("cannot determine home directory; set LOCALFOUNDRY_HOME")?;
    let log_guard = logging::init(&paths.logs);
    let config = Config::load(&paths.home.join("config.toml"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    let code = runtime.block_on(async {
        match args.command {
            Cmd::Start {
                file,
                registries,
                cpus,
                memory,
                no_provision,
            } => {
                let start = StartArgs {
                    image: file,
                    registries,
                    cpus,
                    memory_mb: memory,
                    provision: !no_provision,
                };
                orchestrator::start(&config, &paths, start).await
            }
            Cmd::Stop => orchestrator::stop(&config, &paths).await.map(|()| 0),
            Cmd::BoshEnv => orchestrator::bosh_env(&config, &paths).await,
        }
    })?;

    // Helpers are detached; don't wait for lingering watcher tasks.
    runtime.shutdown_background();
    if code != 0 {
        drop(log_guard);
        std::process::exit(code);
    }
    Ok(())
}
