//! The deployment pipeline: a strictly ordered sequence of gates and
//! container stages. The first failure aborts everything after it; nothing
//! already created is rolled back.
//!
//! ```text
//! compatibility gate → already running? → bring up VM → runtime ready
//!   → director → credentials → platform (+progress) → services (+progress)
//! ```

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::deploy::credentials::{CredentialsError, RuntimeCredentials, fetch_credentials};
use crate::deploy::director::DirectorClient;
use crate::deploy::image::{ImageMetadata, MetadataError, read_metadata};
use crate::deploy::progress::{ClusterState, Progress, report_progress};
use crate::deploy::runtime::{ContainerRuntime, ProcessIo, RuntimeError};
use crate::deploy::stages::{DeploymentStage, StageError, run_stage};

/// Deployment the platform stage converges.
pub const PLATFORM_DEPLOYMENT: &str = "cf";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// `source` is set when the metadata exists but could not be read.
    #[error("{image} is not compatible with localfoundry. Please use a compatible file")]
    Incompatible {
        image: String,
        #[source]
        source: Option<MetadataError>,
    },

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("failed to check whether the VM is running: {0:#}")]
    Liveness(anyhow::Error),

    #[error("failed to start the VM: {0:#}")]
    BringUp(anyhow::Error),

    #[error("timed out waiting for the container runtime after {}s", .timeout.as_secs())]
    Connectivity { timeout: Duration },

    #[error("failed to deploy {stage}: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("failed to fetch bosh configuration: {0}")]
    Credentials(#[source] CredentialsError),

    #[error("unable to encode docker registries: {0}")]
    Registries(#[source] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Deployed { splash_message: Option<String> },
    /// The VM was already up; nothing was touched.
    AlreadyRunning,
    /// VM brought up without provisioning.
    ProvisionSkipped,
}

/// The host side of the environment: the supervised VM and its helpers.
#[async_trait]
pub trait Environment: Send + Sync {
    async fn is_running(&self) -> anyhow::Result<bool>;
    async fn bring_up(&self) -> anyhow::Result<()>;
}

/// Builds a cluster view from director credentials.
pub trait ClusterConnector: Send + Sync {
    fn connect(&self, creds: &RuntimeCredentials) -> anyhow::Result<Arc<dyn ClusterState>>;
}

pub struct DirectorConnector;

impl ClusterConnector for DirectorConnector {
    fn connect(&self, creds: &RuntimeCredentials) -> anyhow::Result<Arc<dyn ClusterState>> {
        Ok(Arc::new(DirectorClient::new(creds)?))
    }
}

/// User-facing status output.
pub trait Ui: Send + Sync {
    fn say(&self, message: &str);
    fn progress(&self, _progress: &Progress) {}
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub image: PathBuf,
    pub director_address: Ipv4Addr,
    /// Validated `host:port` entries.
    pub registries: Vec<String>,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    pub progress_interval: Duration,
    /// `false` stops after the runtime is reachable.
    pub provision: bool,
    /// Stage output goes to `<log_dir>/<handle>.log` when set.
    pub log_dir: Option<PathBuf>,
}

impl PipelineOptions {
    pub fn new(image: PathBuf, director_address: Ipv4Addr) -> Self {
        Self {
            image,
            director_address,
            registries: Vec::new(),
            readiness_timeout: Duration::from_secs(180),
            readiness_interval: Duration::from_secs(1),
            progress_interval: Duration::from_secs(1),
            provision: true,
            log_dir: None,
        }
    }
}

pub struct Pipeline {
    runtime: Arc<dyn ContainerRuntime>,
    environment: Arc<dyn Environment>,
    cluster: Arc<dyn ClusterConnector>,
    ui: Arc<dyn Ui>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        environment: Arc<dyn Environment>,
        cluster: Arc<dyn ClusterConnector>,
        ui: Arc<dyn Ui>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            runtime,
            environment,
            cluster,
            ui,
            options,
        }
    }

    pub async fn deploy(&self) -> Result<DeployOutcome, PipelineError> {
        let metadata = self.check_compatibility()?;

        if self.environment.is_running().await.map_err(PipelineError::Liveness)? {
            info!("VM already running; skipping deployment");
            return Ok(DeployOutcome::AlreadyRunning);
        }

        self.environment.bring_up().await.map_err(PipelineError::BringUp)?;

        self.ui.say("Waiting for the container runtime...");
        self.wait_for_runtime().await?;

        if !self.options.provision {
            return Ok(DeployOutcome::ProvisionSkipped);
        }

        self.run(&DeploymentStage::director(), None, None).await?;

        let creds = fetch_credentials(self.runtime.as_ref(), self.options.director_address)
            .await
            .map_err(PipelineError::Credentials)?;
        let cluster = match self.cluster.connect(&creds) {
            Ok(cluster) => Some(cluster),
            Err(e) => {
                warn!(error = %e, "progress reporting unavailable");
                None
            }
        };

        let platform =
            DeploymentStage::platform(&self.options.registries).map_err(PipelineError::Registries)?;
        self.run(&platform, cluster.as_ref(), Some(PLATFORM_DEPLOYMENT)).await?;

        for entry in &metadata.services {
            let stage = DeploymentStage::service(entry);
            self.run(&stage, cluster.as_ref(), Some(entry.deployment.as_str())).await?;
        }

        Ok(DeployOutcome::Deployed {
            splash_message: metadata.splash_message,
        })
    }

    /// The one metadata read for this run.
    fn check_compatibility(&self) -> Result<ImageMetadata, PipelineError> {
        let image = &self.options.image;
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| image.display().to_string());

        let found = match read_metadata(image) {
            Ok(found) => found,
            Err(e @ MetadataError::NotFound(_)) => return Err(e.into()),
            Err(e) => {
                debug!(image = %image.display(), error = %e, "unreadable deployment image");
                return Err(PipelineError::Incompatible {
                    image: name,
                    source: Some(e),
                });
            }
        };
        match found {
            Some(metadata) if metadata.is_compatible() => Ok(metadata),
            found => {
                debug!(
                    image = %image.display(),
                    version = ?found.and_then(|m| m.compatibility_version),
                    "incompatible deployment image"
                );
                Err(PipelineError::Incompatible {
                    image: name,
                    source: None,
                })
            }
        }
    }

    async fn wait_for_runtime(&self) -> Result<(), PipelineError> {
        let timeout = self.options.readiness_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            match self.runtime.ping().await {
                Ok(()) => {
                    info!("container runtime is ready");
                    return Ok(());
                }
                Err(e) => debug!(error = %e, "container runtime not ready"),
            }
            if Instant::now() >= deadline {
                return Err(PipelineError::Connectivity { timeout });
            }
            tokio::time::sleep(self.options.readiness_interval).await;
        }
    }

    fn stage_io(&self, handle: &str) -> Result<ProcessIo, StageError> {
        let Some(dir) = &self.options.log_dir else {
            return Ok(ProcessIo::discard());
        };
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{handle}.log")))
            .map_err(RuntimeError::from)?;
        let log_err = log.try_clone().map_err(RuntimeError::from)?;
        Ok(ProcessIo {
            stdout: Box::new(log),
            stderr: Box::new(log_err),
        })
    }

    /// Run one stage, relaying progress for `deployment` meanwhile.
    async fn run(
        &self,
        stage: &DeploymentStage,
        cluster: Option<&Arc<dyn ClusterState>>,
        deployment: Option<&str>,
    ) -> Result<(), PipelineError> {
        self.ui.say(&format!("Deploying {}...", stage.name));
        let wrap = |source| PipelineError::Stage {
            stage: stage.name.clone(),
            source,
        };

        let io = self.stage_io(stage.handle()).map_err(wrap)?;
        let work = run_stage(self.runtime.as_ref(), stage, io);

        let result = match (cluster, deployment) {
            (Some(state), Some(name)) if !name.is_empty() => {
                let (mut rx, reporter) = report_progress(
                    Arc::clone(state),
                    name.to_string(),
                    self.options.progress_interval,
                );
                tokio::pin!(work);
                let result = loop {
                    tokio::select! {
                        result = &mut work => break result,
                        Some(progress) = rx.recv() => self.ui.progress(&progress),
                    }
                };
                reporter.abort();
                result
            }
            _ => work.await,
        };
        result.map_err(wrap)
    }
}
