//! Container-scoped deployment stages.
//!
//! Every stage creates its container fresh, runs one script inside it and
//! waits. Only a clean exit destroys the container; anything else leaves it
//! in the VM for inspection.

use tracing::{debug, info};

use crate::deploy::image::ServiceEntry;
use crate::deploy::runtime::{
    BindMount, BindMountMode, ContainerRuntime, ContainerSpec, ProcessIo, ProcessSpec,
    RuntimeError,
};

pub const CONTAINER_NETWORK: &str = "10.246.0.0/16";
pub const WORKSPACE_IMAGE: &str = "/var/vcap/cache/workspace.tar";
const SCRIPT_DIR: &str = "/var/vcap/cache/bin";

pub const DIRECTOR_HANDLE: &str = "deploy-bosh";
pub const PLATFORM_HANDLE: &str = "deploy-cf";

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("process exited with status {0}")]
    Exit(i32),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStage {
    pub name: String,
    pub container: ContainerSpec,
    pub process: ProcessSpec,
}

impl DeploymentStage {
    fn scripted(name: &str, handle: &str, script: &str) -> Self {
        Self {
            name: name.to_string(),
            container: ContainerSpec {
                handle: handle.to_string(),
                privileged: true,
                network: CONTAINER_NETWORK.to_string(),
                image: WORKSPACE_IMAGE.to_string(),
                bind_mounts: vec![
                    BindMount::new("/var/vcap", "/var/vcap", BindMountMode::ReadWrite),
                    BindMount::new("/var/vcap/cache", "/var/vcap/cache", BindMountMode::ReadOnly),
                ],
                env: Vec::new(),
            },
            process: ProcessSpec {
                path: "/bin/bash".to_string(),
                args: vec![format!("{SCRIPT_DIR}/{script}")],
                user: "root".to_string(),
                env: Vec::new(),
            },
        }
    }

    pub fn director() -> Self {
        Self::scripted("BOSH Director", DIRECTOR_HANDLE, "deploy-bosh")
    }

    /// `registries` are `host:port` entries the platform should reach
    /// without TLS validation.
    pub fn platform(registries: &[String]) -> Result<Self, serde_yaml::Error> {
        let mut stage = Self::scripted("Cloud Foundry", PLATFORM_HANDLE, "deploy-cf");
        if !registries.is_empty() {
            let list = serde_yaml::to_string(registries)?;
            stage.container.env.push(format!("DOCKER_REGISTRIES={list}"));
        }
        Ok(stage)
    }

    pub fn service(entry: &ServiceEntry) -> Self {
        Self::scripted(&entry.name, &entry.handle, &entry.script)
    }

    pub fn handle(&self) -> &str {
        &self.container.handle
    }
}

/// Create, run, wait and, on exit status 0, destroy.
pub async fn run_stage(
    runtime: &dyn ContainerRuntime,
    stage: &DeploymentStage,
    io: ProcessIo,
) -> Result<(), StageError> {
    info!(stage = %stage.name, handle = %stage.handle(), "running stage");
    let container = runtime.create(stage.container.clone()).await?;
    let mut process = container.run(stage.process.clone(), io).await?;

    let status = process.wait().await?;
    if status != 0 {
        return Err(StageError::Exit(status));
    }

    runtime.destroy(container.handle()).await?;
    debug!(stage = %stage.name, "stage finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn director_stage_layout() {
        let stage = DeploymentStage::director();
        assert_eq!(stage.handle(), "deploy-bosh");
        assert!(stage.container.privileged);
        assert_eq!(stage.container.network, CONTAINER_NETWORK);
        assert_eq!(stage.container.image, WORKSPACE_IMAGE);
        assert_eq!(
            stage.container.bind_mounts,
            vec![
                BindMount::new("/var/vcap", "/var/vcap", BindMountMode::ReadWrite),
                BindMount::new("/var/vcap/cache", "/var/vcap/cache", BindMountMode::ReadOnly),
            ]
        );
        assert_eq!(stage.process.path, "/bin/bash");
        assert_eq!(stage.process.args, ["/var/vcap/cache/bin/deploy-bosh"]);
        assert_eq!(stage.process.user, "root");
    }

    #[test]
    fn platform_stage_passes_registries_as_yaml() {
        let stage =
            DeploymentStage::platform(&["host.local:5000".into(), "10.0.0.1:443".into()]).unwrap();
        assert_eq!(stage.handle(), "deploy-cf");
        assert_eq!(
            stage.container.env,
            ["DOCKER_REGISTRIES=- host.local:5000\n- 10.0.0.1:443\n"]
        );
    }

    #[test]
    fn platform_stage_without_registries_has_no_env() {
        let stage = DeploymentStage::platform(&[]).unwrap();
        assert!(stage.container.env.is_empty());
    }

    #[test]
    fn service_stage_uses_catalog_entry() {
        let entry = ServiceEntry {
            name: "Databases".into(),
            handle: "deploy-mysql".into(),
            script: "deploy-mysql".into(),
            deployment: "cf-mysql".into(),
        };
        let stage = DeploymentStage::service(&entry);
        assert_eq!(stage.name, "Databases");
        assert_eq!(stage.handle(), "deploy-mysql");
        assert_eq!(stage.process.args, ["/var/vcap/cache/bin/deploy-mysql"]);
    }

    #[test]
    fn exit_error_names_the_status() {
        assert_eq!(StageError::Exit(23).to_string(), "process exited with status 23");
    }
}
