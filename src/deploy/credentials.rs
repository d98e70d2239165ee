//! Director credentials, read out of the VM through a throwaway container.

use std::net::Ipv4Addr;

use serde::Deserialize;
use tracing::{info, warn};

use crate::deploy::runtime::{
    BindMount, BindMountMode, ContainerRuntime, ContainerSpec, ProcessIo, ProcessSpec,
    SharedBuffer,
};
use crate::deploy::stages::{CONTAINER_NETWORK, StageError, WORKSPACE_IMAGE};

pub const CREDENTIALS_HANDLE: &str = "fetch-bosh-config";
const CREDENTIALS_DIR: &str = "/var/vcap/director";

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("admin password was not returned")]
    MissingPassword,

    #[error("ca certificate was not returned")]
    MissingCaCertificate,

    #[error("jumpbox ssh key was not returned")]
    MissingPrivateKey,

    #[error("unable to parse bosh config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Stage(#[from] StageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCredentials {
    pub admin_username: String,
    pub admin_password: String,
    pub ca_certificate: String,
    pub director_address: Ipv4Addr,
    pub gateway_host: Ipv4Addr,
    pub gateway_username: String,
    pub gateway_private_key: String,
}

#[derive(Default, Deserialize)]
struct CredsFile {
    #[serde(default)]
    admin_password: String,
    #[serde(default)]
    director_ssl: Ca,
    #[serde(default)]
    jumpbox_ssh: Ssh,
}

#[derive(Default, Deserialize)]
struct Ca {
    #[serde(default)]
    ca: String,
}

#[derive(Default, Deserialize)]
struct Ssh {
    #[serde(default)]
    private_key: String,
}

impl RuntimeCredentials {
    /// Parse `creds.yml`; every secret must be present and non-empty.
    pub fn parse(text: &str, director_address: Ipv4Addr) -> Result<Self, CredentialsError> {
        let creds: CredsFile = serde_yaml::from_str(text)?;
        if creds.admin_password.is_empty() {
            return Err(CredentialsError::MissingPassword);
        }
        if creds.director_ssl.ca.is_empty() {
            return Err(CredentialsError::MissingCaCertificate);
        }
        if creds.jumpbox_ssh.private_key.is_empty() {
            return Err(CredentialsError::MissingPrivateKey);
        }
        Ok(Self {
            admin_username: "admin".to_string(),
            admin_password: creds.admin_password,
            ca_certificate: creds.director_ssl.ca,
            director_address,
            gateway_host: director_address,
            gateway_username: "jumpbox".to_string(),
            gateway_private_key: creds.jumpbox_ssh.private_key,
        })
    }
}

pub fn credentials_container() -> ContainerSpec {
    ContainerSpec {
        handle: CREDENTIALS_HANDLE.to_string(),
        privileged: true,
        network: CONTAINER_NETWORK.to_string(),
        image: WORKSPACE_IMAGE.to_string(),
        bind_mounts: vec![BindMount::new(
            CREDENTIALS_DIR,
            CREDENTIALS_DIR,
            BindMountMode::ReadWrite,
        )],
        env: Vec::new(),
    }
}

/// Run `cat creds.yml` in a transient container. The container is
/// destroyed whatever the outcome once it exists.
pub async fn fetch_credentials(
    runtime: &dyn ContainerRuntime,
    director_address: Ipv4Addr,
) -> Result<RuntimeCredentials, CredentialsError> {
    let container = runtime
        .create(credentials_container())
        .await
        .map_err(StageError::from)?;

    let output = SharedBuffer::default();
    let io = ProcessIo {
        stdout: Box::new(output.clone()),
        stderr: Box::new(output.clone()),
    };
    let spec = ProcessSpec {
        path: "cat".to_string(),
        args: vec![format!("{CREDENTIALS_DIR}/creds.yml")],
        user: "root".to_string(),
        env: Vec::new(),
    };

    let status = match container.run(spec, io).await {
        Ok(mut process) => process.wait().await.map_err(StageError::from),
        Err(e) => Err(StageError::from(e)),
    };

    if let Err(e) = runtime.destroy(container.handle()).await {
        warn!(handle = CREDENTIALS_HANDLE, error = %e, "failed to destroy credentials container");
    }

    match status? {
        0 => {}
        code => return Err(StageError::Exit(code).into()),
    }
    let text = String::from_utf8_lossy(&output.contents()).into_owned();
    let creds = RuntimeCredentials::parse(&text, director_address)?;
    info!(director = %director_address, "fetched director credentials");
    Ok(creds)
}
