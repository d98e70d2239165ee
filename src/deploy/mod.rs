//! Provisioning inside the VM: image metadata, the container runtime
//! client, deployment stages and the pipeline that sequences them.

pub mod credentials;
pub mod director;
pub mod garden;
pub mod image;
pub mod pipeline;
pub mod progress;
pub mod registries;
pub mod runtime;
pub mod stages;

pub use credentials::{CredentialsError, RuntimeCredentials, fetch_credentials};
pub use garden::GardenClient;
pub use image::{COMPATIBILITY_VERSION, ImageMetadata, ServiceEntry, read_metadata};
pub use pipeline::{
    ClusterConnector, DeployOutcome, DirectorConnector, Environment, Pipeline, PipelineError,
    PipelineOptions, Ui,
};
pub use registries::{RegistryParseError, parse_registries};
pub use stages::{DeploymentStage, StageError, run_stage};
