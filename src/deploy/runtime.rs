//! Container runtime interface consumed by the deployment stages.
//!
//! The runtime lives inside the VM; `garden::GardenClient` talks to it over
//! HTTP. Stages depend only on these traits so they can be driven by fakes.

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Serialize, Serializer};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("container runtime returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed container runtime payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("failed to write process output: {0}")]
    Output(#[from] std::io::Error),

    /// Error text reported by the runtime itself, shown verbatim.
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMountMode {
    ReadOnly,
    ReadWrite,
}

impl Serialize for BindMountMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            Self::ReadOnly => 0,
            Self::ReadWrite => 1,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    pub mode: BindMountMode,
}

impl BindMount {
    pub fn new(src: &str, dst: &str, mode: BindMountMode) -> Self {
        Self {
            src_path: src.to_string(),
            dst_path: dst.to_string(),
            mode,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    pub handle: String,
    pub privileged: bool,
    pub network: String,
    #[serde(rename = "rootfs")]
    pub image: String,
    pub bind_mounts: Vec<BindMount>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub user: String,
    pub env: Vec<String>,
}

/// Where a process's output goes.
pub struct ProcessIo {
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

impl ProcessIo {
    pub fn discard() -> Self {
        Self {
            stdout: Box::new(std::io::sink()),
            stderr: Box::new(std::io::sink()),
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;
    async fn create(&self, spec: ContainerSpec) -> Result<Box<dyn Container>, RuntimeError>;
    async fn destroy(&self, handle: &str) -> Result<(), RuntimeError>;
}

#[async_trait]
pub trait Container: Send + Sync {
    fn handle(&self) -> &str;
    async fn run(&self, spec: ProcessSpec, io: ProcessIo)
    -> Result<Box<dyn Process>, RuntimeError>;
}

#[async_trait]
pub trait Process: Send {
    /// Exit status once the process finishes.
    async fn wait(&mut self) -> Result<i32, RuntimeError>;
}

/// Cloneable in-memory sink, for capturing a process's stdout.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("output buffer poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
