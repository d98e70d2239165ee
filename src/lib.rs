//! localfoundry: a VM-hosted platform deployment on the developer's machine.
//!
//! - [`privileged`]: the elevated `localfoundryd` daemon, its wire protocol
//!   and the unprivileged broker.
//! - [`vm`]: the networking helper and hypervisor processes and the
//!   supervisor that watches them.
//! - [`deploy`]: the deployment pipeline run against the container runtime
//!   inside the VM.
//! - [`orchestrator`]: the CLI commands tying the three together.

pub mod config;
pub mod deploy;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod privileged;
pub mod vm;
