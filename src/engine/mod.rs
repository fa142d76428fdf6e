//! Container engine integration
//!
//! Keel never runs containers itself. An engine builds, starts, probes and
//! stops service instances on its behalf.

pub mod docker;
pub mod dry_run;

use crate::descriptor::{Descriptor, Service};
use crate::error::Result;
use async_trait::async_trait;

pub use docker::DockerCli;
pub use dry_run::DryRun;

/// Container name for the single instance of a service
pub fn container_name(project: &str, service: &str) -> String {
    format!("{}-{}-1", project, service)
}

/// Network every project service joins
pub fn network_name(project: &str) -> String {
    format!("{}_default", project)
}

/// Label keys attached to created resources
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

/// An external container build/run engine
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create project-wide resources (network, volumes)
    async fn prepare(&self, _project: &str, _descriptor: &Descriptor) -> Result<()> {
        Ok(())
    }

    /// Build or pull the service's artifact and start an instance
    async fn start(&self, project: &str, descriptor: &Descriptor, service: &Service)
        -> Result<()>;

    /// Whether the instance can serve dependents
    async fn is_ready(&self, project: &str, service: &str) -> Result<bool>;

    /// Stop and remove the instance
    async fn stop(&self, project: &str, service: &str) -> Result<()>;

    /// Remove project-wide resources
    async fn teardown(
        &self,
        _project: &str,
        _descriptor: &Descriptor,
        _remove_volumes: bool,
    ) -> Result<()> {
        Ok(())
    }
}
