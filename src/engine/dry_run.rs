//! Engine that only reports what it would do

use super::{container_name, network_name, ContainerEngine};
use crate::descriptor::{Descriptor, Service};
use crate::error::{KeelError, Result};
use async_trait::async_trait;
use std::sync::Mutex;

/// Logs every action and reports services ready immediately
#[derive(Default)]
pub struct DryRun {
    actions: Mutex<Vec<String>>,
}

impl DryRun {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, action: String) -> Result<()> {
        tracing::info!("[dry-run] {}", action);
        self.actions
            .lock()
            .map_err(|e| KeelError::Engine(format!("action log poisoned: {}", e)))?
            .push(action);
        Ok(())
    }

    /// Actions recorded so far, in order
    pub fn actions(&self) -> Vec<String> {
        self.actions
            .lock()
            .map(|actions| actions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerEngine for DryRun {
    async fn prepare(&self, project: &str, descriptor: &Descriptor) -> Result<()> {
        self.record(format!("create network {}", network_name(project)))?;
        for volume in descriptor.volumes().filter(|v| !v.is_external()) {
            self.record(format!("create volume {}", volume.engine_name(project)))?;
        }
        Ok(())
    }

    async fn start(&self, project: &str, _descriptor: &Descriptor, service: &Service) -> Result<()> {
        self.record(format!(
            "start {} from {}",
            container_name(project, service.name()),
            service.image_ref(project)
        ))
    }

    async fn is_ready(&self, _project: &str, _service: &str) -> Result<bool> {
        Ok(true)
    }

    async fn stop(&self, project: &str, service: &str) -> Result<()> {
        self.record(format!("stop {}", container_name(project, service)))
    }

    async fn teardown(
        &self,
        project: &str,
        descriptor: &Descriptor,
        remove_volumes: bool,
    ) -> Result<()> {
        self.record(format!("remove network {}", network_name(project)))?;
        if remove_volumes {
            for volume in descriptor.volumes().filter(|v| !v.is_external()) {
                self.record(format!("remove volume {}", volume.engine_name(project)))?;
            }
        }
        Ok(())
    }
}
