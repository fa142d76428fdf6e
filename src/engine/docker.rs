//! Docker CLI engine
//!
//! Drives a local `docker` binary. Resource naming follows compose so
//! existing tooling recognises the containers.

use super::{container_name, network_name, ContainerEngine, PROJECT_LABEL, SERVICE_LABEL};
use crate::descriptor::{
    BuildSource, Descriptor, MountSource, RestartPolicy, Service, Source, VolumeMount,
};
use crate::error::{KeelError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;

/// Go template that prints `<running> <health>`
const STATE_FORMAT: &str =
    "{{.State.Running}} {{if .State.Health}}{{.State.Health.Status}}{{end}}";

/// Engine backed by the docker command line
pub struct DockerCli {
    /// Binary to invoke
    binary: String,
    /// Directory relative build contexts and bind mounts resolve against
    working_dir: PathBuf,
}

impl DockerCli {
    /// Create an engine resolving relative paths against `working_dir`
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            binary: "docker".to_string(),
            working_dir,
        }
    }

    /// Use a different binary (e.g. `podman`)
    pub fn binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }

    async fn output(&self, args: &[String]) -> Result<Output> {
        tracing::debug!("{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| KeelError::Engine(format!("failed to run {}: {}", self.binary, e)))?;
        Ok(output)
    }

    /// Run a command, failing on non-zero exit
    async fn run(&self, args: &[String]) -> Result<String> {
        let output = self.output(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(KeelError::Engine(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Run a command, reporting only whether it succeeded
    async fn succeeds(&self, args: &[String]) -> Result<bool> {
        Ok(self.output(args).await?.status.success())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    /// Arguments for `docker build`
    pub fn build_args(&self, project: &str, service: &Service, build: &BuildSource) -> Vec<String> {
        let context = self.resolve(&build.context);
        let mut args = vec![
            "build".to_string(),
            "-t".to_string(),
            service.image_ref(project),
            "--label".to_string(),
            format!("{}={}", PROJECT_LABEL, project),
        ];
        if let Some(file) = &build.file {
            args.push("-f".to_string());
            args.push(context.join(file).display().to_string());
        }
        args.push(context.display().to_string());
        args
    }

    /// Arguments for `docker run`
    pub fn run_args(&self, project: &str, descriptor: &Descriptor, service: &Service) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container_name(project, service.name()),
            "--network".to_string(),
            network_name(project),
            "--network-alias".to_string(),
            service.name().to_string(),
            "--restart".to_string(),
            restart_flag(service.restart_policy()),
            "--label".to_string(),
            format!("{}={}", PROJECT_LABEL, project),
            "--label".to_string(),
            format!("{}={}", SERVICE_LABEL, service.name()),
        ];

        for (key, value) in service.environment() {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for port in service.ports() {
            args.push("-p".to_string());
            args.push(port.to_string());
        }

        for mount in service.volume_mounts() {
            args.push("-v".to_string());
            args.push(self.mount_arg(project, descriptor, mount));
        }

        args.push(service.image_ref(project));
        args
    }

    fn mount_arg(&self, project: &str, descriptor: &Descriptor, mount: &VolumeMount) -> String {
        let source = match &mount.source {
            MountSource::Volume(name) => Some(
                descriptor
                    .volume(name)
                    .map(|v| v.engine_name(project))
                    .unwrap_or_else(|| format!("{}_{}", project, name)),
            ),
            MountSource::Bind(path) => Some(self.resolve(path).display().to_string()),
            MountSource::Anonymous => None,
        };
        let mut arg = match source {
            Some(source) => format!("{}:{}", source, mount.target),
            None => mount.target.clone(),
        };
        if mount.read_only {
            arg.push_str(":ro");
        }
        arg
    }

    async fn ensure_network(&self, project: &str) -> Result<()> {
        let network = network_name(project);
        if self
            .succeeds(&["network".into(), "inspect".into(), network.clone()])
            .await?
        {
            return Ok(());
        }
        tracing::info!("Creating network {}", network);
        self.run(&[
            "network".into(),
            "create".into(),
            "--label".into(),
            format!("{}={}", PROJECT_LABEL, project),
            network,
        ])
        .await
        .map(|_| ())
    }
}

fn restart_flag(policy: &RestartPolicy) -> String {
    match policy {
        RestartPolicy::Never => "no".to_string(),
        RestartPolicy::OnFailure { max_retries: None } => "on-failure".to_string(),
        RestartPolicy::OnFailure {
            max_retries: Some(n),
        } => format!("on-failure:{}", n),
        RestartPolicy::Always => "always".to_string(),
    }
}

/// Ready means running, and healthy when the image defines a health check
fn ready_from_state(state: &str) -> bool {
    let mut fields = state.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some("true"), None) => true,
        (Some("true"), Some(health)) => health == "healthy",
        _ => false,
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn prepare(&self, project: &str, descriptor: &Descriptor) -> Result<()> {
        self.ensure_network(project).await?;

        for volume in descriptor.volumes() {
            let name = volume.engine_name(project);
            let exists = self
                .succeeds(&["volume".into(), "inspect".into(), name.clone()])
                .await?;

            if exists {
                continue;
            }
            if volume.is_external() {
                return Err(KeelError::Engine(format!(
                    "external volume '{}' does not exist",
                    name
                )));
            }

            tracing::info!("Creating volume {}", name);
            let mut args = vec![
                "volume".to_string(),
                "create".to_string(),
                "--label".to_string(),
                format!("{}={}", PROJECT_LABEL, project),
            ];
            if let Some(driver) = volume.driver_name() {
                args.push("--driver".to_string());
                args.push(driver.to_string());
            }
            args.push(name);
            self.run(&args).await?;
        }

        Ok(())
    }

    async fn start(&self, project: &str, descriptor: &Descriptor, service: &Service) -> Result<()> {
        if let Source::Build(build) = service.source() {
            tracing::info!("Building image for service: {}", service.name());
            self.run(&self.build_args(project, service, build)).await?;
        }

        // Replace any leftover instance from an earlier run
        let name = container_name(project, service.name());
        self.succeeds(&["rm".into(), "-f".into(), name.clone()])
            .await?;

        let id = self.run(&self.run_args(project, descriptor, service)).await?;
        tracing::debug!("Started {} ({})", name, id);
        Ok(())
    }

    async fn is_ready(&self, project: &str, service: &str) -> Result<bool> {
        let output = self
            .output(&[
                "inspect".into(),
                "--format".into(),
                STATE_FORMAT.into(),
                container_name(project, service),
            ])
            .await?;

        if !output.status.success() {
            return Ok(false);
        }
        Ok(ready_from_state(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn stop(&self, project: &str, service: &str) -> Result<()> {
        let name = container_name(project, service);
        self.run(&["stop".into(), name.clone()]).await?;
        self.run(&["rm".into(), name]).await.map(|_| ())
    }

    async fn teardown(
        &self,
        project: &str,
        descriptor: &Descriptor,
        remove_volumes: bool,
    ) -> Result<()> {
        if let Err(e) = self
            .run(&["network".into(), "rm".into(), network_name(project)])
            .await
        {
            tracing::warn!("Failed to remove network: {}", e);
        }

        if remove_volumes {
            for volume in descriptor.volumes().filter(|v| !v.is_external()) {
                let name = volume.engine_name(project);
                if let Err(e) = self.run(&["volume".into(), "rm".into(), name.clone()]).await {
                    tracing::warn!("Failed to remove volume {}: {}", name, e);
                }
            }
        }

        Ok(())
    }
}
