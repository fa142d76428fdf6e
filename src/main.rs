//! Keel - dependency-ordered service startup
//!
//! This is the main CLI entry point for Keel.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use keel::descriptor::{parser::DEFAULT_ENV_FILE, Descriptor, DescriptorParser};
use keel::engine::{ContainerEngine, DockerCli, DryRun};
use keel::orchestrator::{Orchestrator, ReadinessPolicy};
use keel::plan::StartupPlanner;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Keel - validate a deployment descriptor and start it in dependency waves
#[derive(Parser)]
#[command(name = "keel")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Validate compose-style descriptors and start services in dependency order", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Descriptor file, may be repeated
    #[arg(short, long, global = true, env = "KEEL_FILE", value_delimiter = ',')]
    file: Vec<PathBuf>,

    /// Project name
    #[arg(short, long, global = true, env = "KEEL_PROJECT_NAME")]
    project_name: Option<String>,

    /// Variables file used for interpolation
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and print the normalized descriptor
    Config,

    /// Print the startup waves
    Plan {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start services wave by wave
    Up {
        /// Services to start, with their dependencies (all when empty)
        services: Vec<String>,
        /// Only log what would be done
        #[arg(long)]
        dry_run: bool,
        /// Readiness probes per service
        #[arg(long, default_value = "30")]
        max_retries: u32,
        /// Delay after the first failed probe
        #[arg(long, default_value = "500")]
        initial_delay_ms: u64,
    },

    /// Stop services in reverse wave order
    Down {
        /// Remove named volumes
        #[arg(short, long)]
        volumes: bool,
        /// Only log what would be done
        #[arg(long)]
        dry_run: bool,
    },
}

/// Loaded descriptor and where it came from
struct Project {
    name: String,
    working_dir: PathBuf,
    descriptor: Descriptor,
}

impl Project {
    fn load(cli: &Cli) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let files = if cli.file.is_empty() {
            match DescriptorParser::find_descriptor_file(&cwd) {
                Some(file) => vec![file],
                None => bail!("no descriptor file found in {}", cwd.display()),
            }
        } else {
            cli.file.iter().map(|f| cwd.join(f)).collect()
        };

        let working_dir = files[0]
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.clone());

        let env = load_variables(cli.env_file.as_deref(), &working_dir)?;
        let descriptor = DescriptorParser::load(&files, &env)
            .with_context(|| format!("failed to load {}", files[0].display()))?;

        let name = cli
            .project_name
            .clone()
            .or_else(|| descriptor.name().map(str::to_string))
            .unwrap_or_else(|| {
                working_dir
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("default")
                    .to_string()
            });

        Ok(Self {
            name,
            working_dir,
            descriptor,
        })
    }

    fn engine(&self, dry_run: bool) -> Arc<dyn ContainerEngine> {
        if dry_run {
            Arc::new(DryRun::new())
        } else {
            Arc::new(DockerCli::new(self.working_dir.clone()))
        }
    }
}

/// `.env` values overlaid by the process environment
fn load_variables(env_file: Option<&Path>, working_dir: &Path) -> anyhow::Result<HashMap<String, String>> {
    let mut vars = match env_file {
        Some(path) => DescriptorParser::load_env_file(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let default = working_dir.join(DEFAULT_ENV_FILE);
            if default.is_file() {
                DescriptorParser::load_env_file(&default)?
            } else {
                HashMap::new()
            }
        }
    };
    vars.extend(std::env::vars());
    Ok(vars)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let project = Project::load(&cli)?;

    match cli.command {
        Commands::Config => {
            StartupPlanner::plan(&project.descriptor)?;
            print!("{}", serde_yaml::to_string(&project.descriptor)?);
        }
        Commands::Plan { json } => {
            let plan = StartupPlanner::plan(&project.descriptor)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print!("{}", plan);
            }
        }
        Commands::Up {
            services,
            dry_run,
            max_retries,
            initial_delay_ms,
        } => {
            let policy = ReadinessPolicy {
                max_retries,
                initial_delay_ms,
                ..ReadinessPolicy::default()
            };
            let engine = project.engine(dry_run);
            let mut orchestrator =
                Orchestrator::new(&project.name, project.descriptor, engine).readiness(policy);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, stopping after the current wave");
                    on_signal.cancel();
                }
            });

            let report = orchestrator.up(&services, cancel).await?;
            for (i, wave) in report.waves.iter().enumerate() {
                let elapsed = wave.ready_at - wave.started_at;
                println!(
                    "wave {}: {} ({} ms)",
                    i + 1,
                    wave.services.join(", "),
                    elapsed.num_milliseconds()
                );
            }
            println!("Started project {}", report.project);
        }
        Commands::Down { volumes, dry_run } => {
            let engine = project.engine(dry_run);
            let mut orchestrator = Orchestrator::new(&project.name, project.descriptor, engine);
            orchestrator.down(volumes).await?;
            println!("Stopped project {}", project.name);
        }
    }

    Ok(())
}
