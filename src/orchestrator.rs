//! Wave-by-wave project orchestration

use crate::descriptor::Descriptor;
use crate::engine::ContainerEngine;
use crate::error::{KeelError, Result};
use crate::plan::{StartupPlan, StartupPlanner};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Project state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    /// Project is not running
    Stopped,
    /// Project is starting
    Starting,
    /// Project is running
    Running,
    /// Project is stopping
    Stopping,
    /// Startup failed or was aborted
    Error,
}

/// Readiness polling with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessPolicy {
    /// Probes before giving up
    pub max_retries: u32,
    /// Delay after the first failed probe
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Growth factor between delays
    pub multiplier: f64,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_retries: 30,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
            multiplier: 2.0,
        }
    }
}

impl ReadinessPolicy {
    /// Delay to sleep after probe number `attempt` (zero-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        delay.min(self.max_delay_ms as f64) as u64
    }
}

/// Poll the engine until the service reports ready
pub async fn wait_for_ready(
    engine: &dyn ContainerEngine,
    project: &str,
    service: &str,
    policy: &ReadinessPolicy,
) -> Result<()> {
    let attempts = policy.max_retries.max(1);

    for attempt in 0..attempts {
        match engine.is_ready(project, service).await {
            Ok(true) => {
                tracing::debug!("Service {} ready after {} probes", service, attempt + 1);
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => tracing::debug!("Readiness probe for {} failed: {}", service, e),
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(Duration::from_millis(policy.delay_for_attempt(attempt))).await;
        }
    }

    Err(KeelError::ReadinessTimeout {
        service: service.to_string(),
        attempts,
    })
}

/// Timing of one started wave
#[derive(Debug, Clone, Serialize)]
pub struct WaveReport {
    /// Services in the wave
    pub services: Vec<String>,
    /// When the first start was issued
    pub started_at: DateTime<Utc>,
    /// When the last member reported ready
    pub ready_at: DateTime<Utc>,
}

/// Outcome of a successful `up`
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub project: String,
    pub waves: Vec<WaveReport>,
}

/// Project orchestrator
pub struct Orchestrator {
    /// Project name
    project_name: String,
    /// Descriptor being realised
    descriptor: Arc<Descriptor>,
    /// Engine that runs the instances
    engine: Arc<dyn ContainerEngine>,
    /// Readiness polling
    readiness: ReadinessPolicy,
    /// Current state
    state: ProjectState,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(project_name: &str, descriptor: Descriptor, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            project_name: project_name.to_string(),
            descriptor: Arc::new(descriptor),
            engine,
            readiness: ReadinessPolicy::default(),
            state: ProjectState::Stopped,
        }
    }

    /// Set readiness policy
    pub fn readiness(mut self, policy: ReadinessPolicy) -> Self {
        self.readiness = policy;
        self
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn state(&self) -> ProjectState {
        self.state
    }

    /// Start plan for the given services (all when empty)
    pub fn plan(&self, services: &[String]) -> Result<StartupPlan> {
        StartupPlanner::plan_for(&self.descriptor, services)
    }

    /// Start the project wave by wave.
    ///
    /// `cancel` is checked before every wave and while waiting for
    /// readiness. Services already started stay up.
    pub async fn up(&mut self, services: &[String], cancel: CancellationToken) -> Result<StartupReport> {
        let plan = self.plan(services)?;
        tracing::info!(
            "Starting project {}: {} services in {} waves",
            self.project_name,
            plan.service_count(),
            plan.len()
        );

        self.state = ProjectState::Starting;
        match self.run_waves(&plan, &cancel).await {
            Ok(waves) => {
                self.state = ProjectState::Running;
                Ok(StartupReport {
                    project: self.project_name.clone(),
                    waves,
                })
            }
            Err(e) => {
                self.state = ProjectState::Error;
                Err(e)
            }
        }
    }

    async fn run_waves(&self, plan: &StartupPlan, cancel: &CancellationToken) -> Result<Vec<WaveReport>> {
        let total = plan.len();
        if cancel.is_cancelled() {
            return Err(KeelError::Aborted {
                completed: 0,
                total,
            });
        }

        self.engine
            .prepare(&self.project_name, &self.descriptor)
            .await?;

        let mut reports = Vec::with_capacity(total);
        for (index, wave) in plan.waves().iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::warn!("Startup cancelled after {} of {} waves", index, total);
                return Err(KeelError::Aborted {
                    completed: index,
                    total,
                });
            }

            tracing::info!("Wave {}/{}: starting {}", index + 1, total, wave);
            let started_at = Utc::now();

            let mut tasks = JoinSet::new();
            for name in wave.services() {
                let name = name.clone();
                let project = self.project_name.clone();
                let descriptor = Arc::clone(&self.descriptor);
                let engine = Arc::clone(&self.engine);
                let policy = self.readiness.clone();
                let cancel = cancel.clone();

                tasks.spawn(async move {
                    let result: Result<()> = async {
                        let service = descriptor
                            .service(&name)
                            .ok_or_else(|| KeelError::ServiceNotFound(name.clone()))?;
                        engine.start(&project, &descriptor, service).await?;

                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(KeelError::Aborted { completed: index, total }),
                            ready = wait_for_ready(engine.as_ref(), &project, &name, &policy) => ready,
                        }
                    }
                    .await;
                    (name, result)
                });
            }

            let mut failures = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => tracing::info!("Service {} is ready", name),
                    Ok((name, Err(e))) => {
                        tracing::error!("Service {} failed: {}", name, e);
                        failures.push((name, e));
                    }
                    Err(e) => failures.push((
                        String::new(),
                        KeelError::Engine(format!("service task failed: {}", e)),
                    )),
                }
            }

            if !failures.is_empty() {
                failures.sort_by(|a, b| a.0.cmp(&b.0));
                return Err(failures.remove(0).1);
            }

            reports.push(WaveReport {
                services: wave.services().to_vec(),
                started_at,
                ready_at: Utc::now(),
            });
        }

        tracing::info!("Project {} is running", self.project_name);
        Ok(reports)
    }

    /// Stop the project in reverse wave order
    pub async fn down(&mut self, remove_volumes: bool) -> Result<()> {
        tracing::info!("Stopping project: {}", self.project_name);
        let plan = StartupPlanner::plan(&self.descriptor)?;
        self.state = ProjectState::Stopping;

        for wave in plan.shutdown_order() {
            let mut tasks = JoinSet::new();
            for name in wave.services() {
                let name = name.clone();
                let project = self.project_name.clone();
                let engine = Arc::clone(&self.engine);
                tasks.spawn(async move {
                    let result = engine.stop(&project, &name).await;
                    (name, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(()))) => {}
                    Ok((name, Err(e))) => tracing::warn!("Failed to stop service {}: {}", name, e),
                    Err(e) => tracing::warn!("Stop task failed: {}", e),
                }
            }
        }

        self.engine
            .teardown(&self.project_name, &self.descriptor, remove_volumes)
            .await?;
        self.state = ProjectState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorParser, Service};
    use crate::engine::DryRun;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Event {
        Start(String),
        Ready(String),
        Stop(String),
        Teardown,
    }

    #[derive(Default)]
    struct RecordingEngine {
        events: Mutex<Vec<Event>>,
        probes: Mutex<HashMap<String, u32>>,
        fail_start: HashSet<String>,
        never_ready: HashSet<String>,
        ready_after: HashMap<String, u32>,
        cancel_when_ready: Option<(String, CancellationToken)>,
    }

    impl RecordingEngine {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn position(&self, event: &Event) -> usize {
            self.events()
                .iter()
                .position(|e| e == event)
                .unwrap_or_else(|| panic!("missing event {:?}", event))
        }
    }

    #[async_trait]
    impl ContainerEngine for RecordingEngine {
        async fn start(&self, _project: &str, _descriptor: &Descriptor, service: &Service) -> Result<()> {
            if self.fail_start.contains(service.name()) {
                return Err(KeelError::Engine(format!("cannot start {}", service.name())));
            }
            self.events
                .lock()
                .unwrap()
                .push(Event::Start(service.name().to_string()));
            Ok(())
        }

        async fn is_ready(&self, _project: &str, service: &str) -> Result<bool> {
            let probes = {
                let mut probes = self.probes.lock().unwrap();
                let count = probes.entry(service.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            if self.never_ready.contains(service) {
                return Ok(false);
            }
            if probes < self.ready_after.get(service).copied().unwrap_or(1) {
                return Ok(false);
            }
            self.events
                .lock()
                .unwrap()
                .push(Event::Ready(service.to_string()));
            if let Some((name, token)) = &self.cancel_when_ready {
                if name == service {
                    token.cancel();
                }
            }
            Ok(true)
        }

        async fn stop(&self, _project: &str, service: &str) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(Event::Stop(service.to_string()));
            Ok(())
        }

        async fn teardown(&self, _project: &str, _descriptor: &Descriptor, _remove_volumes: bool) -> Result<()> {
            self.events.lock().unwrap().push(Event::Teardown);
            Ok(())
        }
    }

    fn fast_policy(max_retries: u32) -> ReadinessPolicy {
        ReadinessPolicy {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            multiplier: 2.0,
        }
    }

    fn stack() -> Descriptor {
        DescriptorParser::parse_str(
            r#"
services:
  db:
    image: mysql:8
  cache:
    image: redis:7
  app:
    build: .
    depends_on: [db, cache]
  web:
    image: nginx
    depends_on: [app]
"#,
        )
        .unwrap()
    }

    fn orchestrator(engine: Arc<RecordingEngine>) -> Orchestrator {
        Orchestrator::new("test", stack(), engine).readiness(fast_policy(5))
    }

    #[test]
    fn test_delay_calculation() {
        let policy = ReadinessPolicy {
            max_retries: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_for_attempt(0), 1000);
        assert_eq!(policy.delay_for_attempt(1), 2000);
        assert_eq!(policy.delay_for_attempt(2), 4000);
        assert_eq!(policy.delay_for_attempt(3), 8000);
        assert_eq!(policy.delay_for_attempt(4), 10000);
    }

    #[tokio::test]
    async fn test_up_respects_wave_order() {
        let engine = Arc::new(RecordingEngine::default());
        let mut orch = orchestrator(engine.clone());

        let report = orch.up(&[], CancellationToken::new()).await.unwrap();
        assert_eq!(orch.state(), ProjectState::Running);
        assert_eq!(report.waves.len(), 3);
        assert_eq!(report.waves[0].services, vec!["cache", "db"]);

        let app_start = engine.position(&Event::Start("app".into()));
        assert!(engine.position(&Event::Ready("db".into())) < app_start);
        assert!(engine.position(&Event::Ready("cache".into())) < app_start);
        assert!(
            engine.position(&Event::Ready("app".into()))
                < engine.position(&Event::Start("web".into()))
        );
    }

    #[tokio::test]
    async fn test_up_subset_starts_dependencies_only() {
        let engine = Arc::new(RecordingEngine::default());
        let mut orch = orchestrator(engine.clone());

        orch.up(&["app".to_string()], CancellationToken::new())
            .await
            .unwrap();
        let started: HashSet<Event> = engine
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Start(_)))
            .collect();
        assert_eq!(started.len(), 3);
        assert!(!started.contains(&Event::Start("web".into())));
    }

    #[tokio::test]
    async fn test_start_failure_stops_sequence() {
        let engine = Arc::new(RecordingEngine {
            fail_start: HashSet::from(["db".to_string()]),
            ..Default::default()
        });
        let mut orch = orchestrator(engine.clone());

        let err = orch.up(&[], CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, KeelError::Engine(_)));
        assert_eq!(orch.state(), ProjectState::Error);

        let events = engine.events();
        assert!(events.contains(&Event::Start("cache".into())));
        assert!(!events.contains(&Event::Start("app".into())));
        // no rollback of the healthy sibling
        assert!(!events.iter().any(|e| matches!(e, Event::Stop(_))));
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        let engine = Arc::new(RecordingEngine {
            never_ready: HashSet::from(["cache".to_string()]),
            ..Default::default()
        });
        let mut orch = Orchestrator::new("test", stack(), engine.clone()).readiness(fast_policy(3));

        match orch.up(&[], CancellationToken::new()).await.unwrap_err() {
            KeelError::ReadinessTimeout { service, attempts } => {
                assert_eq!(service, "cache");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.probes.lock().unwrap()["cache"], 3);
    }

    #[tokio::test]
    async fn test_readiness_retries_until_ready() {
        let engine = Arc::new(RecordingEngine {
            ready_after: HashMap::from([("db".to_string(), 3)]),
            ..Default::default()
        });
        let mut orch = orchestrator(engine.clone());

        orch.up(&[], CancellationToken::new()).await.unwrap();
        assert_eq!(engine.probes.lock().unwrap()["db"], 3);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let engine = Arc::new(RecordingEngine::default());
        let mut orch = orchestrator(engine.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch.up(&[], cancel).await.unwrap_err();
        assert!(matches!(err, KeelError::Aborted { completed: 0, total: 3 }));
        assert!(engine.events().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_waves() {
        let cancel = CancellationToken::new();
        let descriptor = DescriptorParser::parse_str(
            "services:\n  db:\n    image: mysql\n  app:\n    image: app\n    depends_on: [db]\n",
        )
        .unwrap();
        let engine = Arc::new(RecordingEngine {
            cancel_when_ready: Some(("db".to_string(), cancel.clone())),
            ..Default::default()
        });
        let mut orch = Orchestrator::new("test", descriptor, engine.clone()).readiness(fast_policy(5));

        let err = orch.up(&[], cancel).await.unwrap_err();
        assert!(matches!(err, KeelError::Aborted { completed: 1, total: 2 }));
        assert_eq!(
            engine.events(),
            vec![Event::Start("db".into()), Event::Ready("db".into())]
        );
    }

    #[tokio::test]
    async fn test_down_stops_in_reverse_order() {
        let engine = Arc::new(RecordingEngine::default());
        let mut orch = orchestrator(engine.clone());

        orch.down(false).await.unwrap();
        assert_eq!(orch.state(), ProjectState::Stopped);

        let web = engine.position(&Event::Stop("web".into()));
        let app = engine.position(&Event::Stop("app".into()));
        let db = engine.position(&Event::Stop("db".into()));
        assert!(web < app);
        assert!(app < db);
        assert_eq!(engine.events().last(), Some(&Event::Teardown));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_never_touches_engine() {
        let descriptor =
            DescriptorParser::parse_str("services:\n  a:\n    image: a\n    depends_on: [b]\n")
                .unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let mut orch = Orchestrator::new("test", descriptor, engine.clone());

        let err = orch.up(&[], CancellationToken::new()).await.unwrap_err();
        assert!(err.is_config_error());
        assert!(engine.events().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_engine() {
        let engine = Arc::new(DryRun::new());
        let mut orch = Orchestrator::new("demo", stack(), engine.clone());

        orch.up(&[], CancellationToken::new()).await.unwrap();
        let actions = engine.actions();
        assert_eq!(actions[0], "create network demo_default");
        assert_eq!(actions.last().map(String::as_str), Some("start demo-web-1 from nginx"));
    }
}
