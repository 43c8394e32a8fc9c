//! The staged apply pipeline.
//!
//! Drives one run end to end: diff, validate, prepare, render, persist,
//! deploy, wait, ensure, verify, finalize. Every stage emits a `started`
//! event followed by a terminal `ok`/`failed`; all events land in the run log
//! and on the event bus in the order produced. Applies serialise through an
//! internal mutex, so two concurrent submissions never interleave.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use convoy_compose::{
    ensure_proxy_assets, ComposeDriver, ComposeResult, DriverOutcome, TemplateRenderer,
};
use convoy_compose::render::SecretsSnapshot;
use convoy_config::constants::SERVICE_ORDER;
use convoy_config::{PathMap, ServiceName, StackConfig};
use convoy_events::{Event, EventBus, StageEvent, StageStatus};
use convoy_store::{ConfigStore, Section, SecretsSection, StoreError, StoreResult};
use convoy_telemetry::Metrics;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use crate::scheduler::{Scheduler, ServiceRun};
use crate::validate::run_validation;

/// Deadline for a container port to open after deploy.
const WAIT_TIMEOUT: Duration = Duration::from_secs(180);
/// Poll interval for the port wait.
const WAIT_INTERVAL: Duration = Duration::from_secs(3);
/// Per-attempt connect timeout during the port wait.
const WAIT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deployment seam so the compose CLI can be faked in tests.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Bring the rendered bundle up.
    async fn up(&self) -> ComposeResult<DriverOutcome>;
    /// Stop development containers that would collide with the stack.
    async fn stop_conflicting(&self, enabled: &[ServiceName]) -> Vec<String>;
}

#[async_trait]
impl Deployer for ComposeDriver {
    async fn up(&self) -> ComposeResult<DriverOutcome> {
        Self::up(self).await
    }

    async fn stop_conflicting(&self, enabled: &[ServiceName]) -> Vec<String> {
        self.stop_conflicting_dev_services(enabled).await
    }
}

/// Outcome of one apply run.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// Whether the run reached verified-ok.
    pub ok: bool,
    /// Every stage event, in emission order.
    pub events: Vec<StageEvent>,
}

/// Drives apply runs against the store, renderer, deployer, and scheduler.
pub struct ApplyRunner {
    store: Arc<ConfigStore>,
    renderer: TemplateRenderer,
    scheduler: Scheduler,
    deployer: Arc<dyn Deployer>,
    bus: EventBus,
    metrics: Metrics,
    paths: PathMap,
    docker: convoy_compose::DockerCli,
    wait_timeout: Duration,
    wait_interval: Duration,
    wait_addresses: Option<std::collections::BTreeMap<ServiceName, String>>,
    run_lock: tokio::sync::Mutex<()>,
}

impl ApplyRunner {
    /// Construct a runner with the production compose driver.
    #[must_use]
    pub fn new(
        store: Arc<ConfigStore>,
        renderer: TemplateRenderer,
        scheduler: Scheduler,
        bus: EventBus,
        metrics: Metrics,
    ) -> Self {
        let compose_path = store.generated_dir().join("docker-compose.yml");
        Self {
            store,
            renderer,
            scheduler,
            deployer: Arc::new(ComposeDriver::new(compose_path)),
            bus,
            metrics,
            paths: PathMap::default(),
            docker: convoy_compose::DockerCli::default(),
            wait_timeout: WAIT_TIMEOUT,
            wait_interval: WAIT_INTERVAL,
            wait_addresses: None,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the deployment seam.
    #[must_use]
    pub fn with_deployer(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.deployer = deployer;
        self
    }

    /// Apply a host-to-container path map.
    #[must_use]
    pub fn with_paths(mut self, paths: PathMap) -> Self {
        self.paths = paths;
        self
    }

    /// Override the readiness wait policy.
    #[must_use]
    pub fn with_wait_policy(mut self, wait_timeout: Duration, wait_interval: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self.wait_interval = wait_interval;
        self
    }

    /// Override wait targets per service (tests point at local listeners
    /// instead of compose-network container names).
    #[must_use]
    pub fn with_wait_addresses(
        mut self,
        addresses: std::collections::BTreeMap<ServiceName, String>,
    ) -> Self {
        self.wait_addresses = Some(addresses);
        self
    }

    /// Run one apply end to end.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store itself fails; every service-level
    /// failure is reported through stage events and the report's `ok` flag.
    pub async fn run(&self, run_id: &str, config: &StackConfig) -> StoreResult<ApplyReport> {
        let _serialise = self.run_lock.lock().await;
        self.metrics.set_active_run(true);
        let result = self.run_inner(run_id, config).await;
        self.metrics.set_active_run(false);
        result
    }

    #[allow(clippy::too_many_lines)]
    async fn run_inner(&self, run_id: &str, config: &StackConfig) -> StoreResult<ApplyReport> {
        let mut events: Vec<StageEvent> = Vec::new();
        self.store.start_run(run_id)?;
        info!(run_id, "apply run started");

        // Advisory diff against the stored document; never fatal.
        self.record(run_id, &mut events, StageEvent::started("diff"))?;
        let diff_detail = match self.store.load_config() {
            Ok(previous) => {
                let diff = crate::diff::compute_diff(&previous, config);
                diff.summary_lines().join("; ")
            }
            Err(StoreError::ConfigMissing { .. }) => "initial apply (no previous config)".to_string(),
            Err(err) => {
                warn!(error = %err, "previous config unreadable; diff skipped");
                "previous config unreadable".to_string()
            }
        };
        self.record(run_id, &mut events, StageEvent::ok("diff", diff_detail))?;

        // Preflight validation; fatal on failure.
        self.record(run_id, &mut events, StageEvent::started("validate"))?;
        let validation = run_validation(config, &self.docker, &self.paths).await;
        let summary = validation.summary();
        if validation.ok {
            self.record(run_id, &mut events, StageEvent::ok("validate", summary))?;
        } else {
            self.record(run_id, &mut events, StageEvent::failed("validate", summary))?;
            return self.abort(run_id, events, "Validation failed");
        }

        // Directory tree; fatal on permission failure. The error text carries
        // the remediation commands.
        self.record(run_id, &mut events, StageEvent::started("prepare.paths"))?;
        match self.store.ensure_dirs(config, &self.paths) {
            Ok(changes) => {
                let detail = if changes.is_empty() {
                    "directories ready".to_string()
                } else {
                    changes.join(", ")
                };
                self.record(run_id, &mut events, StageEvent::ok("prepare.paths", detail))?;
            }
            Err(err) => {
                self.record(
                    run_id,
                    &mut events,
                    StageEvent::failed("prepare.paths", err.to_string()),
                )?;
                return self.abort(run_id, events, "Path preparation failed");
            }
        }

        // Proxy TLS assets; fatal on failure.
        self.record(run_id, &mut events, StageEvent::started("prepare.proxy"))?;
        match ensure_proxy_assets(config, &self.paths).await {
            Ok((_, detail)) => {
                self.record(run_id, &mut events, StageEvent::ok("prepare.proxy", detail))?;
            }
            Err(err) => {
                self.record(
                    run_id,
                    &mut events,
                    StageEvent::failed("prepare.proxy", err.to_string()),
                )?;
                return self.abort(run_id, events, "Proxy preparation failed");
            }
        }

        // Harmonise secrets with the document.
        self.record(run_id, &mut events, StageEvent::started("prepare.secrets"))?;
        let secrets_detail = self.prepare_secrets(config)?;
        self.record(
            run_id,
            &mut events,
            StageEvent::ok("prepare.secrets", secrets_detail),
        )?;

        // Render the compose bundle.
        self.record(run_id, &mut events, StageEvent::started("render"))?;
        let secrets_snapshot = self.secrets_snapshot()?;
        let generated = self.store.generated_dir();
        let render_result = match self
            .renderer
            .render(config, &generated, &secrets_snapshot)
        {
            Ok(result) => result,
            Err(err) => {
                self.record(run_id, &mut events, StageEvent::failed("render", err.to_string()))?;
                return self.abort(run_id, events, "Render failed");
            }
        };
        let mut render_detail = vec![
            file_name(&render_result.compose_path),
            file_name(&render_result.env_path),
        ];
        if !render_result.secret_files.is_empty() {
            render_detail.push(format!("{} secrets", render_result.secret_files.len()));
        }
        self.record(
            run_id,
            &mut events,
            StageEvent::ok("render", render_detail.join(",")),
        )?;

        // Persist the document as the new authoritative copy.
        self.record(run_id, &mut events, StageEvent::started("persist"))?;
        if let Err(err) = self.store.save_config(config) {
            self.record(run_id, &mut events, StageEvent::failed("persist", err.to_string()))?;
            return self.abort(run_id, events, "Persist failed");
        }
        self.record(
            run_id,
            &mut events,
            StageEvent::ok("persist", self.store.stack_path().display().to_string()),
        )?;

        // Stop colliding dev containers; warning-only.
        self.record(run_id, &mut events, StageEvent::started("prepare.conflicts"))?;
        let enabled: Vec<ServiceName> = SERVICE_ORDER
            .into_iter()
            .filter(|service| config.services.settings(*service).enabled)
            .collect();
        let stopped = self.deployer.stop_conflicting(&enabled).await;
        let conflicts_detail = if stopped.is_empty() {
            "no conflicts".to_string()
        } else {
            format!("stopped {}", stopped.join(", "))
        };
        self.record(
            run_id,
            &mut events,
            StageEvent::ok("prepare.conflicts", conflicts_detail),
        )?;

        // Bring the containers up; fatal.
        self.record(run_id, &mut events, StageEvent::started("deploy.compose"))?;
        match self.deployer.up().await {
            Ok(outcome) if outcome.ok => {
                self.record(
                    run_id,
                    &mut events,
                    StageEvent::ok("deploy.compose", outcome.detail),
                )?;
            }
            Ok(outcome) => {
                self.record(
                    run_id,
                    &mut events,
                    StageEvent::failed("deploy.compose", outcome.detail),
                )?;
                return self.abort(run_id, events, "Compose up failed");
            }
            Err(err) => {
                self.record(
                    run_id,
                    &mut events,
                    StageEvent::failed("deploy.compose", err.to_string()),
                )?;
                return self.abort(run_id, events, "Compose up failed");
            }
        }

        // Wait for every enabled container port; fatal on timeout.
        for service in SERVICE_ORDER {
            let settings = config.services.settings(service);
            let (Some(container), Some(port)) =
                (service.container_name(), service.internal_port())
            else {
                continue;
            };
            if !settings.enabled {
                continue;
            }
            let stage = format!("wait.{service}");
            self.record(
                run_id,
                &mut events,
                StageEvent::new(&stage, StageStatus::Started, Some(format!("port={port}"))),
            )?;
            let address = self
                .wait_addresses
                .as_ref()
                .and_then(|overrides| overrides.get(&service))
                .cloned()
                .unwrap_or_else(|| format!("{container}:{port}"));
            let (ready, detail) = self.wait_for_port(&address).await;
            if ready {
                self.record(run_id, &mut events, StageEvent::ok(&stage, detail))?;
            } else {
                self.record(run_id, &mut events, StageEvent::failed(&stage, detail))?;
                return self.abort(run_id, events, "Service readiness failed");
            }
        }

        // Ensure phase.
        let ensure_runs = self.scheduler.ensure(config).await;
        let mut ensure_failures: Vec<ServiceName> = Vec::new();
        let mut configured: Vec<String> = Vec::new();
        for run in &ensure_runs {
            self.record(run_id, &mut events, StageEvent::started(&run.event.stage))?;
            self.record(run_id, &mut events, run.event.clone())?;
            if run.event.status == StageStatus::Failed {
                ensure_failures.push(run.service);
            } else if !run
                .event
                .detail
                .as_deref()
                .unwrap_or_default()
                .starts_with("skipped")
            {
                configured.push(run.service.to_string());
            }
        }

        // Re-render secret files when the ensure phase minted anything new.
        let latest_snapshot = self.secrets_snapshot()?;
        if latest_snapshot != secrets_snapshot {
            self.record(run_id, &mut events, StageEvent::started("render.secrets"))?;
            match self
                .renderer
                .render_secrets(config, &generated, &latest_snapshot)
            {
                Ok((_, files)) => {
                    self.record(
                        run_id,
                        &mut events,
                        StageEvent::ok("render.secrets", format!("{} secrets refreshed", files.len())),
                    )?;
                }
                Err(err) => {
                    self.record(
                        run_id,
                        &mut events,
                        StageEvent::failed("render.secrets", err.to_string()),
                    )?;
                    return self.abort(run_id, events, "Secret re-render failed");
                }
            }
        }

        // Verify phase: full health picture, no skipping.
        let verify_runs = self.scheduler.verify(config).await;
        let mut verify_failures: Vec<ServiceName> = Vec::new();
        for run in &verify_runs {
            self.record(run_id, &mut events, StageEvent::started(&run.event.stage))?;
            self.record(run_id, &mut events, run.event.clone())?;
            if run.event.status == StageStatus::Failed {
                verify_failures.push(run.service);
            }
        }

        let ok = ensure_failures.is_empty() && verify_failures.is_empty();
        let summary = if !ensure_failures.is_empty() {
            format!("ensure failed: {}", join_names(&ensure_failures))
        } else if !verify_failures.is_empty() {
            format!("verification failed: {}", join_names(&verify_failures))
        } else {
            let mut summary = "Rendered compose bundle".to_string();
            if !configured.is_empty() {
                summary.push_str(&format!("; configured {}", configured.join(", ")));
            }
            summary
        };
        self.finish(run_id, ok, &summary)?;
        Ok(ApplyReport { ok, events })
    }

    /// Seed the secrets section from the document and the orchestrator's own
    /// admin user. Returns the stage detail.
    fn prepare_secrets(&self, config: &StackConfig) -> StoreResult<String> {
        let mut details: Vec<String> = Vec::new();
        let qb = &config.services.qbittorrent;
        if self.store.set_secret("qbittorrent", "username", &qb.username)? {
            details.push("qbittorrent username set".to_string());
        }
        if self.store.set_secret("qbittorrent", "password", &qb.password)? {
            details.push("qbittorrent password set".to_string());
        }

        // The media server and the request broker share admin identity with
        // the orchestrator's own admin when one exists.
        let admin_username = self
            .store
            .admin_user()?
            .map_or_else(|| "admin".to_string(), |user| user.username);
        for service in ["jellyfin", "jellyseerr"] {
            if self
                .store
                .set_secret(service, "admin_username", &admin_username)?
            {
                details.push(format!("{service} admin username set"));
            }
            let existing = self.store.get_secret(service, "admin_password")?;
            if existing.is_none() {
                self.store
                    .ensure_secret(service, "admin_password", || "adminadmin".to_string())?;
                details.push(format!("{service} admin password set"));
            }
        }

        Ok(if details.is_empty() {
            "secrets unchanged".to_string()
        } else {
            details.join(", ")
        })
    }

    fn secrets_snapshot(&self) -> StoreResult<SecretsSnapshot> {
        let secrets: SecretsSection = self.store.load_section(Section::Secrets)?;
        Ok(secrets.services)
    }

    async fn wait_for_port(&self, address: &str) -> (bool, String) {
        let deadline = Instant::now() + self.wait_timeout;
        let mut last_error = String::from("no response");
        loop {
            match timeout(WAIT_CONNECT_TIMEOUT, TcpStream::connect(address)).await {
                Ok(Ok(_)) => return (true, "ready".to_string()),
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => last_error = "connect timed out".to_string(),
            }
            if Instant::now() >= deadline {
                return (
                    false,
                    format!("timeout waiting for {address} ({last_error})"),
                );
            }
            sleep(self.wait_interval).await;
        }
    }

    fn record(
        &self,
        run_id: &str,
        events: &mut Vec<StageEvent>,
        event: StageEvent,
    ) -> StoreResult<()> {
        self.store.append_run_event(run_id, event.clone())?;
        self.metrics
            .inc_stage_event(&event.stage, event.status.as_str());
        self.bus.publish(Event::Stage {
            run_id: run_id.to_string(),
            event: event.clone(),
        });
        events.push(event);
        Ok(())
    }

    fn abort(
        &self,
        run_id: &str,
        events: Vec<StageEvent>,
        summary: &str,
    ) -> StoreResult<ApplyReport> {
        self.finish(run_id, false, summary)?;
        Ok(ApplyReport { ok: false, events })
    }

    fn finish(&self, run_id: &str, ok: bool, summary: &str) -> StoreResult<()> {
        self.store.finalize_run(run_id, ok, Some(summary))?;
        self.bus.publish(Event::RunFinished {
            run_id: run_id.to_string(),
            ok,
            summary: Some(summary.to_string()),
        });
        self.metrics
            .inc_apply_run(if ok { "ok" } else { "failed" });
        info!(run_id, ok, summary, "apply run finished");
        Ok(())
    }
}

/// Standalone verify sweep, used by the CLI without a full apply.
pub async fn verify_only(scheduler: &Scheduler, config: &StackConfig) -> Vec<ServiceRun> {
    scheduler.verify(config).await
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

fn join_names(services: &[ServiceName]) -> String {
    services
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_clients::{Outcome, ServiceClient};
    use std::net::TcpListener;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeDeployer {
        up_ok: bool,
        calls: Mutex<u32>,
    }

    impl FakeDeployer {
        fn new(up_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                up_ok,
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl Deployer for FakeDeployer {
        async fn up(&self) -> ComposeResult<DriverOutcome> {
            *self.calls.lock().unwrap() += 1;
            Ok(DriverOutcome {
                ok: self.up_ok,
                detail: if self.up_ok { "ok" } else { "boom" }.to_string(),
            })
        }

        async fn stop_conflicting(&self, _enabled: &[ServiceName]) -> Vec<String> {
            Vec::new()
        }
    }

    struct ScriptedClient {
        name: ServiceName,
        ensure_outcome: Outcome,
        verify_outcome: Outcome,
    }

    #[async_trait]
    impl ServiceClient for ScriptedClient {
        fn name(&self) -> ServiceName {
            self.name
        }
        async fn ensure(&self, _config: &StackConfig) -> Outcome {
            self.ensure_outcome.clone()
        }
        async fn verify(&self, _config: &StackConfig) -> Outcome {
            self.verify_outcome.clone()
        }
    }

    fn write_templates(dir: &std::path::Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("docker-compose.yml.j2"), "services: {}\n").unwrap();
        std::fs::write(dir.join("env.j2"), "TZ={{ config.runtime.timezone }}\n").unwrap();
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Config with real directories and no enabled container services, so
    /// the wait phase has nothing to poll.
    fn disabled_config(dir: &TempDir) -> StackConfig {
        let mut config = StackConfig::with_paths(
            dir.path().join("pool"),
            dir.path().join("appdata"),
            None,
        );
        std::fs::create_dir_all(&config.paths.pool).unwrap();
        std::fs::create_dir_all(&config.paths.appdata).unwrap();
        config.ui.port = free_port();
        config.services.qbittorrent.enabled = false;
        config.services.radarr.enabled = false;
        config.services.sonarr.enabled = false;
        config.services.prowlarr.enabled = false;
        config.services.jellyfin.enabled = false;
        config.services.jellyseerr.enabled = false;
        config
    }

    fn runner(dir: &TempDir, deployer: Arc<dyn Deployer>) -> (Arc<ConfigStore>, ApplyRunner) {
        let store = Arc::new(ConfigStore::open(dir.path().join("state")).unwrap());
        let templates = dir.path().join("templates");
        write_templates(&templates);
        let runner = ApplyRunner::new(
            store.clone(),
            TemplateRenderer::new(&templates),
            Scheduler::new(Vec::new()),
            EventBus::new(),
            Metrics::new().unwrap(),
        )
        .with_deployer(deployer);
        (store, runner)
    }

    fn stage_statuses(events: &[StageEvent]) -> Vec<(String, StageStatus)> {
        events
            .iter()
            .map(|event| (event.stage.clone(), event.status))
            .collect()
    }

    #[tokio::test]
    async fn successful_apply_walks_every_stage_in_order() {
        let dir = TempDir::new().unwrap();
        let (store, runner) = runner(&dir, FakeDeployer::new(true));
        let config = disabled_config(&dir);

        let report = runner.run("r1", &config).await.unwrap();
        assert!(report.ok, "events: {:?}", report.events);

        let stages: Vec<String> = report.events.iter().map(|e| e.stage.clone()).collect();
        let expected_prefix = [
            "diff", "diff", "validate", "validate", "prepare.paths", "prepare.paths",
            "prepare.proxy", "prepare.proxy", "prepare.secrets", "prepare.secrets",
            "render", "render", "persist", "persist", "prepare.conflicts",
            "prepare.conflicts", "deploy.compose", "deploy.compose",
        ];
        assert_eq!(&stages[..expected_prefix.len()], expected_prefix);

        // Every stage emitted started before its terminal status.
        for pair in stage_statuses(&report.events).chunks(2) {
            if pair.len() == 2 && pair[0].0 == pair[1].0 {
                assert_eq!(pair[0].1, StageStatus::Started);
                assert_ne!(pair[1].1, StageStatus::Started);
            }
        }

        // Disabled services appear as skipped configure/verify events.
        assert!(stages.contains(&"configure.sonarr".to_string()));
        assert!(stages.contains(&"verify.jellyseerr".to_string()));

        let record = store.get_run("r1").unwrap();
        assert_eq!(record.ok, Some(true));
        assert_eq!(record.events.len(), report.events.len());
        assert!(record.summary.unwrap().contains("Rendered compose bundle"));

        // The config was persisted as the authoritative copy.
        assert_eq!(store.load_config().unwrap(), config);
    }

    #[tokio::test]
    async fn compose_failure_aborts_before_waits() {
        let dir = TempDir::new().unwrap();
        let (store, runner) = runner(&dir, FakeDeployer::new(false));
        let config = disabled_config(&dir);

        let report = runner.run("r2", &config).await.unwrap();
        assert!(!report.ok);
        let last = report.events.last().unwrap();
        assert_eq!(last.stage, "deploy.compose");
        assert_eq!(last.status, StageStatus::Failed);
        assert!(
            !report.events.iter().any(|e| e.stage.starts_with("configure.")),
            "no ensure events after a fatal deploy"
        );
        let record = store.get_run("r2").unwrap();
        assert_eq!(record.ok, Some(false));
        assert_eq!(record.summary.as_deref(), Some("Compose up failed"));
    }

    #[tokio::test]
    async fn validation_failure_is_fatal_with_remediation_context() {
        let dir = TempDir::new().unwrap();
        let (store, runner) = runner(&dir, FakeDeployer::new(true));
        let mut config = disabled_config(&dir);
        config.paths.pool = dir.path().join("missing-pool");

        let report = runner.run("r3", &config).await.unwrap();
        assert!(!report.ok);
        let validate_failed = report
            .events
            .iter()
            .find(|e| e.stage == "validate" && e.status == StageStatus::Failed)
            .expect("validate failure recorded");
        assert!(validate_failed
            .detail
            .as_deref()
            .unwrap()
            .contains("paths.pool=missing"));
        assert_eq!(
            store.get_run("r3").unwrap().summary.as_deref(),
            Some("Validation failed")
        );
    }

    #[tokio::test]
    async fn ensure_failure_marks_run_failed_but_verify_still_runs() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConfigStore::open(dir.path().join("state")).unwrap());
        let templates = dir.path().join("templates");
        write_templates(&templates);

        // A live listener stands in for the jellyfin container port.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let wait_address = listener.local_addr().unwrap().to_string();

        let jellyfin: Arc<dyn ServiceClient> = Arc::new(ScriptedClient {
            name: ServiceName::Jellyfin,
            ensure_outcome: Outcome::failed("wizard exploded"),
            verify_outcome: Outcome::failed("still broken"),
        });
        let runner = ApplyRunner::new(
            store.clone(),
            TemplateRenderer::new(&templates),
            Scheduler::new(vec![jellyfin]),
            EventBus::new(),
            Metrics::new().unwrap(),
        )
        .with_deployer(FakeDeployer::new(true))
        .with_wait_policy(Duration::from_secs(2), Duration::from_millis(30))
        .with_wait_addresses(std::collections::BTreeMap::from([(
            ServiceName::Jellyfin,
            wait_address,
        )]));

        let mut config = disabled_config(&dir);
        config.services.jellyfin.enabled = true;
        config.services.jellyfin.port = free_port();

        let report = runner.run("r4", &config).await.unwrap();
        assert!(!report.ok, "ensure failure fails the run");

        let configure = report
            .events
            .iter()
            .find(|e| e.stage == "configure.jellyfin" && e.status != StageStatus::Started)
            .unwrap();
        assert_eq!(configure.status, StageStatus::Failed);
        assert_eq!(configure.detail.as_deref(), Some("wizard exploded"));

        // Verification still reports the full picture.
        let verify = report
            .events
            .iter()
            .find(|e| e.stage == "verify.jellyfin" && e.status != StageStatus::Started)
            .unwrap();
        assert_eq!(verify.status, StageStatus::Failed);

        let record = store.get_run("r4").unwrap();
        assert_eq!(record.ok, Some(false));
        assert_eq!(record.summary.as_deref(), Some("ensure failed: jellyfin"));
    }

    #[tokio::test]
    async fn wait_timeout_is_fatal_with_address_in_detail() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConfigStore::open(dir.path().join("state")).unwrap());
        let templates = dir.path().join("templates");
        write_templates(&templates);

        let runner = ApplyRunner::new(
            store.clone(),
            TemplateRenderer::new(&templates),
            Scheduler::new(Vec::new()),
            EventBus::new(),
            Metrics::new().unwrap(),
        )
        .with_deployer(FakeDeployer::new(true))
        .with_wait_policy(Duration::from_millis(200), Duration::from_millis(50))
        .with_wait_addresses(std::collections::BTreeMap::from([(
            ServiceName::Jellyfin,
            // Nothing listens here; connects are refused immediately.
            "127.0.0.1:1".to_string(),
        )]));

        let mut config = disabled_config(&dir);
        config.services.jellyfin.enabled = true;
        config.services.jellyfin.port = free_port();

        let report = runner.run("r-wait", &config).await.unwrap();
        assert!(!report.ok);
        let last = report.events.last().unwrap();
        assert_eq!(last.stage, "wait.jellyfin");
        assert_eq!(last.status, StageStatus::Failed);
        assert!(
            last.detail.as_deref().unwrap().contains("timeout waiting for"),
            "{:?}",
            last.detail
        );
        assert!(
            !report.events.iter().any(|e| e.stage.starts_with("configure.")),
            "no configure events after a readiness failure"
        );
        assert_eq!(
            store.get_run("r-wait").unwrap().summary.as_deref(),
            Some("Service readiness failed")
        );
    }

    #[tokio::test]
    async fn second_apply_of_same_config_reports_no_diff() {
        let dir = TempDir::new().unwrap();
        let (_store, runner) = runner(&dir, FakeDeployer::new(true));
        let config = disabled_config(&dir);

        runner.run("r5", &config).await.unwrap();
        let report = runner.run("r6", &config).await.unwrap();
        assert!(report.ok);
        let diff_ok = report
            .events
            .iter()
            .find(|e| e.stage == "diff" && e.status == StageStatus::Ok)
            .unwrap();
        assert_eq!(diff_ok.detail.as_deref(), Some("No changes detected"));
    }

    #[tokio::test]
    async fn run_events_stream_to_subscribers() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConfigStore::open(dir.path().join("state")).unwrap());
        let templates = dir.path().join("templates");
        write_templates(&templates);
        let bus = EventBus::new();
        let runner = ApplyRunner::new(
            store,
            TemplateRenderer::new(&templates),
            Scheduler::new(Vec::new()),
            bus.clone(),
            Metrics::new().unwrap(),
        )
        .with_deployer(FakeDeployer::new(true));

        let config = disabled_config(&dir);
        runner.run("r7", &config).await.unwrap();

        let mut stream = bus.subscribe_run("r7");
        let first = stream.next().await.expect("backlog event");
        assert_eq!(first.event.kind(), "stage");
        // Drain to the terminal event.
        let mut terminal = None;
        while let Some(envelope) = stream.next().await {
            let is_final = envelope.event.kind() == "run_finished";
            terminal = Some(envelope);
            if is_final {
                break;
            }
        }
        let terminal = terminal.unwrap();
        match terminal.event {
            Event::RunFinished { ok, .. } => assert!(ok),
            Event::Stage { .. } => panic!("expected terminal event"),
        }
    }
}
