//! The explicit application context.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use convoy_clients::{
    JellyfinClient, JellyseerrClient, ProwlarrClient, QbittorrentClient, RadarrClient,
    ServiceClient, SonarrClient,
};
use convoy_compose::{ComposeDriver, DockerCli, DriverOutcome, TemplateRenderer};
use convoy_config::{PathMap, StackConfig};
use convoy_converge::{
    run_validation, ApplyReport, ApplyRunner, Scheduler, ServiceRun, ValidationResult,
};
use convoy_events::EventBus;
use convoy_pipeline::PipelineWorker;
use convoy_store::{ConfigStore, RunRecord};
use convoy_telemetry::Metrics;
use tracing::info;

/// Root directory environment override.
pub const ENV_ROOT: &str = "ORCH_ROOT";
/// Pipeline tick interval environment override, in seconds.
pub const ENV_PIPELINE_INTERVAL: &str = "PIPELINE_INTERVAL";
/// Debug toggle widening surfaced error details.
pub const ENV_DEBUG: &str = "DEBUG";

/// Default pipeline tick interval.
const DEFAULT_PIPELINE_INTERVAL: Duration = Duration::from_secs(60);

/// Everything the orchestrator needs, wired once and passed by reference.
pub struct AppContext {
    store: Arc<ConfigStore>,
    template_dir: PathBuf,
    bus: EventBus,
    metrics: Metrics,
}

impl AppContext {
    /// Wire the context against an explicit root and template directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be opened or the metrics
    /// registry cannot be built.
    pub fn new(root: PathBuf, template_dir: PathBuf) -> Result<Self> {
        let store =
            Arc::new(ConfigStore::open(&root).context("failed to open configuration store")?);
        let metrics = Metrics::new().context("failed to build metrics registry")?;
        info!(root = %root.display(), templates = %template_dir.display(), "context wired");
        Ok(Self {
            store,
            template_dir,
            bus: EventBus::new(),
            metrics,
        })
    }

    /// Wire the context from the environment: `ORCH_ROOT` (default `.`) with
    /// templates under `<root>/templates`, falling back to `./templates`.
    ///
    /// # Errors
    ///
    /// Same contract as [`AppContext::new`].
    pub fn from_env() -> Result<Self> {
        let root = std::env::var(ENV_ROOT).map_or_else(|_| PathBuf::from("."), PathBuf::from);
        let rooted_templates = root.join("templates");
        let template_dir = if rooted_templates.is_dir() {
            rooted_templates
        } else {
            PathBuf::from("templates")
        };
        Self::new(root, template_dir)
    }

    /// The shared store.
    #[must_use]
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// The run event bus.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The metrics registry.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Whether `DEBUG` is truthy in the environment.
    #[must_use]
    pub fn debug_enabled() -> bool {
        std::env::var(ENV_DEBUG).is_ok_and(|value| {
            matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }

    /// Pipeline tick interval from `PIPELINE_INTERVAL`, defaulting to 60 s.
    #[must_use]
    pub fn pipeline_interval() -> Duration {
        std::env::var(ENV_PIPELINE_INTERVAL)
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map_or(DEFAULT_PIPELINE_INTERVAL, Duration::from_secs)
    }

    fn scheduler(&self, paths: &PathMap) -> Scheduler {
        let clients: Vec<Arc<dyn ServiceClient>> = vec![
            Arc::new(QbittorrentClient::new(self.store.clone())),
            Arc::new(RadarrClient::new(self.store.clone()).with_paths(paths.clone())),
            Arc::new(SonarrClient::new(self.store.clone()).with_paths(paths.clone())),
            Arc::new(ProwlarrClient::new(self.store.clone()).with_paths(paths.clone())),
            Arc::new(JellyfinClient::new(self.store.clone())),
            Arc::new(JellyseerrClient::new(self.store.clone()).with_paths(paths.clone())),
        ];
        Scheduler::new(clients)
    }

    /// Drive one full apply of the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error only for store-level failures; apply-level failures
    /// are reported through the returned report.
    pub async fn apply(&self, run_id: &str, config: &StackConfig) -> Result<ApplyReport> {
        let paths = PathMap::from_env(&config.paths);
        let runner = ApplyRunner::new(
            self.store.clone(),
            TemplateRenderer::new(&self.template_dir),
            self.scheduler(&paths),
            self.bus.clone(),
            self.metrics.clone(),
        )
        .with_paths(paths);
        let report = runner.run(run_id, config).await?;
        Ok(report)
    }

    /// Preflight-validate a configuration without applying it.
    pub async fn validate(&self, config: &StackConfig) -> ValidationResult {
        let paths = PathMap::from_env(&config.paths);
        run_validation(config, &DockerCli::default(), &paths).await
    }

    /// Verify every enabled service against the stored configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored configuration cannot be loaded.
    pub async fn verify(&self) -> Result<Vec<ServiceRun>> {
        let config = self.store.load_config()?;
        let paths = PathMap::from_env(&config.paths);
        Ok(self.scheduler(&paths).verify(&config).await)
    }

    /// Bring the deployed stack down.
    ///
    /// # Errors
    ///
    /// Returns an error when the compose CLI cannot be invoked.
    pub async fn down(&self) -> Result<DriverOutcome> {
        let compose_path = self.store.generated_dir().join("docker-compose.yml");
        let driver = ComposeDriver::new(compose_path);
        Ok(driver.down().await?)
    }

    /// Run the media pipeline worker until the process exits.
    pub async fn run_pipeline(&self, interval: Duration) {
        let paths = self
            .store
            .load_config()
            .map(|config| PathMap::from_env(&config.paths))
            .unwrap_or_default();
        let worker =
            PipelineWorker::new(self.store.clone(), self.metrics.clone()).with_paths(paths);
        worker.run_forever(interval).await;
    }

    /// Recent apply runs, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the run log cannot be read.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        Ok(self.store.list_runs(limit)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn context_wires_against_a_fresh_root() {
        let dir = TempDir::new().unwrap();
        let context = AppContext::new(dir.path().join("state"), dir.path().join("templates"))
            .expect("context");
        assert!(context.store().generated_dir().is_dir());
        assert!(context.list_runs(5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn validate_reports_missing_paths() {
        let dir = TempDir::new().unwrap();
        let context = AppContext::new(dir.path().join("state"), dir.path().join("templates"))
            .expect("context");
        let config = StackConfig::with_paths(
            dir.path().join("missing-pool"),
            dir.path().join("missing-appdata"),
            None,
        );
        let result = context.validate(&config).await;
        assert!(!result.ok);
        assert_eq!(result.checks["paths.pool"], "missing");
    }
}
