//! Compose CLI driver.
//!
//! Wraps `docker compose` for bringing the stack up or down. The driver runs
//! in the directory of the generated compose file and pins
//! `COMPOSE_PROJECT_NAME` so repeated applies address the same project.

use std::path::{Path, PathBuf};
use std::time::Duration;

use convoy_config::ServiceName;
use tracing::{info, warn};

use crate::docker::DockerCli;
use crate::error::ComposeResult;
use crate::proc::CommandRunner;

/// Project name under which the stack's containers are grouped.
pub const COMPOSE_PROJECT: &str = "convoy";

/// Deadline for compose operations; image pulls can be slow.
const COMPOSE_TIMEOUT: Duration = Duration::from_secs(600);

/// Result of a compose invocation.
#[derive(Debug, Clone)]
pub struct DriverOutcome {
    /// Whether compose exited zero.
    pub ok: bool,
    /// Stdout on success, stderr on failure; never empty.
    pub detail: String,
}

/// Wrapper around the compose CLI for one generated bundle.
#[derive(Debug, Clone)]
pub struct ComposeDriver {
    compose_path: PathBuf,
    project_name: String,
    runner: CommandRunner,
}

impl ComposeDriver {
    /// Construct a driver for the generated compose file.
    #[must_use]
    pub fn new(compose_path: impl Into<PathBuf>) -> Self {
        Self {
            compose_path: compose_path.into(),
            project_name: COMPOSE_PROJECT.to_string(),
            runner: CommandRunner::new(COMPOSE_TIMEOUT),
        }
    }

    /// Override the compose project name.
    #[must_use]
    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = name.into();
        self
    }

    /// Run `docker compose up -d --remove-orphans`.
    ///
    /// # Errors
    ///
    /// Returns an error when the CLI cannot be spawned or times out; a
    /// nonzero exit is reported through [`DriverOutcome::ok`].
    pub async fn up(&self) -> ComposeResult<DriverOutcome> {
        self.invoke(&["up", "-d", "--remove-orphans"]).await
    }

    /// Run `docker compose down`.
    ///
    /// # Errors
    ///
    /// Same contract as [`ComposeDriver::up`].
    pub async fn down(&self) -> ComposeResult<DriverOutcome> {
        self.invoke(&["down"]).await
    }

    /// Stop development containers that would collide with the stack's port
    /// bindings. Containers named `<service>-dev` are assumed to be local
    /// development instances of a managed service.
    ///
    /// Best effort: failures to stop are logged and skipped.
    pub async fn stop_conflicting_dev_services(&self, enabled: &[ServiceName]) -> Vec<String> {
        let docker = DockerCli::new(CommandRunner::default());
        let running = docker.running_container_names().await;
        let mut stopped = Vec::new();

        for service in enabled {
            let dev_name = format!("{service}-dev");
            if !running.iter().any(|name| *name == dev_name) {
                continue;
            }
            match docker.stop(&dev_name).await {
                Ok(()) => {
                    info!(container = %dev_name, "stopped conflicting dev container");
                    stopped.push(dev_name);
                }
                Err(err) => {
                    warn!(container = %dev_name, error = %err, "failed to stop dev container");
                }
            }
        }
        stopped
    }

    fn workdir(&self) -> &Path {
        self.compose_path.parent().unwrap_or_else(|| Path::new("."))
    }

    async fn invoke(&self, action: &[&str]) -> ComposeResult<DriverOutcome> {
        let compose_file = self.compose_path.display().to_string();
        let mut args = vec![
            "compose",
            "-f",
            compose_file.as_str(),
            "--project-name",
            self.project_name.as_str(),
        ];
        args.extend_from_slice(action);

        let output = self
            .runner
            .run_with(
                "docker",
                &args,
                Some(self.workdir()),
                &[("COMPOSE_PROJECT_NAME", self.project_name.as_str())],
            )
            .await?;

        let ok = output.success();
        let mut detail = if ok {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        if detail.is_empty() {
            detail = if ok { "ok" } else { "failed" }.to_string();
        }
        Ok(DriverOutcome { ok, detail })
    }
}
