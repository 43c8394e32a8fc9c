//! Preflight checks against the live host.
//!
//! Unlike the document invariants in `convoy-config`, these checks touch the
//! machine: paths must exist and be writable, enabled ports must be free (or
//! provably owned by the stack's own containers), and the container CLI must
//! be on PATH.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

use convoy_compose::DockerCli;
use convoy_config::constants::SERVICE_ORDER;
use convoy_config::{PathMap, ServiceName, StackConfig};

/// Probe timeout for local port checks.
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Outcome of the preflight sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// Whether every check passed.
    pub ok: bool,
    /// Per-check status strings keyed by check name.
    pub checks: BTreeMap<String, String>,
}

impl ValidationResult {
    /// `check=status` summary in key order.
    #[must_use]
    pub fn summary(&self) -> String {
        self.checks
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Validate that required paths and ports are usable.
pub async fn run_validation(
    config: &StackConfig,
    docker: &DockerCli,
    paths: &PathMap,
) -> ValidationResult {
    let mut checks: BTreeMap<String, String> = BTreeMap::new();
    let mut ok = true;

    let pool = paths.translate(&config.paths.pool);
    let appdata = paths.translate(&config.paths.appdata);
    let scratch = config
        .paths
        .scratch
        .as_deref()
        .map(|scratch| paths.translate(scratch));

    for (label, path, optional) in [
        ("paths.pool", Some(pool.as_path()), false),
        ("paths.scratch", scratch.as_deref(), true),
        ("paths.appdata", Some(appdata.as_path()), false),
    ] {
        let status = match path {
            None => {
                if optional {
                    "not_configured"
                } else {
                    ok = false;
                    "missing"
                }
            }
            Some(path) if !path.exists() => {
                ok = false;
                "missing"
            }
            Some(path) if !path.is_dir() => {
                ok = false;
                "not_directory"
            }
            Some(path) if !is_writable(path) => {
                ok = false;
                "not_writable"
            }
            Some(_) => "ok",
        };
        checks.insert(label.to_string(), status.to_string());
    }

    let ui_status = if port_available(config.ui.port) {
        "ok"
    } else {
        ok = false;
        "in_use"
    };
    checks.insert("ui.port".to_string(), ui_status.to_string());

    for service in SERVICE_ORDER {
        let settings = config.services.settings(service);
        let key = format!("services.{service}.port");
        if !settings.enabled {
            checks.insert(key, "skipped".to_string());
            continue;
        }
        let Some(port) = settings.port else {
            // The pipeline worker runs portless by design.
            let status = if service == ServiceName::Pipeline {
                "optional"
            } else {
                ok = false;
                "not_set"
            };
            checks.insert(key, status.to_string());
            continue;
        };
        if port_available(port) {
            checks.insert(key, "ok".to_string());
            continue;
        }
        let owned = match service.container_name() {
            Some(container) => docker.published_ports(container).await.contains(&port),
            None => false,
        };
        if owned {
            checks.insert(key, "in_use_by_stack".to_string());
        } else {
            ok = false;
            checks.insert(key, "in_use".to_string());
        }
    }

    let docker_status = if binary_on_path("docker") {
        "present"
    } else {
        "missing"
    };
    checks.insert("docker.cli".to_string(), docker_status.to_string());

    ValidationResult { ok, checks }
}

/// Writable means this process can create entries inside the directory; a
/// probe file is the only reliable answer across filesystems.
fn is_writable(path: &Path) -> bool {
    let probe = path.join(format!(".convoy-writecheck-{}", std::process::id()));
    match std::fs::File::create(&probe) {
        Ok(file) => {
            drop(file);
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// A port is available when nothing accepts a local connection on it.
fn port_available(port: u16) -> bool {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_err()
}

fn binary_on_path(name: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(name).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> StackConfig {
        let config = StackConfig::with_paths(
            dir.path().join("pool"),
            dir.path().join("appdata"),
            None,
        );
        std::fs::create_dir_all(&config.paths.pool).unwrap();
        std::fs::create_dir_all(&config.paths.appdata).unwrap();
        config
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn healthy_config_passes() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        // Steer every port clear of anything listening on this host.
        config.ui.port = free_port();
        config.services.qbittorrent.port = free_port();
        config.services.radarr.port = free_port();
        config.services.sonarr.port = free_port();
        config.services.prowlarr.port = free_port();
        config.services.jellyseerr.port = free_port();
        config.services.jellyfin.port = free_port();

        let result = run_validation(&config, &DockerCli::default(), &PathMap::default()).await;
        assert_eq!(result.checks["paths.pool"], "ok");
        assert_eq!(result.checks["paths.scratch"], "not_configured");
        assert_eq!(result.checks["services.pipeline.port"], "optional");
        // Overall verdict also depends on the docker CLI presence check.
        assert_eq!(result.checks["services.sonarr.port"], "ok");
    }

    #[tokio::test]
    async fn missing_pool_fails() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.paths.pool = dir.path().join("nonexistent");

        let result = run_validation(&config, &DockerCli::default(), &PathMap::default()).await;
        assert!(!result.ok);
        assert_eq!(result.checks["paths.pool"], "missing");
        assert!(result.summary().contains("paths.pool=missing"));
    }

    #[tokio::test]
    async fn occupied_port_is_reported_in_use() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        config.services.sonarr.port = listener.local_addr().unwrap().port();

        let result = run_validation(&config, &DockerCli::default(), &PathMap::default()).await;
        assert!(!result.ok);
        assert_eq!(result.checks["services.sonarr.port"], "in_use");
    }

    #[tokio::test]
    async fn disabled_services_skip_port_checks() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        config.services.sonarr.port = listener.local_addr().unwrap().port();
        config.services.sonarr.enabled = false;

        let result = run_validation(&config, &DockerCli::default(), &PathMap::default()).await;
        assert_eq!(result.checks["services.sonarr.port"], "skipped");
    }
}
