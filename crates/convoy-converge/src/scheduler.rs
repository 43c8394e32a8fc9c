//! Dependency-aware service scheduler.
//!
//! Holds the fixed service DAG and walks it in topological order. During
//! `ensure`, descendants of a failed service are skipped without touching
//! their APIs; `verify` deliberately visits every service so the report shows
//! the full health picture.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use convoy_clients::{Outcome, ServiceClient};
use convoy_config::constants::SERVICE_ORDER;
use convoy_config::{ServiceName, StackConfig};
use convoy_events::{StageEvent, StageStatus};
use tracing::info;

/// One scheduled service outcome, ready to be recorded as a stage event.
#[derive(Debug, Clone)]
pub struct ServiceRun {
    /// The service visited.
    pub service: ServiceName,
    /// The stage event describing what happened.
    pub event: StageEvent,
    /// Whether the client mutated live state.
    pub changed: bool,
}

/// Walks service clients in dependency order.
pub struct Scheduler {
    clients: BTreeMap<ServiceName, Arc<dyn ServiceClient>>,
}

impl Scheduler {
    /// Construct a scheduler over the given clients. Services without a
    /// client (the pipeline worker) are reported as skipped.
    #[must_use]
    pub fn new(clients: Vec<Arc<dyn ServiceClient>>) -> Self {
        let clients = clients
            .into_iter()
            .map(|client| (client.name(), client))
            .collect();
        Self { clients }
    }

    /// Run `ensure` across the fleet. Descendants of failed services are
    /// marked failed with a detail naming their blockers, without any API
    /// traffic.
    pub async fn ensure(&self, config: &StackConfig) -> Vec<ServiceRun> {
        let mut runs = Vec::new();
        let mut failed: HashSet<ServiceName> = HashSet::new();

        for service in SERVICE_ORDER {
            let stage = format!("configure.{service}");
            let settings = config.services.settings(service);
            if !settings.enabled {
                runs.push(ServiceRun {
                    service,
                    event: StageEvent::ok(stage, "skipped (disabled)"),
                    changed: false,
                });
                continue;
            }

            let blockers: Vec<&str> = service
                .dependencies()
                .iter()
                .filter(|dependency| failed.contains(dependency))
                .map(|dependency| dependency.as_str())
                .collect();
            if !blockers.is_empty() {
                failed.insert(service);
                runs.push(ServiceRun {
                    service,
                    event: StageEvent::failed(
                        stage,
                        format!("skipped (dependency failed: {})", blockers.join(", ")),
                    ),
                    changed: false,
                });
                continue;
            }

            let Some(client) = self.clients.get(&service) else {
                // The pipeline worker reconciles itself on its own loop.
                runs.push(ServiceRun {
                    service,
                    event: StageEvent::ok(stage, "skipped (no ensure required)"),
                    changed: false,
                });
                continue;
            };

            let outcome = client.ensure(config).await;
            if !outcome.success {
                failed.insert(service);
            }
            runs.push(Self::to_run(service, stage, outcome));
        }
        runs
    }

    /// Run `verify` across the fleet without skipping descendants.
    pub async fn verify(&self, config: &StackConfig) -> Vec<ServiceRun> {
        let mut runs = Vec::new();
        for service in SERVICE_ORDER {
            let stage = format!("verify.{service}");
            let settings = config.services.settings(service);
            if !settings.enabled {
                runs.push(ServiceRun {
                    service,
                    event: StageEvent::ok(stage, "skipped (disabled)"),
                    changed: false,
                });
                continue;
            }
            let Some(client) = self.clients.get(&service) else {
                runs.push(ServiceRun {
                    service,
                    event: StageEvent::ok(stage, "skipped (no verification)"),
                    changed: false,
                });
                continue;
            };
            let outcome = client.verify(config).await;
            runs.push(Self::to_run(service, stage, outcome));
        }
        runs
    }

    fn to_run(service: ServiceName, stage: String, outcome: Outcome) -> ServiceRun {
        let status = if outcome.success {
            StageStatus::Ok
        } else {
            StageStatus::Failed
        };
        info!(
            service = %service,
            status = status.as_str(),
            changed = outcome.changed,
            detail = %outcome.detail,
            "service scheduled"
        );
        ServiceRun {
            service,
            event: StageEvent::new(stage, status, Some(outcome.detail)),
            changed: outcome.changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Recording fake that scripts outcomes per service.
    struct ScriptedClient {
        name: ServiceName,
        ensure_outcome: Outcome,
        verify_outcome: Outcome,
        ensure_calls: Mutex<u32>,
        verify_calls: Mutex<u32>,
    }

    impl ScriptedClient {
        fn new(name: ServiceName, ensure_outcome: Outcome, verify_outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                name,
                ensure_outcome,
                verify_outcome,
                ensure_calls: Mutex::new(0),
                verify_calls: Mutex::new(0),
            })
        }

        fn ensure_count(&self) -> u32 {
            *self.ensure_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ServiceClient for ScriptedClient {
        fn name(&self) -> ServiceName {
            self.name
        }

        async fn ensure(&self, _config: &StackConfig) -> Outcome {
            *self.ensure_calls.lock().unwrap() += 1;
            self.ensure_outcome.clone()
        }

        async fn verify(&self, _config: &StackConfig) -> Outcome {
            *self.verify_calls.lock().unwrap() += 1;
            self.verify_outcome.clone()
        }
    }

    fn full_fleet(
        qb: &Arc<ScriptedClient>,
        radarr: &Arc<ScriptedClient>,
        sonarr: &Arc<ScriptedClient>,
        prowlarr: &Arc<ScriptedClient>,
        jellyfin: &Arc<ScriptedClient>,
        jellyseerr: &Arc<ScriptedClient>,
    ) -> Scheduler {
        Scheduler::new(vec![
            qb.clone(),
            radarr.clone(),
            sonarr.clone(),
            prowlarr.clone(),
            jellyfin.clone(),
            jellyseerr.clone(),
        ])
    }

    fn ok_client(name: ServiceName) -> Arc<ScriptedClient> {
        ScriptedClient::new(name, Outcome::ok("ok"), Outcome::ok("ok"))
    }

    fn failing_client(name: ServiceName) -> Arc<ScriptedClient> {
        ScriptedClient::new(name, Outcome::failed("boom"), Outcome::failed("boom"))
    }

    fn config() -> StackConfig {
        StackConfig::with_paths("/p".into(), "/a".into(), None)
    }

    #[tokio::test]
    async fn happy_path_visits_every_service_in_order() {
        let qb = ok_client(ServiceName::Qbittorrent);
        let radarr = ok_client(ServiceName::Radarr);
        let sonarr = ok_client(ServiceName::Sonarr);
        let prowlarr = ok_client(ServiceName::Prowlarr);
        let jellyfin = ok_client(ServiceName::Jellyfin);
        let jellyseerr = ok_client(ServiceName::Jellyseerr);
        let scheduler = full_fleet(&qb, &radarr, &sonarr, &prowlarr, &jellyfin, &jellyseerr);

        let runs = scheduler.ensure(&config()).await;
        let stages: Vec<&str> = runs.iter().map(|run| run.event.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec![
                "configure.qbittorrent",
                "configure.radarr",
                "configure.sonarr",
                "configure.prowlarr",
                "configure.jellyfin",
                "configure.jellyseerr",
                "configure.pipeline",
            ]
        );
        assert!(runs.iter().all(|run| run.event.status == StageStatus::Ok));
        assert_eq!(
            runs.last().unwrap().event.detail.as_deref(),
            Some("skipped (no ensure required)")
        );
    }

    #[tokio::test]
    async fn failure_blocks_descendants_without_api_calls() {
        let qb = failing_client(ServiceName::Qbittorrent);
        let radarr = ok_client(ServiceName::Radarr);
        let sonarr = ok_client(ServiceName::Sonarr);
        let prowlarr = ok_client(ServiceName::Prowlarr);
        let jellyfin = ok_client(ServiceName::Jellyfin);
        let jellyseerr = ok_client(ServiceName::Jellyseerr);
        let scheduler = full_fleet(&qb, &radarr, &sonarr, &prowlarr, &jellyfin, &jellyseerr);

        let runs = scheduler.ensure(&config()).await;
        let by_stage: BTreeMap<&str, &ServiceRun> = runs
            .iter()
            .map(|run| (run.event.stage.as_str(), run))
            .collect();

        assert_eq!(
            by_stage["configure.qbittorrent"].event.status,
            StageStatus::Failed
        );
        assert_eq!(
            by_stage["configure.radarr"].event.detail.as_deref(),
            Some("skipped (dependency failed: qbittorrent)")
        );
        assert_eq!(
            by_stage["configure.prowlarr"].event.detail.as_deref(),
            Some("skipped (dependency failed: radarr, sonarr)")
        );
        // Jellyfin has no dependencies and still runs.
        assert_eq!(
            by_stage["configure.jellyfin"].event.status,
            StageStatus::Ok
        );
        assert_eq!(
            by_stage["configure.jellyseerr"].event.detail.as_deref(),
            Some("skipped (dependency failed: radarr, sonarr)")
        );

        assert_eq!(radarr.ensure_count(), 0, "blocked services stay untouched");
        assert_eq!(prowlarr.ensure_count(), 0);
        assert_eq!(jellyfin.ensure_count(), 1);
    }

    #[tokio::test]
    async fn disabled_services_do_not_block_dependents() {
        let qb = ok_client(ServiceName::Qbittorrent);
        let radarr = ok_client(ServiceName::Radarr);
        let sonarr = ok_client(ServiceName::Sonarr);
        let prowlarr = ok_client(ServiceName::Prowlarr);
        let jellyfin = ok_client(ServiceName::Jellyfin);
        let jellyseerr = ok_client(ServiceName::Jellyseerr);
        let scheduler = full_fleet(&qb, &radarr, &sonarr, &prowlarr, &jellyfin, &jellyseerr);

        let mut cfg = config();
        cfg.services.radarr.enabled = false;

        let runs = scheduler.ensure(&cfg).await;
        let radarr_run = runs
            .iter()
            .find(|run| run.service == ServiceName::Radarr)
            .unwrap();
        assert_eq!(radarr_run.event.status, StageStatus::Ok);
        assert_eq!(
            radarr_run.event.detail.as_deref(),
            Some("skipped (disabled)")
        );
        // Prowlarr depends on radarr, but a disabled dependency is not a
        // failed one.
        let prowlarr_run = runs
            .iter()
            .find(|run| run.service == ServiceName::Prowlarr)
            .unwrap();
        assert_eq!(prowlarr_run.event.status, StageStatus::Ok);
        assert_eq!(prowlarr.ensure_count(), 1);
    }

    #[tokio::test]
    async fn verify_never_skips_descendants_of_failures() {
        let qb = failing_client(ServiceName::Qbittorrent);
        let radarr = ok_client(ServiceName::Radarr);
        let sonarr = ok_client(ServiceName::Sonarr);
        let prowlarr = ok_client(ServiceName::Prowlarr);
        let jellyfin = ok_client(ServiceName::Jellyfin);
        let jellyseerr = ok_client(ServiceName::Jellyseerr);
        let scheduler = full_fleet(&qb, &radarr, &sonarr, &prowlarr, &jellyfin, &jellyseerr);

        let runs = scheduler.verify(&config()).await;
        assert_eq!(runs.len(), SERVICE_ORDER.len());
        let failures: Vec<&ServiceRun> = runs
            .iter()
            .filter(|run| run.event.status == StageStatus::Failed)
            .collect();
        assert_eq!(failures.len(), 1, "only the genuinely failing service");
        assert_eq!(*radarr.verify_calls.lock().unwrap(), 1);
        assert_eq!(*jellyseerr.verify_calls.lock().unwrap(), 1);
    }
}
