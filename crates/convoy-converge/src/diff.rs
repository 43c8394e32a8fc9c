//! Config diff engine.
//!
//! Compares two stack configurations and produces the exact leaf-level
//! changes plus the services each change touches, split into those needing a
//! container restart and those needing only an API-level reconfigure. The
//! impact mapping is table-driven with longest-prefix matching over config
//! paths, so `services.radarr.port` wins over `services.radarr` wins over
//! `services`.

use std::collections::{BTreeMap, BTreeSet};

use convoy_config::{ServiceName, StackConfig};
use serde_json::Value;

use convoy_config::ServiceName::{
    Jellyfin, Jellyseerr, Pipeline, Prowlarr, Qbittorrent, Radarr, Sonarr,
};

/// A single field-level configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    /// Dot-separated path, e.g. `services.radarr.port`.
    pub path: String,
    /// Previous value; `None` when the field was added.
    pub old_value: Option<Value>,
    /// New value; `None` when the field was removed.
    pub new_value: Option<Value>,
    /// Services impacted by this change.
    pub affected_services: Vec<ServiceName>,
}

/// Result of comparing two configurations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    /// Ordered leaf changes.
    pub changes: Vec<ConfigChange>,
    /// Services whose containers must be recreated.
    pub services_to_restart: BTreeSet<ServiceName>,
    /// Services needing only an API-level re-ensure.
    pub services_to_reconfigure: BTreeSet<ServiceName>,
}

impl ConfigDiff {
    /// Whether any leaf value differs.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Human-readable change summary.
    #[must_use]
    pub fn summary_lines(&self) -> Vec<String> {
        if !self.has_changes() {
            return vec!["No changes detected".to_string()];
        }
        let mut lines: Vec<String> = self
            .changes
            .iter()
            .map(|change| {
                format!(
                    "{}: {} -> {}",
                    change.path,
                    format_value(change.old_value.as_ref()),
                    format_value(change.new_value.as_ref())
                )
            })
            .collect();
        if !self.services_to_restart.is_empty() {
            lines.push(format!(
                "Services to restart: {}",
                join_services(&self.services_to_restart)
            ));
        }
        if !self.services_to_reconfigure.is_empty() {
            lines.push(format!(
                "Services to reconfigure: {}",
                join_services(&self.services_to_reconfigure)
            ));
        }
        lines
    }
}

const ALL_SERVICES: &[ServiceName] = &[
    Qbittorrent,
    Radarr,
    Sonarr,
    Prowlarr,
    Jellyfin,
    Jellyseerr,
    Pipeline,
];
const MANAGED_CONTAINERS: &[ServiceName] =
    &[Qbittorrent, Radarr, Sonarr, Prowlarr, Jellyfin, Jellyseerr];

/// `(prefix, restart, reconfigure)` impact rules.
type ImpactRule = (
    &'static str,
    &'static [ServiceName],
    &'static [ServiceName],
);

const CHANGE_IMPACT: &[ImpactRule] = &[
    // Path roots move Docker volume mounts.
    ("paths.pool", ALL_SERVICES, &[]),
    ("paths.scratch", &[Qbittorrent, Pipeline], &[]),
    ("paths.appdata", MANAGED_CONTAINERS, &[]),
    // Port changes restart the owner and reconfigure consumers.
    ("services.qbittorrent.port", &[Qbittorrent], &[Radarr, Sonarr]),
    ("services.radarr.port", &[Radarr], &[Prowlarr, Jellyseerr]),
    ("services.sonarr.port", &[Sonarr], &[Prowlarr, Jellyseerr]),
    ("services.prowlarr.port", &[Prowlarr], &[]),
    ("services.jellyfin.port", &[Jellyfin], &[Jellyseerr]),
    ("services.jellyseerr.port", &[Jellyseerr], &[]),
    // Enable flags restart the owner and reconfigure dependents.
    (
        "services.qbittorrent.enabled",
        &[Qbittorrent],
        &[Radarr, Sonarr],
    ),
    ("services.radarr.enabled", &[Radarr], &[Prowlarr, Jellyseerr]),
    ("services.sonarr.enabled", &[Sonarr], &[Prowlarr, Jellyseerr]),
    ("services.prowlarr.enabled", &[Prowlarr], &[]),
    ("services.jellyfin.enabled", &[Jellyfin], &[Jellyseerr]),
    ("services.jellyseerr.enabled", &[Jellyseerr], &[]),
    ("services.pipeline.enabled", &[Pipeline], &[]),
    // Torrent client specifics reconfigure in place.
    ("services.qbittorrent.username", &[], &[Qbittorrent]),
    ("services.qbittorrent.password", &[], &[Qbittorrent]),
    ("services.qbittorrent.stop_after_download", &[], &[Qbittorrent]),
    // Indexer aggregator specifics.
    ("services.prowlarr.language_filter", &[], &[Prowlarr]),
    // Proxy URL changes relabel the container.
    ("services.qbittorrent.proxy_url", &[Qbittorrent], &[]),
    ("services.radarr.proxy_url", &[Radarr], &[]),
    ("services.sonarr.proxy_url", &[Sonarr], &[]),
    ("services.prowlarr.proxy_url", &[Prowlarr], &[]),
    ("services.jellyfin.proxy_url", &[Jellyfin], &[]),
    ("services.jellyseerr.proxy_url", &[Jellyseerr], &[]),
    // Policies reconfigure the affected services only.
    ("download_policy", &[], &[Qbittorrent, Radarr, Sonarr]),
    ("media_policy", &[], &[Pipeline]),
    ("quality", &[], &[Radarr, Sonarr]),
    // Proxy and runtime identity touch every container.
    ("proxy", ALL_SERVICES, &[]),
    ("runtime", ALL_SERVICES, &[]),
    // The UI port only concerns the orchestrator itself.
    ("ui.port", &[], &[]),
];

/// Compare two configurations and return the structured diff.
///
/// Restart dominates reconfigure: a service scheduled for restart is removed
/// from the reconfigure set, since a restart implies a full re-ensure cycle.
#[must_use]
pub fn compute_diff(old: &StackConfig, new: &StackConfig) -> ConfigDiff {
    let old_leaves = flatten(&serde_json::to_value(old).unwrap_or(Value::Null));
    let new_leaves = flatten(&serde_json::to_value(new).unwrap_or(Value::Null));

    let mut all_paths: BTreeSet<&String> = old_leaves.keys().collect();
    all_paths.extend(new_leaves.keys());

    let mut changes = Vec::new();
    let mut restart = BTreeSet::new();
    let mut reconfigure = BTreeSet::new();

    for path in all_paths {
        let old_value = old_leaves.get(path);
        let new_value = new_leaves.get(path);
        if old_value == new_value {
            continue;
        }

        let (restart_services, reconfigure_services) = resolve_impact(path);
        let mut affected: BTreeSet<ServiceName> = restart_services.iter().copied().collect();
        affected.extend(reconfigure_services.iter().copied());

        changes.push(ConfigChange {
            path: path.clone(),
            old_value: old_value.cloned(),
            new_value: new_value.cloned(),
            affected_services: affected.into_iter().collect(),
        });
        restart.extend(restart_services.iter().copied());
        reconfigure.extend(reconfigure_services.iter().copied());
    }

    for service in &restart {
        reconfigure.remove(service);
    }

    ConfigDiff {
        changes,
        services_to_restart: restart,
        services_to_reconfigure: reconfigure,
    }
}

/// Flatten a JSON tree into dot-path leaves. Arrays are treated as atomic
/// values so reordering does not produce element-by-element noise.
fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut result = BTreeMap::new();
    flatten_into(value, String::new(), &mut result);
    result
}

fn flatten_into(value: &Value, prefix: String, result: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(child, path, result);
            }
        }
        other => {
            result.insert(prefix, other.clone());
        }
    }
}

/// Longest-prefix lookup over the impact table.
fn resolve_impact(path: &str) -> (&'static [ServiceName], &'static [ServiceName]) {
    let parts: Vec<&str> = path.split('.').collect();
    for take in (1..=parts.len()).rev() {
        let candidate = parts[..take].join(".");
        if let Some((_, restart, reconfigure)) = CHANGE_IMPACT
            .iter()
            .find(|(prefix, _, _)| *prefix == candidate)
        {
            return (restart, reconfigure);
        }
    }
    (&[], &[])
}

fn format_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(Value::String(text)) => format!("\"{text}\""),
        Some(Value::Array(items)) => {
            if items.is_empty() {
                "[]".to_string()
            } else if items.len() <= 3 {
                let rendered: Vec<String> =
                    items.iter().map(|item| format_value(Some(item))).collect();
                format!("[{}]", rendered.join(", "))
            } else {
                format!("[{} items]", items.len())
            }
        }
        Some(other) => other.to_string(),
    }
}

fn join_services(services: &BTreeSet<ServiceName>) -> String {
    services
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> StackConfig {
        StackConfig::with_paths("/mnt/pool".into(), "/mnt/appdata".into(), None)
    }

    #[test]
    fn identical_configs_produce_empty_diff() {
        let config = base_config();
        let diff = compute_diff(&config, &config);
        assert!(!diff.has_changes());
        assert!(diff.services_to_restart.is_empty());
        assert!(diff.services_to_reconfigure.is_empty());
        assert_eq!(diff.summary_lines(), vec!["No changes detected"]);
    }

    #[test]
    fn port_change_restarts_owner_and_reconfigures_consumers() {
        let old = base_config();
        let mut new = base_config();
        new.services.qbittorrent.port = 8090;

        let diff = compute_diff(&old, &new);
        assert_eq!(diff.changes.len(), 1);
        let change = &diff.changes[0];
        assert_eq!(change.path, "services.qbittorrent.port");
        assert_eq!(change.old_value, Some(Value::from(8080)));
        assert_eq!(change.new_value, Some(Value::from(8090)));

        assert_eq!(
            diff.services_to_restart,
            BTreeSet::from([Qbittorrent]),
        );
        assert_eq!(
            diff.services_to_reconfigure,
            BTreeSet::from([Radarr, Sonarr]),
        );
    }

    #[test]
    fn restart_dominates_reconfigure() {
        let old = base_config();
        let mut new = base_config();
        // Restart radarr via its port; its password change would otherwise
        // put qbittorrent in reconfigure, while the pool path restarts all.
        new.paths.pool = "/mnt/bigger".into();
        new.services.qbittorrent.password = "different".to_string();

        let diff = compute_diff(&old, &new);
        assert!(diff.services_to_restart.contains(&Qbittorrent));
        assert!(
            !diff.services_to_reconfigure.contains(&Qbittorrent),
            "restart implies re-ensure; no separate reconfigure entry"
        );
    }

    #[test]
    fn media_policy_changes_touch_only_the_pipeline() {
        let old = base_config();
        let mut new = base_config();
        new.media_policy.movies.keep_audio = vec!["eng".to_string()];

        let diff = compute_diff(&old, &new);
        assert!(diff.services_to_restart.is_empty());
        assert_eq!(
            diff.services_to_reconfigure,
            BTreeSet::from([Pipeline]),
        );
    }

    #[test]
    fn longest_prefix_wins_over_parent_rules() {
        let (restart, reconfigure) = resolve_impact("services.sonarr.port");
        assert_eq!(restart, &[Sonarr]);
        assert_eq!(reconfigure, &[Prowlarr, Jellyseerr]);

        // An unmapped sibling resolves to nothing rather than a parent rule.
        let (restart, reconfigure) = resolve_impact("services.sonarr.unknown_field");
        assert!(restart.is_empty());
        assert!(reconfigure.is_empty());
    }

    #[test]
    fn lists_render_compactly_in_summaries() {
        let old = base_config();
        let mut new = base_config();
        new.media_policy.movies.keep_audio =
            vec!["eng".to_string(), "jpn".to_string()];
        let diff = compute_diff(&old, &new);
        let summary = diff.summary_lines().join("\n");
        assert!(summary.contains("media_policy.movies.keep_audio"));
        assert!(summary.contains("[\"eng\", \"jpn\"]"), "{summary}");
    }

    #[test]
    fn ui_port_changes_affect_no_services() {
        let old = base_config();
        let mut new = base_config();
        new.ui.port = 9443;
        let diff = compute_diff(&old, &new);
        assert_eq!(diff.changes.len(), 1);
        assert!(diff.services_to_restart.is_empty());
        assert!(diff.services_to_reconfigure.is_empty());
    }
}
