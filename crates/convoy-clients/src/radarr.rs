//! Movie library manager reconciliation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use convoy_config::constants::MEDIA_MOVIES;
use convoy_config::{PathMap, ServiceName, StackConfig};
use convoy_store::{ConfigStore, Section, ServicesSection};

use crate::arr::{
    describe_changes, ensure_download_client, ensure_host_settings, field_map, read_arr_api_key,
    select_quality_profile_id, wait_for_arr_config, ArrApi, CONFIG_WAIT_TIMEOUT,
};
use crate::error::{ClientError, ClientResult};
use crate::http::{wait_for_http_ready, READY_INTERVAL, READY_TIMEOUT};
use crate::{Outcome, ServiceClient};

const SERVICE: &str = "radarr";
const UI_USERNAME: &str = "radarr-admin";

/// Reconciliation client for the movie library manager.
pub struct RadarrClient {
    store: Arc<ConfigStore>,
    paths: PathMap,
    base_url: String,
}

impl RadarrClient {
    /// Construct the client against the store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> Self {
        let port = ServiceName::Radarr.internal_port().unwrap_or(7878);
        Self {
            store,
            paths: PathMap::default(),
            base_url: format!("http://radarr:{port}/api/v3"),
        }
    }

    /// Apply a host-to-container path map for mounted-file access.
    #[must_use]
    pub fn with_paths(mut self, paths: PathMap) -> Self {
        self.paths = paths;
        self
    }

    /// Override the API base URL (tests target a mock server).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn run_ensure(&self, config: &StackConfig) -> ClientResult<Outcome> {
        let mut detail_messages: Vec<String> = Vec::new();
        let mut changed = false;

        let config_dir = self
            .paths
            .translate(&config.paths.appdata)
            .join(SERVICE);
        std::fs::create_dir_all(&config_dir)
            .map_err(|source| ClientError::io("radarr.config_dir", &config_dir, source))?;

        let mut api_key = match self.store.get_secret(SERVICE, "api_key")? {
            Some(key) => key,
            None => {
                if !wait_for_arr_config(&config_dir, CONFIG_WAIT_TIMEOUT).await {
                    return Ok(Outcome::failed(format!(
                        "config.xml did not appear at {}",
                        config_dir.display()
                    )));
                }
                let Some(key) = read_arr_api_key(&config_dir) else {
                    return Ok(Outcome::failed(format!(
                        "Radarr API key missing in config.xml at {}",
                        config_dir.display()
                    )));
                };
                self.store.set_secret(SERVICE, "api_key", &key)?;
                detail_messages.push("stored API key".to_string());
                key
            }
        };

        let ui_username = self
            .store
            .ensure_secret(SERVICE, "ui_username", || UI_USERNAME.to_string())?;
        let ui_password = self
            .store
            .ensure_secret(SERVICE, "ui_password", || ConfigStore::generate_token(16))?;

        let status_url = format!("{}/system/status", self.base_url);
        let (ready, ready_detail) =
            wait_for_http_ready(&status_url, READY_TIMEOUT, READY_INTERVAL).await;
        if !ready {
            return Ok(Outcome::failed(format!("Radarr not ready ({ready_detail})")));
        }

        let result = self
            .provision(config, &api_key, &ui_username, &ui_password, &mut detail_messages)
            .await;
        let provision_changed = match result {
            Ok(provision_changed) => provision_changed,
            Err(err) if err.is_auth_status() => {
                // The stored key may be stale after a container reset; pick up
                // the key the service currently holds and retry once.
                let refreshed = read_arr_api_key(&config_dir);
                match refreshed {
                    Some(fresh) if fresh != api_key => {
                        self.store.set_secret(SERVICE, "api_key", &fresh)?;
                        detail_messages.push("reloaded API key after auth failure".to_string());
                        api_key = fresh;
                        self.provision(
                            config,
                            &api_key,
                            &ui_username,
                            &ui_password,
                            &mut detail_messages,
                        )
                        .await?
                    }
                    _ => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };
        changed = changed || provision_changed;

        let detail = if detail_messages.is_empty() {
            "ok".to_string()
        } else {
            detail_messages.join("; ")
        };
        Ok(if changed {
            Outcome::changed(detail)
        } else {
            Outcome::ok(detail)
        })
    }

    async fn provision(
        &self,
        config: &StackConfig,
        api_key: &str,
        ui_username: &str,
        ui_password: &str,
        detail_messages: &mut Vec<String>,
    ) -> ClientResult<bool> {
        let api = ArrApi::new(SERVICE, &self.base_url, api_key)?;
        let mut changed = false;

        let status = api.get_json("/system/status").await?;
        let version = status.get("version").and_then(Value::as_str);
        detail_messages.push(version.map_or_else(|| "online".to_string(), |v| format!("online (v{v})")));

        let db_path = self
            .paths
            .translate(&config.paths.appdata)
            .join(SERVICE)
            .join("radarr.db");
        if ensure_host_settings(&api, &db_path, ui_username, ui_password).await? {
            detail_messages.push("ui credentials synced".to_string());
            changed = true;
        }

        let qb_username = self
            .store
            .get_secret("qbittorrent", "username")?
            .unwrap_or_else(|| config.services.qbittorrent.username.clone());
        let qb_password = self
            .store
            .get_secret("qbittorrent", "password")?
            .unwrap_or_else(|| config.services.qbittorrent.password.clone());

        let mut services: ServicesSection = self.store.load_section(Section::Services)?;
        let previous_password = services
            .get(SERVICE)
            .and_then(|state| state.download_client_password.clone());

        let (rf_changed, rf_message, folder_id) = self.ensure_root_folder(&api, config).await?;
        let (dl_changed, dl_message, client_id) = ensure_download_client(
            &api,
            &config.download_policy.categories.radarr,
            &qb_username,
            &qb_password,
            previous_password.as_deref(),
        )
        .await?;
        let (changed_any, aggregated) =
            describe_changes(&[(rf_changed, rf_message), (dl_changed, dl_message)]);
        if !aggregated.is_empty() {
            detail_messages.push(aggregated);
        }
        changed = changed || changed_any;

        let mut state_dirty = false;
        let entry = services.entry(SERVICE);
        if folder_id.is_some() && entry.root_folder_id != folder_id {
            entry.root_folder_id = folder_id;
            state_dirty = true;
        }
        if client_id.is_some() && entry.download_client_id != client_id {
            entry.download_client_id = client_id;
            state_dirty = true;
        }
        if entry.download_client_username.as_deref() != Some(qb_username.as_str()) {
            entry.download_client_username = Some(qb_username);
            state_dirty = true;
        }
        if entry.download_client_password.as_deref() != Some(qb_password.as_str()) {
            entry.download_client_password = Some(qb_password);
            state_dirty = true;
        }
        if state_dirty {
            self.store.save_section(Section::Services, &services)?;
        }

        Ok(changed)
    }

    async fn ensure_root_folder(
        &self,
        api: &ArrApi,
        config: &StackConfig,
    ) -> ClientResult<(bool, String, Option<i64>)> {
        let existing = api.get_json("/rootfolder").await?;
        for entry in existing.as_array().into_iter().flatten() {
            if entry.get("path").and_then(Value::as_str) == Some(MEDIA_MOVIES) {
                return Ok((
                    false,
                    format!("root folder ready {MEDIA_MOVIES}"),
                    entry.get("id").and_then(Value::as_i64),
                ));
            }
        }

        let profiles = api.get_json("/qualityprofile").await?;
        let profiles = profiles.as_array().cloned().unwrap_or_default();
        let quality_id = select_quality_profile_id(&profiles, &config.quality);
        let metadata_id = match api.get_json("/metadataprofile").await {
            Ok(meta) => meta
                .as_array()
                .and_then(|entries| entries.first())
                .and_then(|entry| entry.get("id"))
                .and_then(Value::as_i64)
                .unwrap_or(1),
            Err(err) => {
                debug!(error = %err, "metadata profiles unavailable; defaulting");
                1
            }
        };

        let payload = json!({
            "path": MEDIA_MOVIES,
            "name": "movies",
            "defaultQualityProfileId": quality_id,
            "defaultMetadataProfileId": metadata_id,
            "defaultTags": [],
        });
        let created = api.post_json("/rootfolder", &payload).await?;
        Ok((
            true,
            format!("root folder created {MEDIA_MOVIES}"),
            created.get("id").and_then(Value::as_i64),
        ))
    }

    async fn run_verify(&self, config: &StackConfig) -> ClientResult<Outcome> {
        let Some(api_key) = self.store.get_secret(SERVICE, "api_key")? else {
            return Ok(Outcome::failed("missing api key"));
        };
        let api = ArrApi::new(SERVICE, &self.base_url, &api_key)?;

        let qb_username = self
            .store
            .get_secret("qbittorrent", "username")?
            .unwrap_or_else(|| config.services.qbittorrent.username.clone());
        let qb_port = ServiceName::Qbittorrent.internal_port().unwrap_or(8080);
        let category = &config.download_policy.categories.radarr;

        let clients = api.get_json("/downloadclient").await?;
        for client in clients.as_array().into_iter().flatten() {
            let implementation = client
                .get("implementation")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !implementation.eq_ignore_ascii_case("qbittorrent") {
                continue;
            }
            let current = field_map(client.get("fields"));
            let mut mismatches = Vec::new();
            if current.get("host").and_then(Value::as_str) != Some("qbittorrent") {
                mismatches.push("host");
            }
            if current.get("port").and_then(Value::as_i64) != Some(i64::from(qb_port)) {
                mismatches.push("port");
            }
            if current.get("category").and_then(Value::as_str) != Some(category.as_str()) {
                mismatches.push("category");
            }
            if current.get("username").and_then(Value::as_str) != Some(qb_username.as_str()) {
                mismatches.push("username");
            }
            if !mismatches.is_empty() {
                return Ok(Outcome::failed(format!(
                    "download client mismatch: {}",
                    mismatches.join(", ")
                )));
            }

            let folders = api.get_json("/rootfolder").await?;
            let folder_present = folders
                .as_array()
                .into_iter()
                .flatten()
                .any(|entry| entry.get("path").and_then(Value::as_str) == Some(MEDIA_MOVIES));
            if !folder_present {
                return Ok(Outcome::failed(format!("root folder missing {MEDIA_MOVIES}")));
            }
            return Ok(Outcome::ok("download client and root folder ok"));
        }

        Ok(Outcome::failed("download client missing (qbittorrent)"))
    }
}

#[async_trait]
impl ServiceClient for RadarrClient {
    fn name(&self) -> ServiceName {
        ServiceName::Radarr
    }

    async fn ensure(&self, config: &StackConfig) -> Outcome {
        match self.run_ensure(config).await {
            Ok(outcome) => outcome,
            Err(err) => Outcome::failed(err.to_string()),
        }
    }

    async fn verify(&self, config: &StackConfig) -> Outcome {
        match self.run_verify(config).await {
            Ok(outcome) => outcome,
            Err(err) => Outcome::failed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> Arc<ConfigStore> {
        Arc::new(ConfigStore::open(dir.path().join("state")).unwrap())
    }

    fn test_config(dir: &TempDir) -> StackConfig {
        StackConfig::with_paths(
            dir.path().join("pool"),
            dir.path().join("appdata"),
            None,
        )
    }

    #[tokio::test]
    async fn verify_reports_missing_api_key() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let client = RadarrClient::new(store).with_base_url("http://127.0.0.1:1/api/v3");
        let outcome = client.verify(&test_config(&dir)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.detail, "missing api key");
    }

    #[tokio::test]
    async fn verify_passes_against_converged_service() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.set_secret(SERVICE, "api_key", "k").unwrap();
        store.set_secret("qbittorrent", "username", "admin").unwrap();

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/downloadclient");
            then.status(200).json_body(serde_json::json!([
                {
                    "id": 1,
                    "implementation": "QBittorrent",
                    "fields": [
                        {"name": "host", "value": "qbittorrent"},
                        {"name": "port", "value": 8080},
                        {"name": "category", "value": "movies"},
                        {"name": "username", "value": "admin"}
                    ]
                }
            ]));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/rootfolder");
            then.status(200)
                .json_body(serde_json::json!([{"id": 4, "path": "/data/media/movies"}]));
        });

        let client = RadarrClient::new(store).with_base_url(server.url("/api/v3"));
        let outcome = client.verify(&test_config(&dir)).await;
        assert!(outcome.success, "{}", outcome.detail);
    }

    #[tokio::test]
    async fn verify_flags_category_drift() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.set_secret(SERVICE, "api_key", "k").unwrap();

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/downloadclient");
            then.status(200).json_body(serde_json::json!([
                {
                    "id": 1,
                    "implementation": "QBittorrent",
                    "fields": [
                        {"name": "host", "value": "qbittorrent"},
                        {"name": "port", "value": 8080},
                        {"name": "category", "value": "films"},
                        {"name": "username", "value": "admin"}
                    ]
                }
            ]));
        });

        let client = RadarrClient::new(store).with_base_url(server.url("/api/v3"));
        let outcome = client.verify(&test_config(&dir)).await;
        assert!(!outcome.success);
        assert!(outcome.detail.contains("category"), "{}", outcome.detail);
    }
}
