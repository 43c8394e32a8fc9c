//! TV library manager reconciliation.
//!
//! Twin of the movie manager, with two extra wrinkles: a second root folder
//! for anime and a language profile chosen from the media policy.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use convoy_config::constants::{MEDIA_ANIME, MEDIA_TV};
use convoy_config::{PathMap, ServiceName, StackConfig};
use convoy_store::{ConfigStore, Section, ServicesSection};

use crate::arr::{
    describe_changes, ensure_download_client, ensure_host_settings, field_map, read_arr_api_key,
    select_language_profile_id, select_quality_profile_id, wait_for_arr_config, ArrApi,
    CONFIG_WAIT_TIMEOUT,
};
use crate::error::{ClientError, ClientResult};
use crate::http::{wait_for_http_ready, READY_INTERVAL, READY_TIMEOUT};
use crate::{Outcome, ServiceClient};

const SERVICE: &str = "sonarr";
const UI_USERNAME: &str = "sonarr-admin";

/// Reconciliation client for the TV library manager.
pub struct SonarrClient {
    store: Arc<ConfigStore>,
    paths: PathMap,
    base_url: String,
}

impl SonarrClient {
    /// Construct the client against the store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> Self {
        let port = ServiceName::Sonarr.internal_port().unwrap_or(8989);
        Self {
            store,
            paths: PathMap::default(),
            base_url: format!("http://sonarr:{port}/api/v3"),
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

        let config_dir = self.paths.translate(&config.paths.appdata).join(SERVICE);
        std::fs::create_dir_all(&config_dir)
            .map_err(|source| ClientError::io("sonarr.config_dir", &config_dir, source))?;

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
                        "Sonarr API key missing in config.xml at {}",
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
            return Ok(Outcome::failed(format!("Sonarr not ready ({ready_detail})")));
        }

        let changed = match self
            .provision(config, &api_key, &ui_username, &ui_password, &mut detail_messages)
            .await
        {
            Ok(changed) => changed,
            Err(err) if err.is_auth_status() => {
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
        detail_messages
            .push(version.map_or_else(|| "online".to_string(), |v| format!("online (v{v})")));

        let db_path = self
            .paths
            .translate(&config.paths.appdata)
            .join(SERVICE)
            .join("sonarr.db");
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

        let (tv_changed, tv_message, tv_id) = self
            .ensure_root_folder(&api, config, MEDIA_TV, &config.media_policy.movies.keep_audio)
            .await?;
        let (anime_changed, anime_message, anime_id) = self
            .ensure_root_folder(&api, config, MEDIA_ANIME, &config.media_policy.anime.keep_audio)
            .await?;
        let (dl_changed, dl_message, client_id) = ensure_download_client(
            &api,
            &config.download_policy.categories.sonarr,
            &qb_username,
            &qb_password,
            previous_password.as_deref(),
        )
        .await?;

        let (changed_any, aggregated) = describe_changes(&[
            (tv_changed, tv_message),
            (anime_changed, anime_message),
            (dl_changed, dl_message),
        ]);
        if !aggregated.is_empty() {
            detail_messages.push(aggregated);
        }
        changed = changed || changed_any;

        let mut state_dirty = false;
        let entry = services.entry(SERVICE);
        if tv_id.is_some() && entry.root_tv_id != tv_id {
            entry.root_tv_id = tv_id;
            state_dirty = true;
        }
        if anime_id.is_some() && entry.root_anime_id != anime_id {
            entry.root_anime_id = anime_id;
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
        target: &str,
        preferred_languages: &[String],
    ) -> ClientResult<(bool, String, Option<i64>)> {
        let existing = api.get_json("/rootfolder").await?;
        for entry in existing.as_array().into_iter().flatten() {
            if entry.get("path").and_then(Value::as_str) == Some(target) {
                return Ok((
                    false,
                    format!("root folder ready {target}"),
                    entry.get("id").and_then(Value::as_i64),
                ));
            }
        }

        let profiles = api.get_json("/qualityprofile").await?;
        let profiles = profiles.as_array().cloned().unwrap_or_default();
        let quality_id = select_quality_profile_id(&profiles, &config.quality);
        let language_profiles = match api.get_json("/languageprofile").await {
            Ok(value) => value.as_array().cloned().unwrap_or_default(),
            Err(err) => {
                // Newer releases dropped language profiles entirely.
                debug!(error = %err, "language profiles unavailable; defaulting");
                Vec::new()
            }
        };
        let language_id = select_language_profile_id(&language_profiles, preferred_languages);

        let name = target.rsplit('/').next().unwrap_or("series");
        let payload = json!({
            "path": target,
            "name": name,
            "defaultQualityProfileId": quality_id,
            "defaultLanguageProfileId": language_id,
            "defaultTags": [],
        });
        let created = api.post_json("/rootfolder", &payload).await?;
        Ok((
            true,
            format!("root folder created {target}"),
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
        let category = &config.download_policy.categories.sonarr;

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
                mismatches.push(format!("host={:?}", current.get("host")));
            }
            if current.get("port").and_then(Value::as_i64) != Some(i64::from(qb_port)) {
                mismatches.push(format!("port={:?}", current.get("port")));
            }
            if current.get("category").and_then(Value::as_str) != Some(category.as_str()) {
                mismatches.push(format!("category={:?}", current.get("category")));
            }
            if current
                .get("urlBase")
                .and_then(Value::as_str)
                .is_some_and(|base| !base.is_empty())
            {
                mismatches.push("urlBase".to_string());
            }
            if current.get("username").and_then(Value::as_str) != Some(qb_username.as_str()) {
                mismatches.push("username".to_string());
            }
            if mismatches.is_empty() {
                return Ok(Outcome::ok("download client ok"));
            }
            return Ok(Outcome::failed(format!(
                "download client mismatch: {}",
                mismatches.join(", ")
            )));
        }

        Ok(Outcome::failed("download client missing (qbittorrent)"))
    }
}

#[async_trait]
impl ServiceClient for SonarrClient {
    fn name(&self) -> ServiceName {
        ServiceName::Sonarr
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
        StackConfig::with_paths(dir.path().join("pool"), dir.path().join("appdata"), None)
    }

    #[tokio::test]
    async fn verify_detects_missing_download_client() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.set_secret(SERVICE, "api_key", "k").unwrap();

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/downloadclient");
            then.status(200).json_body(serde_json::json!([
                {"id": 9, "implementation": "Transmission", "fields": []}
            ]));
        });

        let client = SonarrClient::new(store).with_base_url(server.url("/api/v3"));
        let outcome = client.verify(&test_config(&dir)).await;
        assert!(!outcome.success);
        assert!(outcome.detail.contains("download client missing"));
    }

    #[tokio::test]
    async fn ensure_provisions_fresh_service_end_to_end() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.set_secret(SERVICE, "api_key", "k").unwrap();
        store.set_secret("qbittorrent", "username", "admin").unwrap();
        store.set_secret("qbittorrent", "password", "pw").unwrap();

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/system/status");
            then.status(200).json_body(serde_json::json!({"version": "4.0.0"}));
        });
        // Host settings already conform except for the password check, which
        // cannot match without a user database; a PUT follows.
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/config/host");
            then.status(200).json_body(serde_json::json!({
                "authenticationMethod": "forms",
                "authenticationRequired": "enabled",
                "analyticsEnabled": false,
                "username": "sonarr-admin"
            }));
        });
        let host_put = server.mock(|when, then| {
            when.method(PUT).path("/api/v3/config/host");
            then.status(202).json_body(serde_json::json!({}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/rootfolder");
            then.status(200).json_body(serde_json::json!([]));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/qualityprofile");
            then.status(200)
                .json_body(serde_json::json!([{"id": 6, "name": "HD-1080p"}]));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/languageprofile");
            then.status(200)
                .json_body(serde_json::json!([{"id": 1, "name": "English"}]));
        });
        let folder_post = server.mock(|when, then| {
            when.method(POST).path("/api/v3/rootfolder");
            then.status(201).json_body(serde_json::json!({"id": 11}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/downloadclient");
            then.status(200).json_body(serde_json::json!([]));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/downloadclient/schema");
            then.status(200).json_body(serde_json::json!([
                {
                    "implementation": "QBittorrent",
                    "implementationName": "qBittorrent",
                    "protocol": "torrent",
                    "configContract": "QBittorrentSettings",
                    "fields": [
                        {"name": "host"}, {"name": "port"}, {"name": "username"},
                        {"name": "password"}, {"name": "category"}, {"name": "urlBase"}
                    ]
                }
            ]));
        });
        let client_post = server.mock(|when, then| {
            when.method(POST).path("/api/v3/downloadclient");
            then.status(201).json_body(serde_json::json!({"id": 2}));
        });

        let client = SonarrClient::new(store.clone()).with_base_url(server.url("/api/v3"));
        let outcome = client.ensure(&test_config(&dir)).await;
        assert!(outcome.success, "{}", outcome.detail);
        assert!(outcome.changed);
        assert!(outcome.detail.contains("online (v4.0.0)"), "{}", outcome.detail);

        host_put.assert();
        // Both root folders land through the same endpoint.
        assert_eq!(folder_post.hits(), 2);
        client_post.assert();

        let services: ServicesSection = store.load_section(Section::Services).unwrap();
        let state = services.get(SERVICE).expect("bookkeeping recorded");
        assert_eq!(state.root_tv_id, Some(11));
        assert_eq!(state.root_anime_id, Some(11));
        assert_eq!(state.download_client_id, Some(2));
        assert_eq!(state.download_client_username.as_deref(), Some("admin"));
    }
}
