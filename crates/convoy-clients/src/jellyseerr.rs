//! Request broker reconciliation.
//!
//! Jellyseerr initialises itself against the media server: the first-run
//! sequence either logs in to an already connected Jellyfin or sets the
//! connection up, then completes initialisation under the session cookie the
//! auth call produced. Library-manager linkages are built from a `test` call
//! that reports the target's profiles and root folders.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use convoy_config::constants::{MEDIA_MOVIES, MEDIA_TV};
use convoy_config::{PathMap, ServiceName, StackConfig};
use convoy_store::ConfigStore;

use crate::error::{ClientError, ClientResult};
use crate::http::{
    build_client, build_cookie_client, require_success, send_with_retry, wait_for_http_ready,
    RetryPolicy, READY_INTERVAL, READY_TIMEOUT,
};
use crate::{Outcome, ServiceClient};

const SERVICE: &str = "jellyseerr";

/// `mediaServerType` value for a Jellyfin connection.
const MEDIA_SERVER_JELLYFIN: i64 = 2;

/// Reconciliation client for the request broker.
pub struct JellyseerrClient {
    store: Arc<ConfigStore>,
    paths: PathMap,
    base_url: String,
    policy: RetryPolicy,
}

impl JellyseerrClient {
    /// Construct the client against the store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> Self {
        let port = ServiceName::Jellyseerr.internal_port().unwrap_or(5055);
        Self {
            store,
            paths: PathMap::default(),
            base_url: format!("http://jellyseerr:{port}"),
            policy: RetryPolicy::default(),
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
        let status_url = format!("{}/api/v1/status", self.base_url);
        let (ready, ready_detail) =
            wait_for_http_ready(&status_url, READY_TIMEOUT, READY_INTERVAL).await;
        if !ready {
            return Ok(Outcome::failed(format!(
                "Jellyseerr not ready ({ready_detail})"
            )));
        }

        let admin_username = self
            .store
            .get_secret(SERVICE, "admin_username")?
            .unwrap_or_else(|| "admin".to_string());
        let admin_password = self
            .store
            .get_secret(SERVICE, "admin_password")?
            .unwrap_or_else(|| "adminadmin".to_string());

        let mut detail_parts: Vec<String> = Vec::new();
        let mut changed = false;

        let plain = build_client(Duration::from_secs(10))?;
        let public = self.get_public_settings(&plain).await?;
        if !public
            .get("initialized")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            self.complete_startup(&public, &admin_username, &admin_password)
                .await?;
            detail_parts.push("startup=completed".to_string());
            changed = true;
        }

        let Some(api_key) = self.read_api_key(config) else {
            return Ok(Outcome::failed_after_change("api key missing", changed));
        };

        let client = build_client(Duration::from_secs(20))?;
        if config.services.radarr.enabled {
            let (link_changed, message) = self
                .ensure_linkage(
                    &client,
                    &api_key,
                    "radarr",
                    ServiceName::Radarr,
                    MEDIA_MOVIES,
                )
                .await?;
            detail_parts.push(message);
            changed = changed || link_changed;
        } else {
            detail_parts.push("radarr=skipped (disabled)".to_string());
        }
        if config.services.sonarr.enabled {
            let (link_changed, message) = self
                .ensure_linkage(&client, &api_key, "sonarr", ServiceName::Sonarr, MEDIA_TV)
                .await?;
            detail_parts.push(message);
            changed = changed || link_changed;
        } else {
            detail_parts.push("sonarr=skipped (disabled)".to_string());
        }

        let detail = detail_parts
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        let detail = if detail.is_empty() {
            "ok".to_string()
        } else {
            detail
        };
        Ok(if changed {
            Outcome::changed(detail)
        } else {
            Outcome::ok(detail)
        })
    }

    async fn get_public_settings(&self, client: &Client) -> ClientResult<Value> {
        let url = format!("{}/api/v1/settings/public", self.base_url);
        let response =
            send_with_retry(SERVICE, self.policy, || client.get(&url)).await?;
        let response = require_success(SERVICE, response).await?;
        response.json().await.map_err(|source| ClientError::Http {
            service: SERVICE,
            source,
        })
    }

    /// Complete initialisation under a session cookie. The auth endpoint has
    /// two modes: with `hostname` it sets up a new Jellyfin connection
    /// (first boot only); without, it logs in to the existing one. Both leave
    /// the session cookie `/settings/initialize` requires.
    async fn complete_startup(
        &self,
        public: &Value,
        username: &str,
        password: &str,
    ) -> ClientResult<()> {
        let session = build_cookie_client(Duration::from_secs(30))?;
        let jellyfin_configured = public
            .get("mediaServerType")
            .and_then(Value::as_i64)
            .is_some_and(|kind| kind == MEDIA_SERVER_JELLYFIN);

        let auth_url = format!("{}/api/v1/auth/jellyfin", self.base_url);
        let payload = if jellyfin_configured {
            debug!("Jellyfin already configured; logging in to complete initialisation");
            json!({"username": username, "password": password})
        } else {
            debug!("setting up Jellyfin connection for Jellyseerr");
            let jellyfin_port = ServiceName::Jellyfin.internal_port().unwrap_or(8096);
            json!({
                "hostname": "jellyfin",
                "port": jellyfin_port,
                "useSsl": false,
                "urlBase": "",
                "serverType": MEDIA_SERVER_JELLYFIN,
                "username": username,
                "password": password,
                "email": format!("{username}@example.com"),
            })
        };
        let response = send_with_retry(SERVICE, self.policy, || {
            session.post(&auth_url).json(&payload)
        })
        .await?;
        require_success(SERVICE, response).await?;

        let init_url = format!("{}/api/v1/settings/initialize", self.base_url);
        let response = send_with_retry(SERVICE, self.policy, || {
            session.post(&init_url).json(&json!({}))
        })
        .await?;
        require_success(SERVICE, response).await?;
        info!("Jellyseerr initialisation completed");
        Ok(())
    }

    /// The broker stores its API key in its own settings file rather than an
    /// HTTP-discoverable location.
    fn read_api_key(&self, config: &StackConfig) -> Option<String> {
        let settings_path = self.settings_path(config);
        let raw = std::fs::read_to_string(&settings_path).ok()?;
        let parsed: Value = serde_json::from_str(&raw).ok()?;
        parsed
            .get("main")
            .and_then(|main| main.get("apiKey"))
            .and_then(Value::as_str)
            .map(String::from)
    }

    fn settings_path(&self, config: &StackConfig) -> PathBuf {
        self.paths
            .translate(&config.paths.appdata)
            .join(SERVICE)
            .join("settings.json")
    }

    /// Upsert one library-manager linkage. Returns `(changed, message)`.
    async fn ensure_linkage(
        &self,
        client: &Client,
        api_key: &str,
        label: &str,
        service: ServiceName,
        desired_root: &str,
    ) -> ClientResult<(bool, String)> {
        let service_key = self.store.get_secret(service.as_str(), "api_key")?;
        let Some(service_key) = service_key else {
            return Ok((false, format!("{label}=skipped (no api key)")));
        };

        let target_port = service.internal_port().unwrap_or(80);
        let settings_url = format!("{}/api/v1/settings/{label}", self.base_url);
        let response = send_with_retry(SERVICE, self.policy, || {
            client.get(&settings_url).header("X-Api-Key", api_key)
        })
        .await?;
        let response = require_success(SERVICE, response).await?;
        let existing: Value = response.json().await.map_err(|source| ClientError::Http {
            service: SERVICE,
            source,
        })?;
        if entry_exists(&existing, service.as_str(), target_port) {
            return Ok((false, format!("{label}=ready")));
        }

        let test_url = format!("{}/api/v1/settings/{label}/test", self.base_url);
        let test_payload = json!({
            "hostname": service.as_str(),
            "port": target_port,
            "apiKey": &service_key,
            "useSsl": false,
            "baseUrl": "",
        });
        let response = send_with_retry(SERVICE, self.policy, || {
            client
                .post(&test_url)
                .header("X-Api-Key", api_key)
                .json(&test_payload)
        })
        .await?;
        let response = require_success(SERVICE, response).await?;
        let body: Value = response.json().await.map_err(|source| ClientError::Http {
            service: SERVICE,
            source,
        })?;

        let profile = body
            .get("profiles")
            .and_then(Value::as_array)
            .and_then(|profiles| profiles.first());
        let root_dir = select_root(body.get("rootFolders"), desired_root);
        let (Some(profile), Some(root_dir)) = (profile, root_dir) else {
            return Ok((
                false,
                format!("{label}=incomplete (profiles or root folders missing)"),
            ));
        };

        let mut payload = json!({
            "name": capitalise(label),
            "hostname": service.as_str(),
            "port": target_port,
            "apiKey": &service_key,
            "useSsl": false,
            "baseUrl": body.get("urlBase").and_then(Value::as_str).unwrap_or(""),
            "activeProfileId": profile.get("id").cloned().unwrap_or(json!(1)),
            "activeProfileName": profile.get("name").cloned().unwrap_or(json!("")),
            "activeDirectory": root_dir,
            "is4k": false,
            "isDefault": true,
            "externalUrl": "",
            "syncEnabled": true,
            "preventSearch": false,
        });
        if service == ServiceName::Sonarr {
            let language_profile_id = body
                .get("languageProfiles")
                .and_then(Value::as_array)
                .and_then(|profiles| profiles.first())
                .and_then(|profile| profile.get("id"))
                .cloned()
                .unwrap_or(json!(1));
            if let Some(object) = payload.as_object_mut() {
                object.insert("activeLanguageProfileId".to_string(), language_profile_id);
                object.insert("enableSeasonFolders".to_string(), json!(true));
                object.insert("activeAnimeDirectory".to_string(), Value::Null);
                object.insert("activeAnimeProfileId".to_string(), Value::Null);
                object.insert("activeAnimeProfileName".to_string(), Value::Null);
                object.insert("activeAnimeLanguageProfileId".to_string(), Value::Null);
            }
        } else if service == ServiceName::Radarr
            && let Some(object) = payload.as_object_mut()
        {
            object.insert("minimumAvailability".to_string(), json!("announced"));
        }

        let response = send_with_retry(SERVICE, self.policy, || {
            client
                .post(&settings_url)
                .header("X-Api-Key", api_key)
                .json(&payload)
        })
        .await?;
        require_success(SERVICE, response).await?;
        Ok((true, format!("{label}=linked")))
    }

    async fn run_verify(&self, config: &StackConfig) -> ClientResult<Outcome> {
        let Some(api_key) = self.read_api_key(config) else {
            return Ok(Outcome::failed("api key missing"));
        };
        let client = build_client(Duration::from_secs(20))?;

        let public = self.get_public_settings(&client).await?;
        if !public
            .get("initialized")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Ok(Outcome::failed("startup incomplete"));
        }

        let mut failures = Vec::new();
        for (label, service) in [
            ("radarr", ServiceName::Radarr),
            ("sonarr", ServiceName::Sonarr),
        ] {
            if !config.services.settings(service).enabled {
                continue;
            }
            let url = format!("{}/api/v1/settings/{label}", self.base_url);
            let response = send_with_retry(SERVICE, self.policy, || {
                client.get(&url).header("X-Api-Key", &api_key)
            })
            .await?;
            let response = require_success(SERVICE, response).await?;
            let entries: Value = response.json().await.map_err(|source| ClientError::Http {
                service: SERVICE,
                source,
            })?;
            let port = service.internal_port().unwrap_or(80);
            if !entry_exists(&entries, service.as_str(), port) {
                failures.push(label);
            }
        }

        if failures.is_empty() {
            Ok(Outcome::ok("settings ok"))
        } else {
            Ok(Outcome::failed(format!(
                "missing links: {}",
                failures.join(", ")
            )))
        }
    }
}

#[async_trait]
impl ServiceClient for JellyseerrClient {
    fn name(&self) -> ServiceName {
        ServiceName::Jellyseerr
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

fn entry_exists(entries: &Value, host: &str, port: u16) -> bool {
    entries.as_array().into_iter().flatten().any(|entry| {
        entry.get("hostname").and_then(Value::as_str) == Some(host)
            && entry.get("port").and_then(Value::as_i64) == Some(i64::from(port))
    })
}

/// Prefer the desired container path among reported root folders; fall back
/// to the first reported folder, then to the desired path itself.
fn select_root(folders: Option<&Value>, desired: &str) -> Option<String> {
    let folders = folders.and_then(Value::as_array)?;
    if folders.is_empty() {
        return Some(desired.to_string());
    }
    for folder in folders {
        if folder.get("path").and_then(Value::as_str) == Some(desired) {
            return Some(desired.to_string());
        }
    }
    folders
        .first()
        .and_then(|folder| folder.get("path"))
        .and_then(Value::as_str)
        .map(String::from)
}

fn capitalise(label: &str) -> String {
    let mut chars = label.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().collect::<String>() + chars.as_str()
    })
}
