//! Torrent client reconciliation and Web API access.
//!
//! qBittorrent is the one service whose credentials the orchestrator fully
//! owns. Login walks a ladder of candidates (stored pair, configured pair,
//! image defaults, a temporary session password scraped from the container
//! log); when every candidate fails, the client rewrites the credentials in
//! the mounted `qBittorrent.conf` directly and restarts the container.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha512;
use tracing::{debug, info, warn};

use convoy_compose::{CommandRunner, DockerCli};
use convoy_config::constants::{DOWNLOADS_COMPLETE, DOWNLOADS_INCOMPLETE};
use convoy_config::{ServiceName, StackConfig};
use convoy_store::ConfigStore;

use crate::error::{ClientError, ClientResult};
use crate::http::{
    build_cookie_client, require_success, send_with_retry, wait_for_http_ready, RetryPolicy,
    READY_INTERVAL, READY_TIMEOUT,
};
use crate::{Outcome, ServiceClient};

const SERVICE: &str = "qbittorrent";
const DEFAULT_PASSWORD: &str = "adminadmin";
const LOG_TAIL_LINES: u32 = 200;

/// PBKDF2 parameters qBittorrent uses for `WebUI\Password_PBKDF2`.
const REPAIR_ITERATIONS: u32 = 100_000;
const REPAIR_SALT_LEN: usize = 16;
const REPAIR_KEY_LEN: usize = 64;

/// One torrent as reported by `/torrents/info`.
#[derive(Debug, Clone, Deserialize)]
pub struct TorrentRecord {
    /// Info hash.
    #[serde(default)]
    pub hash: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Assigned category label.
    #[serde(default)]
    pub category: String,
    /// Directory the payload was saved under.
    #[serde(default)]
    pub save_path: String,
    /// Root path of the payload content.
    #[serde(default)]
    pub content_path: String,
}

/// One payload file as reported by `/torrents/files`.
#[derive(Debug, Clone, Deserialize)]
pub struct TorrentFileEntry {
    /// Path relative to the save path.
    #[serde(default)]
    pub name: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// Session-authenticated wrapper over the qBittorrent Web API.
pub struct QbApi {
    base_url: String,
    client: Client,
    policy: RetryPolicy,
}

impl QbApi {
    /// Construct an API handle against `base_url` (no trailing slash).
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(base_url: &str) -> ClientResult<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: build_cookie_client(Duration::from_secs(20))?,
            policy: RetryPolicy::default(),
        })
    }

    /// Attempt a login; `Ok(true)` means the session cookie is now held.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport failures; a rejected credential is
    /// `Ok(false)`.
    pub async fn login(&self, username: &str, password: &str) -> ClientResult<bool> {
        let url = format!("{}/api/v2/auth/login", self.base_url);
        let response = send_with_retry(SERVICE, self.policy, || {
            self.client
                .post(&url)
                .header("Referer", format!("{}/", self.base_url))
                .form(&[("username", username), ("password", password)])
        })
        .await?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body = response
            .text()
            .await
            .map_err(|source| ClientError::Http {
                service: SERVICE,
                source,
            })?;
        Ok(body.trim() == "Ok.")
    }

    /// Push application preferences.
    ///
    /// # Errors
    ///
    /// Returns transport or status errors.
    pub async fn set_preferences(&self, preferences: &Value) -> ClientResult<()> {
        let url = format!("{}/api/v2/app/setPreferences", self.base_url);
        let payload = preferences.to_string();
        let response = send_with_retry(SERVICE, self.policy, || {
            self.client
                .post(&url)
                .form(&[("json", payload.as_str())])
        })
        .await?;
        require_success(SERVICE, response).await?;
        Ok(())
    }

    /// Current application preferences.
    ///
    /// # Errors
    ///
    /// Returns transport or status errors.
    pub async fn preferences(&self) -> ClientResult<Value> {
        self.get_json("/api/v2/app/preferences").await
    }

    /// Current categories as `label → {savePath, …}`.
    ///
    /// # Errors
    ///
    /// Returns transport or status errors.
    pub async fn categories(&self) -> ClientResult<Value> {
        self.get_json("/api/v2/torrents/categories").await
    }

    /// Create or update a category so its save path matches. Returns whether
    /// anything changed.
    ///
    /// # Errors
    ///
    /// Returns transport errors, or status errors other than the
    /// already-exists conflict.
    pub async fn upsert_category(&self, name: &str, save_path: &str) -> ClientResult<bool> {
        let create_url = format!("{}/api/v2/torrents/createCategory", self.base_url);
        let response = send_with_retry(SERVICE, self.policy, || {
            self.client
                .post(&create_url)
                .form(&[("category", name), ("savePath", save_path)])
        })
        .await?;
        match response.status().as_u16() {
            200 => return Ok(true),
            409 => {}
            _ => {
                require_success(SERVICE, response).await?;
                return Ok(false);
            }
        }

        let edit_url = format!("{}/api/v2/torrents/editCategory", self.base_url);
        let response = send_with_retry(SERVICE, self.policy, || {
            self.client
                .post(&edit_url)
                .form(&[("category", name), ("savePath", save_path)])
        })
        .await?;
        match response.status().as_u16() {
            200 => Ok(true),
            409 => Ok(false),
            _ => {
                require_success(SERVICE, response).await?;
                Ok(false)
            }
        }
    }

    /// Torrents whose state filter is `completed`.
    ///
    /// # Errors
    ///
    /// Returns transport or status errors.
    pub async fn list_completed(&self) -> ClientResult<Vec<TorrentRecord>> {
        let url = format!("{}/api/v2/torrents/info?filter=completed", self.base_url);
        let response =
            send_with_retry(SERVICE, self.policy, || self.client.get(&url)).await?;
        let response = require_success(SERVICE, response).await?;
        let records: Vec<TorrentRecord> =
            response.json().await.map_err(|source| ClientError::Http {
                service: SERVICE,
                source,
            })?;
        Ok(records
            .into_iter()
            .filter(|record| !record.hash.is_empty() && !record.save_path.is_empty())
            .collect())
    }

    /// Payload file list for one torrent.
    ///
    /// # Errors
    ///
    /// Returns transport or status errors.
    pub async fn list_files(&self, hash: &str) -> ClientResult<Vec<TorrentFileEntry>> {
        let url = format!("{}/api/v2/torrents/files?hash={hash}", self.base_url);
        let response =
            send_with_retry(SERVICE, self.policy, || self.client.get(&url)).await?;
        let response = require_success(SERVICE, response).await?;
        response.json().await.map_err(|source| ClientError::Http {
            service: SERVICE,
            source,
        })
    }

    /// Delete torrents, optionally removing their payload files.
    ///
    /// # Errors
    ///
    /// Returns transport or status errors.
    pub async fn delete_torrents(&self, hashes: &[String], delete_files: bool) -> ClientResult<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let url = format!("{}/api/v2/torrents/delete", self.base_url);
        let joined = hashes.join("|");
        let delete_flag = if delete_files { "true" } else { "false" };
        let response = send_with_retry(SERVICE, self.policy, || {
            self.client
                .post(&url)
                .form(&[("hashes", joined.as_str()), ("deleteFiles", delete_flag)])
        })
        .await?;
        require_success(SERVICE, response).await?;
        Ok(())
    }

    async fn get_json(&self, path: &str) -> ClientResult<Value> {
        let url = format!("{}{path}", self.base_url);
        let response =
            send_with_retry(SERVICE, self.policy, || self.client.get(&url)).await?;
        let response = require_success(SERVICE, response).await?;
        response.json().await.map_err(|source| ClientError::Http {
            service: SERVICE,
            source,
        })
    }
}

/// Reconciliation client for the torrent download worker.
pub struct QbittorrentClient {
    store: Arc<ConfigStore>,
    docker: DockerCli,
    base_url: String,
}

impl QbittorrentClient {
    /// Construct the client against the store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> Self {
        let port = ServiceName::Qbittorrent.internal_port().unwrap_or(8080);
        Self {
            store,
            docker: DockerCli::new(CommandRunner::default()),
            base_url: format!("http://qbittorrent:{port}"),
        }
    }

    /// Override the API base URL (tests target a mock server).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn run_ensure(&self, config: &StackConfig) -> ClientResult<Outcome> {
        let qb_cfg = &config.services.qbittorrent;
        let (ready, detail) =
            wait_for_http_ready(&format!("{}/", self.base_url), READY_TIMEOUT, READY_INTERVAL)
                .await;
        if !ready {
            return Ok(Outcome::failed(format!("qBittorrent not ready ({detail})")));
        }

        let stored_username = self.store.get_secret(SERVICE, "username")?;
        let stored_password = self.store.get_secret(SERVICE, "password")?;

        let api = QbApi::new(&self.base_url)?;
        let login = match self
            .authenticate(&api, qb_cfg, stored_username.as_deref(), stored_password.as_deref())
            .await?
        {
            Some(pair) => pair,
            None => match self.repair_and_retry(&api, config).await? {
                Some(pair) => pair,
                None => {
                    return Ok(Outcome::failed(
                        "authentication failed (unable to login with known credentials)",
                    ));
                }
            },
        };

        let desired_username = qb_cfg.username.clone();
        let target_password = if qb_cfg.password.is_empty() {
            login.1.clone()
        } else {
            qb_cfg.password.clone()
        };
        let credentials_changed =
            login.0 != desired_username || login.1 != target_password;

        let preferences = json!({
            "save_path": DOWNLOADS_COMPLETE,
            "temp_path_enabled": true,
            "temp_path": DOWNLOADS_INCOMPLETE,
            "max_ratio_enabled": qb_cfg.stop_after_download,
            "max_ratio": 0,
            "max_ratio_action": 0,
            "auto_tmm_enabled": false,
            "bypass_local_auth": true,
            "scan_dirs": { DOWNLOADS_COMPLETE: 0 },
            "web_ui_username": &desired_username,
            "web_ui_password": &target_password,
        });
        api.set_preferences(&preferences).await?;

        let mut categories_changed = false;
        let categories = &config.download_policy.categories;
        for label in [&categories.radarr, &categories.sonarr, &categories.anime] {
            if label.is_empty() {
                continue;
            }
            let save_path = format!("{DOWNLOADS_COMPLETE}/{label}");
            if api.upsert_category(label, &save_path).await? {
                categories_changed = true;
            }
        }

        let mut state_dirty = false;
        if self.store.set_secret(SERVICE, "username", &desired_username)? {
            state_dirty = true;
        }
        if self.store.set_secret(SERVICE, "password", &target_password)? {
            state_dirty = true;
        }

        let changed = credentials_changed || categories_changed || state_dirty;
        let detail = format!(
            "user={desired_username} categories=radarr:{},sonarr:{},anime:{}",
            categories.radarr, categories.sonarr, categories.anime
        );
        Ok(if changed {
            Outcome::changed(detail)
        } else {
            Outcome::ok(detail)
        })
    }

    /// Try every login candidate in order; returns the first working pair.
    async fn authenticate(
        &self,
        api: &QbApi,
        qb_cfg: &convoy_config::QbittorrentConfig,
        stored_username: Option<&str>,
        stored_password: Option<&str>,
    ) -> ClientResult<Option<(String, String)>> {
        let mut candidates: Vec<(String, String)> = Vec::new();
        if let Some(password) = stored_password.filter(|password| !password.is_empty()) {
            let username = stored_username.unwrap_or(&qb_cfg.username);
            candidates.push((username.to_string(), password.to_string()));
        }
        if !qb_cfg.password.is_empty() {
            candidates.push((qb_cfg.username.clone(), qb_cfg.password.clone()));
        }
        for default_pair in [
            (qb_cfg.username.clone(), DEFAULT_PASSWORD.to_string()),
            ("admin".to_string(), DEFAULT_PASSWORD.to_string()),
        ] {
            if !candidates.contains(&default_pair) {
                candidates.push(default_pair);
            }
        }
        if let Some(temporary) = self.fetch_temporary_password().await {
            candidates.push(("admin".to_string(), temporary));
        }

        for (username, password) in candidates {
            if api.login(&username, &password).await? {
                debug!(username = %username, "qBittorrent login accepted");
                return Ok(Some((username, password)));
            }
        }
        Ok(None)
    }

    /// Scrape the container log for the temporary session password the image
    /// prints on first boot.
    async fn fetch_temporary_password(&self) -> Option<String> {
        let pattern =
            Regex::new(r"(?i)temporary password (?:is provided )?for this session: (\S+)")
                .ok()?;
        let logs = self.docker.logs_tail(SERVICE, LOG_TAIL_LINES).await?;
        for line in logs.lines().rev() {
            if let Some(captures) = pattern.captures(line) {
                debug!("captured qBittorrent temporary password from container log");
                return Some(captures.get(1)?.as_str().trim().to_string());
            }
        }
        None
    }

    /// Last resort: rewrite the WebUI credentials in the mounted config file,
    /// restart the container, and retry the configured pair.
    async fn repair_and_retry(
        &self,
        api: &QbApi,
        config: &StackConfig,
    ) -> ClientResult<Option<(String, String)>> {
        let qb_cfg = &config.services.qbittorrent;
        let password = if qb_cfg.password.is_empty() {
            DEFAULT_PASSWORD.to_string()
        } else {
            qb_cfg.password.clone()
        };
        warn!("all qBittorrent login candidates failed; repairing credentials on disk");

        let conf_path = qbittorrent_conf_path(&config.paths.appdata);
        repair_credentials(&conf_path, &qb_cfg.username, &password)?;

        self.docker.restart(SERVICE).await?;
        let (ready, detail) =
            wait_for_http_ready(&format!("{}/", self.base_url), READY_TIMEOUT, READY_INTERVAL)
                .await;
        if !ready {
            return Err(ClientError::Auth {
                service: SERVICE,
                detail: format!("container did not return after credential repair: {detail}"),
            });
        }

        if api.login(&qb_cfg.username, &password).await? {
            info!("qBittorrent credentials repaired on disk");
            return Ok(Some((qb_cfg.username.clone(), password)));
        }
        Ok(None)
    }

    async fn run_verify(&self, config: &StackConfig) -> ClientResult<Outcome> {
        let qb_cfg = &config.services.qbittorrent;
        let username = self
            .store
            .get_secret(SERVICE, "username")?
            .unwrap_or_else(|| qb_cfg.username.clone());
        let password = self
            .store
            .get_secret(SERVICE, "password")?
            .unwrap_or_else(|| qb_cfg.password.clone());

        let api = QbApi::new(&self.base_url)?;
        if !api.login(&username, &password).await? {
            return Ok(Outcome::failed("login failed with stored credentials"));
        }

        let preferences = api.preferences().await?;
        let mut mismatches = Vec::new();
        if preferences.get("save_path").and_then(Value::as_str) != Some(DOWNLOADS_COMPLETE) {
            mismatches.push("save_path");
        }
        if preferences.get("max_ratio_enabled").and_then(Value::as_bool)
            != Some(qb_cfg.stop_after_download)
        {
            mismatches.push("max_ratio_enabled");
        }

        let categories = api.categories().await?;
        let policy = &config.download_policy.categories;
        for label in [&policy.radarr, &policy.sonarr, &policy.anime] {
            if categories.get(label).is_none() {
                mismatches.push("categories");
                break;
            }
        }

        if mismatches.is_empty() {
            Ok(Outcome::ok("preferences and categories ok"))
        } else {
            Ok(Outcome::failed(format!(
                "drift detected: {}",
                mismatches.join(", ")
            )))
        }
    }
}

#[async_trait]
impl ServiceClient for QbittorrentClient {
    fn name(&self) -> ServiceName {
        ServiceName::Qbittorrent
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

/// Location of the WebUI config inside the mounted appdata tree.
fn qbittorrent_conf_path(appdata: &Path) -> PathBuf {
    appdata
        .join("qbittorrent")
        .join("qBittorrent")
        .join("qBittorrent.conf")
}

/// Rewrite `WebUI\Username` and `WebUI\Password_PBKDF2` in the config file.
///
/// The password hash uses qBittorrent's own scheme: PBKDF2-HMAC-SHA512,
/// 100 000 iterations, 16-byte salt, stored as
/// `"@ByteArray(<salt_b64>:<key_b64>)"`.
fn repair_credentials(conf_path: &Path, username: &str, password: &str) -> ClientResult<()> {
    let raw = std::fs::read_to_string(conf_path)
        .map_err(|source| ClientError::io("qb_repair.read", conf_path, source))?;

    let mut salt = [0u8; REPAIR_SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    let mut key = [0u8; REPAIR_KEY_LEN];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), &salt, REPAIR_ITERATIONS, &mut key);
    let hash_line = format!(
        "WebUI\\Password_PBKDF2=\"@ByteArray({}:{})\"",
        BASE64.encode(salt),
        BASE64.encode(key)
    );
    let username_line = format!("WebUI\\Username={username}");

    let mut lines: Vec<String> = Vec::new();
    let mut wrote_username = false;
    let mut wrote_password = false;
    let mut in_preferences = false;
    let mut preferences_seen = false;

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            // Leaving [Preferences] without having written the keys: insert
            // them before the next section header.
            if in_preferences {
                if !wrote_username {
                    lines.push(username_line.clone());
                    wrote_username = true;
                }
                if !wrote_password {
                    lines.push(hash_line.clone());
                    wrote_password = true;
                }
            }
            in_preferences = trimmed == "[Preferences]";
            if in_preferences {
                preferences_seen = true;
            }
            lines.push(line.to_string());
            continue;
        }
        if in_preferences && trimmed.starts_with("WebUI\\Username=") {
            lines.push(username_line.clone());
            wrote_username = true;
            continue;
        }
        if in_preferences && trimmed.starts_with("WebUI\\Password_PBKDF2=") {
            lines.push(hash_line.clone());
            wrote_password = true;
            continue;
        }
        lines.push(line.to_string());
    }

    if in_preferences {
        if !wrote_username {
            lines.push(username_line.clone());
            wrote_username = true;
        }
        if !wrote_password {
            lines.push(hash_line.clone());
            wrote_password = true;
        }
    }
    if !preferences_seen {
        lines.push("[Preferences]".to_string());
        lines.push(username_line);
        lines.push(hash_line);
    } else if !wrote_username || !wrote_password {
        // [Preferences] existed but the file ended inside another section.
        lines.push("[Preferences]".to_string());
        if !wrote_username {
            lines.push(username_line);
        }
        if !wrote_password {
            lines.push(hash_line);
        }
    }

    let mut output = lines.join("\n");
    output.push('\n');
    std::fs::write(conf_path, output)
        .map_err(|source| ClientError::io("qb_repair.write", conf_path, source))
}
