//! Shared machinery for the *arr family of services.
//!
//! The movie/TV library managers and the indexer aggregator expose near
//! identical HTTP APIs: an `X-Api-Key` header, `/system/status`, schema-driven
//! resources with `fields` arrays, and a mounted `config.xml` holding the key
//! the container minted on first launch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pbkdf2::pbkdf2_hmac;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::Sha512;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Row};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use convoy_config::QualityConfig;

use crate::error::{ClientError, ClientResult};
use crate::http::{
    build_client, require_success, send_with_retry, wait_for_http_ready, RetryPolicy,
    READY_INTERVAL, READY_TIMEOUT,
};

/// How long to wait for a freshly started container to write `config.xml`.
pub const CONFIG_WAIT_TIMEOUT: Duration = Duration::from_secs(180);
/// Poll interval while waiting for `config.xml`.
pub const CONFIG_WAIT_INTERVAL: Duration = Duration::from_secs(2);

/// Values read from a mounted *arr `config.xml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ArrConfigFile {
    /// API key minted by the service on first launch.
    pub api_key: Option<String>,
    /// Internal port override.
    pub port: Option<u16>,
    /// URL base override.
    pub url_base: Option<String>,
}

/// Read and parse `config.xml` from a service's config directory.
#[must_use]
pub fn read_arr_config(config_dir: &Path) -> Option<ArrConfigFile> {
    let path = config_dir.join("config.xml");
    let raw = std::fs::read_to_string(&path).ok()?;
    match quick_xml::de::from_str::<ArrConfigFile>(&raw) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unparseable config.xml");
            None
        }
    }
}

/// Read just the API key, trimmed, when present and non-empty.
#[must_use]
pub fn read_arr_api_key(config_dir: &Path) -> Option<String> {
    read_arr_config(config_dir)
        .and_then(|parsed| parsed.api_key)
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

/// Poll until `config.xml` exists in the config directory.
pub async fn wait_for_arr_config(config_dir: &Path, timeout: Duration) -> bool {
    let config_file = config_dir.join("config.xml");
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if config_file.exists() {
            return true;
        }
        sleep(CONFIG_WAIT_INTERVAL).await;
    }
    config_file.exists()
}

/// Thin wrapper around one *arr API endpoint.
pub struct ArrApi {
    service: &'static str,
    base_url: String,
    api_key: String,
    client: Client,
    policy: RetryPolicy,
}

impl ArrApi {
    /// Construct an API handle with the standard 10 s read timeout.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(service: &'static str, base_url: &str, api_key: &str) -> ClientResult<Self> {
        Self::with_timeout(service, base_url, api_key, Duration::from_secs(10))
    }

    /// Construct an API handle with a custom read timeout; schema-heavy
    /// endpoints (indexer catalogs) need longer.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn with_timeout(
        service: &'static str,
        base_url: &str,
        api_key: &str,
        read_timeout: Duration,
    ) -> ClientResult<Self> {
        Ok(Self {
            service,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client: build_client(read_timeout)?,
            policy: RetryPolicy::default(),
        })
    }

    /// Service label used in errors.
    #[must_use]
    pub const fn service(&self) -> &'static str {
        self.service
    }

    /// Status endpoint used for readiness checks.
    #[must_use]
    pub fn status_url(&self) -> String {
        format!("{}/system/status", self.base_url)
    }

    /// GET a JSON document.
    ///
    /// # Errors
    ///
    /// Returns transport errors after retries, or a status error for non-2xx.
    pub async fn get_json(&self, path: &str) -> ClientResult<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = send_with_retry(self.service, self.policy, || {
            self.client
                .get(&url)
                .header("X-Api-Key", &self.api_key)
        })
        .await?;
        Self::decode(self.service, require_success(self.service, response).await?).await
    }

    /// POST a JSON document.
    ///
    /// # Errors
    ///
    /// Same contract as [`ArrApi::get_json`].
    pub async fn post_json(&self, path: &str, body: &Value) -> ClientResult<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = send_with_retry(self.service, self.policy, || {
            self.client
                .post(&url)
                .header("X-Api-Key", &self.api_key)
                .json(body)
        })
        .await?;
        Self::decode(self.service, require_success(self.service, response).await?).await
    }

    /// PUT a JSON document.
    ///
    /// # Errors
    ///
    /// Same contract as [`ArrApi::get_json`].
    pub async fn put_json(&self, path: &str, body: &Value) -> ClientResult<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = send_with_retry(self.service, self.policy, || {
            self.client
                .put(&url)
                .header("X-Api-Key", &self.api_key)
                .json(body)
        })
        .await?;
        Self::decode(self.service, require_success(self.service, response).await?).await
    }

    async fn decode(service: &'static str, response: reqwest::Response) -> ClientResult<Value> {
        let bytes = response
            .bytes()
            .await
            .map_err(|source| ClientError::Http { service, source })?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_or_else(
            |_| {
                Ok(Value::String(
                    String::from_utf8_lossy(&bytes).into_owned(),
                ))
            },
            Ok,
        )
    }
}

/// Return a new `fields` array with `value` entries overridden by name.
#[must_use]
pub fn set_field_values(fields: &[Value], overrides: &Map<String, Value>) -> Vec<Value> {
    fields
        .iter()
        .map(|field| {
            let mut item = field.clone();
            if let Some(name) = field.get("name").and_then(Value::as_str)
                && let Some(value) = overrides.get(name)
                && let Some(object) = item.as_object_mut()
            {
                object.insert("value".to_string(), value.clone());
            }
            item
        })
        .collect()
}

/// Aggregate `(changed, message)` pairs into a combined flag and summary.
#[must_use]
pub fn describe_changes(changes: &[(bool, String)]) -> (bool, String) {
    let changed = changes.iter().any(|(did_change, _)| *did_change);
    let messages: Vec<&str> = changes
        .iter()
        .map(|(_, message)| message.as_str())
        .filter(|message| !message.is_empty())
        .collect();
    (changed, messages.join("; "))
}

/// Compare a password against the PBKDF2 record in a service's SQLite user
/// store. Any read failure counts as a mismatch, which at worst causes a
/// redundant (idempotent) host-settings update.
pub async fn arr_password_matches(db_path: &Path, username: &str, password: &str) -> bool {
    match read_password_row(db_path, username).await {
        Ok(Some((stored_hash, salt, iterations))) => {
            verify_pbkdf2(password, &stored_hash, &salt, iterations)
        }
        Ok(None) => false,
        Err(err) => {
            debug!(path = %db_path.display(), error = %err, "user store lookup failed");
            false
        }
    }
}

async fn read_password_row(
    db_path: &Path,
    username: &str,
) -> ClientResult<Option<(String, String, u32)>> {
    if !db_path.exists() {
        return Ok(None);
    }
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .read_only(true)
        .immutable(true);
    let mut conn = options
        .connect()
        .await
        .map_err(|source| ClientError::Database {
            path: db_path.to_path_buf(),
            source,
        })?;

    let row = sqlx::query("SELECT Password, Salt, Iterations FROM Users WHERE Username = ?1")
        .bind(username)
        .fetch_optional(&mut conn)
        .await
        .map_err(|source| ClientError::Database {
            path: db_path.to_path_buf(),
            source,
        })?;

    Ok(row.map(|row| {
        let password: String = row.try_get("Password").unwrap_or_default();
        let salt: String = row.try_get("Salt").unwrap_or_default();
        let iterations: i64 = row.try_get("Iterations").unwrap_or(10_000);
        (password, salt, u32::try_from(iterations).unwrap_or(10_000))
    }))
}

/// The *arr services store `base64(pbkdf2_hmac_sha512(password, salt))` with
/// the salt itself base64-encoded alongside.
fn verify_pbkdf2(password: &str, stored_hash_b64: &str, salt_b64: &str, iterations: u32) -> bool {
    let Ok(stored_hash) = BASE64.decode(stored_hash_b64.trim()) else {
        return false;
    };
    let Ok(salt) = BASE64.decode(salt_b64.trim()) else {
        return false;
    };
    if stored_hash.is_empty() || iterations == 0 {
        return false;
    }
    let mut derived = vec![0u8; stored_hash.len()];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), &salt, iterations, &mut derived);
    derived == stored_hash
}

/// Enforce the standard UI auth posture: forms authentication required,
/// analytics off, credentials matching the stored pair. Returns whether an
/// update was pushed; after a push the service restarts its auth stack, so
/// the caller's readiness state is re-established here.
///
/// # Errors
///
/// Returns an error when the API calls fail or the service does not come
/// back after the update.
pub async fn ensure_host_settings(
    api: &ArrApi,
    db_path: &Path,
    username: &str,
    password: &str,
) -> ClientResult<bool> {
    let host = api.get_json("/config/host").await?;
    let password_matches = arr_password_matches(db_path, username, password).await;
    let analytics_on = host
        .get("analyticsEnabled")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let update_required = host.get("authenticationMethod").and_then(Value::as_str) != Some("forms")
        || host.get("authenticationRequired").and_then(Value::as_str) != Some("enabled")
        || host.get("username").and_then(Value::as_str) != Some(username)
        || analytics_on
        || !password_matches;

    if !update_required {
        return Ok(false);
    }

    let mut payload = host;
    if let Some(object) = payload.as_object_mut() {
        object.insert("authenticationMethod".to_string(), json!("forms"));
        object.insert("authenticationRequired".to_string(), json!("enabled"));
        object.insert("analyticsEnabled".to_string(), json!(false));
        object.insert("username".to_string(), json!(username));
        object.insert("password".to_string(), json!(password));
        object.insert("passwordConfirmation".to_string(), json!(password));
    }
    api.put_json("/config/host", &payload).await?;

    let (ready, detail) =
        wait_for_http_ready(&api.status_url(), READY_TIMEOUT, READY_INTERVAL).await;
    if !ready {
        return Err(ClientError::Auth {
            service: api.service(),
            detail: format!("service did not return after auth update: {detail}"),
        });
    }
    Ok(true)
}

/// Ensure exactly one enabled qBittorrent download client exists with the
/// given category and credentials. Returns `(changed, message, client_id)`.
///
/// # Errors
///
/// Returns an error when the API calls fail.
pub async fn ensure_download_client(
    api: &ArrApi,
    category: &str,
    username: &str,
    password: &str,
    previous_password: Option<&str>,
) -> ClientResult<(bool, String, Option<i64>)> {
    let qb_port = convoy_config::ServiceName::Qbittorrent
        .internal_port()
        .unwrap_or(8080);
    let mut desired = Map::new();
    desired.insert("host".to_string(), json!("qbittorrent"));
    desired.insert("port".to_string(), json!(qb_port));
    desired.insert("useSsl".to_string(), json!(false));
    desired.insert("urlBase".to_string(), json!(""));
    desired.insert("username".to_string(), json!(username));
    desired.insert("password".to_string(), json!(password));
    desired.insert("category".to_string(), json!(category));

    let clients = api.get_json("/downloadclient").await?;
    for client in clients.as_array().into_iter().flatten() {
        let implementation = client
            .get("implementation")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !implementation.eq_ignore_ascii_case("qbittorrent") {
            continue;
        }
        let client_id = client.get("id").and_then(Value::as_i64);
        let current = field_map(client.get("fields"));
        let host_ok = current.get("host").and_then(Value::as_str) == Some("qbittorrent");
        let port_ok = value_as_string(current.get("port")) == qb_port.to_string();
        let category_ok = current.get("category").and_then(Value::as_str) == Some(category);
        let url_base_ok = current
            .get("urlBase")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .is_empty();
        let username_ok = current.get("username").and_then(Value::as_str) == Some(username);
        // The API never echoes the stored password, so drift is detected
        // against the pair pushed on the previous apply.
        let password_ok = previous_password.is_some_and(|previous| previous == password);

        if host_ok && port_ok && category_ok && url_base_ok && username_ok && password_ok {
            return Ok((false, "download client ready".to_string(), client_id));
        }

        let mut updated = client.clone();
        if let Some(object) = updated.as_object_mut() {
            object.insert("enable".to_string(), json!(true));
            let fields = client
                .get("fields")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            object.insert(
                "fields".to_string(),
                Value::Array(set_field_values(&fields, &desired)),
            );
        }
        let path = client_id.map_or_else(
            || "/downloadclient".to_string(),
            |id| format!("/downloadclient/{id}"),
        );
        api.put_json(&path, &updated).await?;
        return Ok((
            true,
            format!(
                "updated download client {}",
                client_id.unwrap_or_default()
            ),
            client_id,
        ));
    }

    let schema = api.get_json("/downloadclient/schema").await?;
    let Some(template) = schema.as_array().into_iter().flatten().find(|entry| {
        entry
            .get("implementation")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .eq_ignore_ascii_case("qbittorrent")
    }) else {
        return Ok((false, "qBittorrent schema unavailable".to_string(), None));
    };

    let template_fields = template
        .get("fields")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let payload = json!({
        "name": "qBittorrent",
        "implementation": template.get("implementation").cloned().unwrap_or(json!("QBittorrent")),
        "implementationName": template.get("implementationName").cloned().unwrap_or(json!("qBittorrent")),
        "protocol": template.get("protocol").cloned().unwrap_or(json!("torrent")),
        "configContract": template.get("configContract").cloned().unwrap_or(json!("QBittorrentSettings")),
        "enable": true,
        "priority": 1,
        "removeCompletedDownloads": true,
        "fields": Value::Array(set_field_values(&template_fields, &desired)),
        "tags": [],
    });
    let created = api.post_json("/downloadclient", &payload).await?;
    let client_id = created.get("id").and_then(Value::as_i64);
    Ok((true, "created download client".to_string(), client_id))
}

/// Fields of a schema-driven resource as a `name → value` map.
#[must_use]
pub fn field_map(fields: Option<&Value>) -> Map<String, Value> {
    let mut map = Map::new();
    for field in fields.and_then(Value::as_array).into_iter().flatten() {
        if let Some(name) = field.get("name").and_then(Value::as_str) {
            map.insert(
                name.to_string(),
                field.get("value").cloned().unwrap_or(Value::Null),
            );
        }
    }
    map
}

fn value_as_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        _ => String::new(),
    }
}

/// Pick the quality profile matching the configured resolution or preset,
/// falling back to the first profile.
#[must_use]
pub fn select_quality_profile_id(profiles: &[Value], quality: &QualityConfig) -> i64 {
    let first_id = profiles
        .first()
        .and_then(|profile| profile.get("id"))
        .and_then(Value::as_i64)
        .unwrap_or(1);

    let mut tokens: Vec<String> = Vec::new();
    if let Some(resolution) = quality.target_resolution {
        tokens.push(resolution.as_str().to_string());
    }
    if quality.preset != convoy_config::QualityPreset::Balanced {
        tokens.push(quality.preset.as_str().to_string());
    }

    for token in tokens {
        let bare = token.trim_end_matches('p').to_string();
        for profile in profiles {
            let name = profile
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase();
            if name.contains(&token) || name.contains(&bare) {
                return profile.get("id").and_then(Value::as_i64).unwrap_or(first_id);
            }
        }
    }
    first_id
}

/// Pick the language profile whose name mentions one of the preferred
/// languages, falling back to the first profile.
#[must_use]
pub fn select_language_profile_id(profiles: &[Value], preferred: &[String]) -> i64 {
    let first_id = profiles
        .first()
        .and_then(|profile| profile.get("id"))
        .and_then(Value::as_i64)
        .unwrap_or(1);
    if profiles.is_empty() || preferred.is_empty() {
        return first_id;
    }

    let preferred_names: Vec<&str> = preferred
        .iter()
        .map(|code| language_name(code))
        .collect();
    for profile in profiles {
        let name = profile
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        if preferred_names.iter().any(|token| name.contains(token)) {
            return profile.get("id").and_then(Value::as_i64).unwrap_or(first_id);
        }
    }
    first_id
}

fn language_name(code: &str) -> &str {
    match code {
        "eng" => "english",
        "jpn" => "japanese",
        "spa" => "spanish",
        "fra" | "fre" => "french",
        "deu" | "ger" => "german",
        "ita" => "italian",
        "kor" => "korean",
        "chi" | "zho" => "chinese",
        "por" => "portuguese",
        "rus" => "russian",
        other => other,
    }
}
