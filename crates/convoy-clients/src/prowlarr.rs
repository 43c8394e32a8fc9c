//! Indexer aggregator reconciliation.
//!
//! Beyond the shared *arr bootstrap, this client keeps an "application"
//! linkage per enabled library manager and, exactly once per deployment,
//! populates the indexer roster from the public schema catalog filtered by
//! category support and (optionally) the user's language preferences.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use convoy_config::{PathMap, ServiceName, StackConfig};
use convoy_store::{ConfigStore, Section, ServicesSection};

use crate::arr::{
    ensure_host_settings, field_map, read_arr_api_key, read_arr_config, set_field_values,
    wait_for_arr_config, ArrApi, CONFIG_WAIT_TIMEOUT,
};
use crate::error::{ClientError, ClientResult};
use crate::http::{wait_for_http_ready, READY_INTERVAL, READY_TIMEOUT};
use crate::{Outcome, ServiceClient};

const SERVICE: &str = "prowlarr";
const UI_USERNAME: &str = "prowlarr-admin";

/// Prowlarr category id advertising movie content.
const CATEGORY_MOVIES: i64 = 2000;
/// Prowlarr category id advertising TV content.
const CATEGORY_TV: i64 = 5000;

/// Timeout for the schema catalog endpoints, which are slow to enumerate.
const SCHEMA_TIMEOUT: Duration = Duration::from_secs(120);

/// ISO-639-2 codes mapped to the BCP-47 prefixes Prowlarr definitions carry.
const LANGUAGE_PREFIXES: &[(&str, &[&str])] = &[
    ("eng", &["en-"]),
    ("jpn", &["ja-"]),
    ("spa", &["es-"]),
    ("fre", &["fr-"]),
    ("fra", &["fr-"]),
    ("ger", &["de-"]),
    ("deu", &["de-"]),
    ("ita", &["it-"]),
    ("por", &["pt-"]),
    ("rus", &["ru-"]),
    ("chi", &["zh-"]),
    ("kor", &["ko-"]),
    ("ara", &["ar-"]),
    ("hin", &["hi-"]),
    ("pol", &["pl-"]),
    ("dut", &["nl-"]),
    ("nld", &["nl-"]),
    ("swe", &["sv-"]),
    ("nor", &["no-", "nb-", "nn-"]),
    ("dan", &["da-"]),
    ("fin", &["fi-"]),
    ("tur", &["tr-"]),
    ("vie", &["vi-"]),
    ("tha", &["th-"]),
    ("ind", &["id-"]),
];

/// Reconciliation client for the indexer aggregator.
pub struct ProwlarrClient {
    store: Arc<ConfigStore>,
    paths: PathMap,
    base_url: String,
}

impl ProwlarrClient {
    /// Construct the client against the store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> Self {
        let port = ServiceName::Prowlarr.internal_port().unwrap_or(9696);
        Self {
            store,
            paths: PathMap::default(),
            base_url: format!("http://prowlarr:{port}/api/v1"),
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

        let config_dir = self.paths.translate(&config.paths.appdata).join(SERVICE);
        std::fs::create_dir_all(&config_dir)
            .map_err(|source| ClientError::io("prowlarr.config_dir", &config_dir, source))?;

        if !wait_for_arr_config(&config_dir, CONFIG_WAIT_TIMEOUT).await {
            return Ok(Outcome::failed(format!(
                "config.xml did not appear at {}",
                config_dir.display()
            )));
        }
        let Some(config_api_key) = read_arr_api_key(&config_dir) else {
            return Ok(Outcome::failed(format!(
                "Prowlarr API key missing in config.xml at {}",
                config_dir.display()
            )));
        };

        // The file is authoritative: the container rewrites it on reset, so
        // always prefer what is mounted over what was stored.
        let stored_key = self.store.get_secret(SERVICE, "api_key")?;
        if stored_key.as_deref() != Some(config_api_key.as_str()) {
            self.store.set_secret(SERVICE, "api_key", &config_api_key)?;
            detail_messages.push("refreshed API key from config.xml".to_string());
        }
        let api_key = config_api_key;

        let ui_username = self
            .store
            .ensure_secret(SERVICE, "ui_username", || UI_USERNAME.to_string())?;
        let ui_password = self
            .store
            .ensure_secret(SERVICE, "ui_password", || ConfigStore::generate_token(16))?;

        // Application linkages need the managers' keys; those are produced by
        // earlier stages of the same run.
        let radarr_key = self.store.get_secret("radarr", "api_key")?;
        if config.services.radarr.enabled && radarr_key.is_none() {
            return Ok(Outcome::failed("waiting for Radarr API key"));
        }
        let sonarr_key = self.store.get_secret("sonarr", "api_key")?;
        if config.services.sonarr.enabled && sonarr_key.is_none() {
            return Ok(Outcome::failed("waiting for Sonarr API key"));
        }

        let status_url = format!("{}/system/status", self.base_url);
        let (ready, ready_detail) =
            wait_for_http_ready(&status_url, READY_TIMEOUT, READY_INTERVAL).await;
        if !ready {
            return Ok(Outcome::failed(format!(
                "Prowlarr not ready ({ready_detail})"
            )));
        }

        let api = ArrApi::new(SERVICE, &self.base_url, &api_key)?;
        let status = api.get_json("/system/status").await?;
        let version = status.get("version").and_then(Value::as_str);
        detail_messages
            .push(version.map_or_else(|| "online".to_string(), |v| format!("online (v{v})")));

        let db_path = config_dir.join("prowlarr.db");
        if ensure_host_settings(&api, &db_path, &ui_username, &ui_password).await? {
            detail_messages.push("ui credentials synced".to_string());
            changed = true;
        }

        if config.services.radarr.enabled
            && let Some(key) = radarr_key.as_deref()
        {
            let (app_changed, message) = self
                .ensure_application(&api, config, "Radarr", ServiceName::Radarr, key)
                .await?;
            if !message.is_empty() {
                detail_messages.push(message);
            }
            changed = changed || app_changed;
        }
        if config.services.sonarr.enabled
            && let Some(key) = sonarr_key.as_deref()
        {
            let (app_changed, message) = self
                .ensure_application(&api, config, "Sonarr", ServiceName::Sonarr, key)
                .await?;
            if !message.is_empty() {
                detail_messages.push(message);
            }
            changed = changed || app_changed;
        }

        let mut services: ServicesSection = self.store.load_section(Section::Services)?;
        if !services
            .get(SERVICE)
            .is_some_and(|state| state.indexers_populated)
        {
            let (added, skipped, failed) = self.auto_populate_indexers(config, &api_key).await?;
            if !added.is_empty() {
                detail_messages.push(format!("added {} indexers", added.len()));
                changed = true;
            }
            if !failed.is_empty() {
                detail_messages.push(format!("{} indexers failed to add", failed.len()));
            }
            // Gate even when some definitions failed: the operator can retry
            // individual indexers manually without re-running the sweep.
            if !added.is_empty() || !skipped.is_empty() {
                services.entry(SERVICE).indexers_populated = true;
                self.store.save_section(Section::Services, &services)?;
            }
        }

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

    /// Upsert one application linkage. Returns `(changed, message)`.
    async fn ensure_application(
        &self,
        api: &ArrApi,
        config: &StackConfig,
        display_name: &str,
        service: ServiceName,
        service_api_key: &str,
    ) -> ClientResult<(bool, String)> {
        let appdata = self.paths.translate(&config.paths.appdata);
        let prowlarr_url = build_service_url(SERVICE, &appdata.join(SERVICE), 9696);
        let service_url = build_service_url(
            service.as_str(),
            &appdata.join(service.as_str()),
            service.internal_port().unwrap_or(80),
        );

        let mut desired = Map::new();
        desired.insert("prowlarrUrl".to_string(), json!(prowlarr_url));
        desired.insert("baseUrl".to_string(), json!(service_url));
        desired.insert("apiKey".to_string(), json!(service_api_key));

        let existing = api.get_json("/applications").await?;
        for entry in existing.as_array().into_iter().flatten() {
            let implementation = entry
                .get("implementation")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !implementation.eq_ignore_ascii_case(display_name) {
                continue;
            }
            let fields = field_map(entry.get("fields"));
            let current_base = normalize_base_url(fields.get("baseUrl").and_then(Value::as_str));
            let current_prowlarr =
                normalize_base_url(fields.get("prowlarrUrl").and_then(Value::as_str));
            let key_matches =
                fields.get("apiKey").and_then(Value::as_str) == Some(service_api_key);
            if current_base == normalize_base_url(Some(&service_url))
                && current_prowlarr == normalize_base_url(Some(&prowlarr_url))
                && key_matches
            {
                return Ok((false, format!("application {display_name} ready")));
            }

            let mut updated = entry.clone();
            if let Some(object) = updated.as_object_mut() {
                let entry_fields = entry
                    .get("fields")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                object.insert(
                    "fields".to_string(),
                    Value::Array(set_field_values(&entry_fields, &desired)),
                );
            }
            let app_id = entry.get("id").and_then(Value::as_i64).unwrap_or_default();
            api.put_json(&format!("/applications/{app_id}"), &updated)
                .await?;
            return Ok((true, format!("updated {display_name} application")));
        }

        let schema = api.get_json("/applications/schema").await?;
        let Some(template) = schema.as_array().into_iter().flatten().find(|item| {
            item.get("implementation")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .eq_ignore_ascii_case(display_name)
        }) else {
            return Ok((false, format!("schema for {display_name} not found")));
        };

        let mut payload = Map::new();
        for (key, value) in template.as_object().into_iter().flatten() {
            if key != "fields" && key != "id" {
                payload.insert(key.clone(), value.clone());
            }
        }
        payload.insert("name".to_string(), json!(display_name));
        payload.insert("enable".to_string(), json!(true));
        payload.insert(
            "syncProfileId".to_string(),
            template.get("syncProfileId").cloned().unwrap_or(json!(1)),
        );
        payload.insert("tags".to_string(), json!([]));
        let template_fields = template
            .get("fields")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        payload.insert(
            "fields".to_string(),
            Value::Array(set_field_values(&template_fields, &desired)),
        );

        api.post_json("/applications", &Value::Object(payload)).await?;
        Ok((true, format!("created {display_name} application")))
    }

    /// First-run roster population from the schema catalog.
    ///
    /// Returns `(added, skipped, failed)` definition names.
    async fn auto_populate_indexers(
        &self,
        config: &StackConfig,
        api_key: &str,
    ) -> ClientResult<(Vec<String>, Vec<String>, Vec<String>)> {
        let language_filter = config.services.prowlarr.language_filter;
        let user_languages = extract_user_languages(config);
        if language_filter {
            info!(languages = ?user_languages, "auto-populating indexers with language filter");
        } else {
            info!("auto-populating all public indexers (language filter disabled)");
        }

        let api = ArrApi::with_timeout(SERVICE, &self.base_url, api_key, SCHEMA_TIMEOUT)?;
        let schemas = api.get_json("/indexer/schema").await?;
        let schemas = schemas.as_array().cloned().unwrap_or_default();
        debug!(count = schemas.len(), "fetched indexer schema catalog");

        let existing = api.get_json("/indexer").await?;
        let mut existing_names: HashSet<String> = HashSet::new();
        for entry in existing.as_array().into_iter().flatten() {
            for key in ["name", "implementation"] {
                if let Some(value) = entry.get(key).and_then(Value::as_str) {
                    existing_names.insert(value.to_lowercase());
                }
            }
        }

        let candidates: Vec<&Value> = schemas
            .iter()
            .filter(|schema| indexer_qualifies(schema, language_filter, &user_languages))
            .collect();
        debug!(count = candidates.len(), "indexer candidates after filtering");

        let mut added = Vec::new();
        let mut skipped = Vec::new();
        let mut failed = Vec::new();

        for schema in candidates {
            let name = schema
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                continue;
            }
            if existing_names.contains(&name.to_lowercase()) {
                skipped.push(name);
                continue;
            }

            let payload = build_indexer_payload(schema);
            match api.post_json("/indexer", &payload).await {
                Ok(_) => {
                    existing_names.insert(name.to_lowercase());
                    info!(indexer = %name, "added indexer");
                    added.push(name);
                }
                Err(ClientError::Status { status, body, .. }) => {
                    warn!(indexer = %name, status, body = %body, "failed to add indexer");
                    failed.push(name);
                }
                Err(other) => return Err(other),
            }
        }

        Ok((added, skipped, failed))
    }

    async fn run_verify(&self, config: &StackConfig) -> ClientResult<Outcome> {
        let Some(api_key) = self.store.get_secret(SERVICE, "api_key")? else {
            return Ok(Outcome::failed("missing api key"));
        };
        let api = ArrApi::new(SERVICE, &self.base_url, &api_key)?;
        let existing = api.get_json("/applications").await?;
        let entries = existing.as_array().cloned().unwrap_or_default();

        let mut expected: Vec<(&str, ServiceName)> = Vec::new();
        if config.services.radarr.enabled {
            expected.push(("Radarr", ServiceName::Radarr));
        }
        if config.services.sonarr.enabled {
            expected.push(("Sonarr", ServiceName::Sonarr));
        }

        let appdata = self.paths.translate(&config.paths.appdata);
        let mut missing = Vec::new();
        let mut mismatched = Vec::new();
        for (display_name, service) in expected {
            let service_url = build_service_url(
                service.as_str(),
                &appdata.join(service.as_str()),
                service.internal_port().unwrap_or(80),
            );
            let prowlarr_url = build_service_url(SERVICE, &appdata.join(SERVICE), 9696);

            let found = entries.iter().find(|entry| {
                entry
                    .get("implementation")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .eq_ignore_ascii_case(display_name)
            });
            let Some(entry) = found else {
                missing.push(display_name);
                continue;
            };
            let fields = field_map(entry.get("fields"));
            let base_ok = normalize_base_url(fields.get("baseUrl").and_then(Value::as_str))
                == normalize_base_url(Some(&service_url));
            let prowlarr_ok =
                normalize_base_url(fields.get("prowlarrUrl").and_then(Value::as_str))
                    == normalize_base_url(Some(&prowlarr_url));
            if !base_ok || !prowlarr_ok {
                mismatched.push(display_name);
            }
        }

        let mut parts = Vec::new();
        if !missing.is_empty() {
            parts.push(format!("missing apps: {}", missing.join(", ")));
        }
        if !mismatched.is_empty() {
            parts.push(format!("mismatched apps: {}", mismatched.join(", ")));
        }
        if parts.is_empty() {
            Ok(Outcome::ok("applications ok"))
        } else {
            Ok(Outcome::failed(parts.join("; ")))
        }
    }
}

#[async_trait]
impl ServiceClient for ProwlarrClient {
    fn name(&self) -> ServiceName {
        ServiceName::Prowlarr
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

/// Compose a container-network URL for a service, honouring any port or URL
/// base override in its mounted config file.
fn build_service_url(host: &str, config_dir: &Path, default_port: u16) -> String {
    let parsed = read_arr_config(config_dir).unwrap_or_default();
    let port = parsed.port.unwrap_or(default_port);
    let mut base = format!("http://{host}:{port}");
    if let Some(url_base) = parsed
        .url_base
        .as_deref()
        .map(|value| value.trim_matches('/'))
        .filter(|value| !value.is_empty())
    {
        base = format!("{base}/{url_base}");
    }
    base
}

fn normalize_base_url(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return None;
    }
    let stripped = trimmed.trim_end_matches('/');
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

/// Unique audio languages from the media policy, with `und` dropped; defaults
/// to English when the policy is empty.
fn extract_user_languages(config: &StackConfig) -> Vec<String> {
    let mut languages: Vec<String> = config
        .media_policy
        .movies
        .keep_audio
        .iter()
        .filter(|code| code.as_str() != "und")
        .cloned()
        .collect();
    languages.sort();
    languages.dedup();
    if languages.is_empty() {
        languages.push("eng".to_string());
    }
    languages
}

/// Whether a schema definition qualifies for auto-population.
fn indexer_qualifies(schema: &Value, language_filter: bool, user_languages: &[String]) -> bool {
    let privacy = schema
        .get("privacy")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    if privacy != "public" {
        return false;
    }

    let category_ids: HashSet<i64> = schema
        .get("capabilities")
        .and_then(|caps| caps.get("categories"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|category| category.get("id").and_then(Value::as_i64))
        .collect();
    if !category_ids.contains(&CATEGORY_MOVIES) && !category_ids.contains(&CATEGORY_TV) {
        return false;
    }

    let supports_rss = schema
        .get("supportsRss")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let supports_search = schema
        .get("supportsSearch")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !supports_rss && !supports_search {
        return false;
    }

    if language_filter {
        let language = schema
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !language_matches(language, user_languages) {
            return false;
        }
    }
    true
}

/// A definition with no language tag counts as multi-language and qualifies.
fn language_matches(indexer_language: &str, user_languages: &[String]) -> bool {
    if indexer_language.is_empty() {
        return true;
    }
    let indexer_lower = indexer_language.to_lowercase();
    for code in user_languages {
        let prefixes = LANGUAGE_PREFIXES
            .iter()
            .find(|(known, _)| known == code)
            .map(|(_, prefixes)| *prefixes);
        match prefixes {
            Some(prefixes) => {
                if prefixes
                    .iter()
                    .any(|prefix| indexer_lower.starts_with(prefix))
                {
                    return true;
                }
            }
            None => {
                // Unknown code: try the first two letters against the tag.
                if code.len() >= 2 && indexer_lower.starts_with(&code[..2]) {
                    return true;
                }
            }
        }
    }
    false
}

/// Build an indexer creation payload from a schema entry, carrying field
/// defaults forward.
fn build_indexer_payload(schema: &Value) -> Value {
    let name = schema.get("name").and_then(Value::as_str).unwrap_or_default();
    let fields: Vec<Value> = schema
        .get("fields")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|field| {
            let field_name = field.get("name").and_then(Value::as_str)?;
            let value = field
                .get("value")
                .cloned()
                .or_else(|| field.get("default").cloned())
                .unwrap_or(Value::Null);
            Some(json!({"name": field_name, "value": value}))
        })
        .collect();

    json!({
        "name": name,
        "implementation": schema.get("implementation").cloned().unwrap_or(json!(name)),
        "implementationName": schema.get("implementationName").cloned().unwrap_or(json!(name)),
        "configContract": schema.get("configContract").cloned().unwrap_or(json!("")),
        "protocol": schema.get("protocol").cloned().unwrap_or(json!("torrent")),
        "privacy": schema.get("privacy").cloned().unwrap_or(json!("public")),
        "enable": true,
        "priority": 25,
        "appProfileId": 1,
        "tags": [],
        "fields": fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_base_url(None), None);
        assert_eq!(normalize_base_url(Some("")), None);
        assert_eq!(normalize_base_url(Some("/")), None);
        assert_eq!(
            normalize_base_url(Some("http://sonarr:8989/")),
            Some("http://sonarr:8989".to_string())
        );
    }

    fn schema(privacy: &str, categories: &[i64], language: &str, rss: bool, search: bool) -> Value {
        json!({
            "name": "Example",
            "privacy": privacy,
            "language": language,
            "supportsRss": rss,
            "supportsSearch": search,
            "capabilities": {
                "categories": categories.iter().map(|id| json!({"id": id})).collect::<Vec<_>>(),
            },
        })
    }

    #[test]
    fn qualification_requires_public_and_categories_and_capability() {
        let langs = vec!["eng".to_string()];
        assert!(indexer_qualifies(
            &schema("public", &[CATEGORY_MOVIES], "en-US", true, false),
            true,
            &langs
        ));
        assert!(!indexer_qualifies(
            &schema("private", &[CATEGORY_MOVIES], "en-US", true, true),
            true,
            &langs
        ));
        assert!(!indexer_qualifies(
            &schema("public", &[7000], "en-US", true, true),
            true,
            &langs
        ));
        assert!(!indexer_qualifies(
            &schema("public", &[CATEGORY_TV], "en-US", false, false),
            true,
            &langs
        ));
    }

    #[test]
    fn language_filter_prefix_matches() {
        let langs = vec!["eng".to_string(), "jpn".to_string()];
        assert!(indexer_qualifies(
            &schema("public", &[CATEGORY_TV], "ja-JP", true, true),
            true,
            &langs
        ));
        assert!(!indexer_qualifies(
            &schema("public", &[CATEGORY_TV], "ru-RU", true, true),
            true,
            &langs
        ));
        // Untagged definitions count as multi-language.
        assert!(indexer_qualifies(
            &schema("public", &[CATEGORY_TV], "", true, true),
            true,
            &langs
        ));
        // The filter off admits every public Movies/TV definition.
        assert!(indexer_qualifies(
            &schema("public", &[CATEGORY_TV], "ru-RU", true, true),
            false,
            &langs
        ));
    }

    #[test]
    fn user_languages_drop_und_and_default_to_english() {
        let mut config = StackConfig::with_paths("/p".into(), "/a".into(), None);
        config.media_policy.movies.keep_audio = vec!["und".to_string()];
        assert_eq!(extract_user_languages(&config), vec!["eng".to_string()]);

        config.media_policy.movies.keep_audio =
            vec!["jpn".to_string(), "eng".to_string(), "und".to_string()];
        assert_eq!(
            extract_user_languages(&config),
            vec!["eng".to_string(), "jpn".to_string()]
        );
    }

    #[test]
    fn indexer_payload_prefers_values_over_defaults() {
        let payload = build_indexer_payload(&json!({
            "name": "1337x",
            "implementation": "Cardigann",
            "configContract": "CardigannSettings",
            "fields": [
                {"name": "definitionFile", "value": "1337x"},
                {"name": "baseUrl", "default": "https://1337x.to/"},
                {"ignored": true}
            ],
        }));
        assert_eq!(payload["name"], "1337x");
        assert_eq!(payload["fields"][0]["value"], "1337x");
        assert_eq!(payload["fields"][1]["value"], "https://1337x.to/");
        assert_eq!(payload["fields"].as_array().unwrap().len(), 2);
        assert_eq!(payload["priority"], 25);
    }

    #[tokio::test]
    async fn verify_reports_missing_applications() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConfigStore::open(dir.path().join("state")).unwrap());
        store.set_secret(SERVICE, "api_key", "k").unwrap();

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/applications");
            then.status(200).json_body(json!([]));
        });

        let config = StackConfig::with_paths(
            dir.path().join("pool"),
            dir.path().join("appdata"),
            None,
        );
        let client = ProwlarrClient::new(store).with_base_url(server.url("/api/v1"));
        let outcome = client.verify(&config).await;
        assert!(!outcome.success);
        assert!(outcome.detail.contains("missing apps: Radarr, Sonarr"));
    }
}
