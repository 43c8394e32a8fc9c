//! Media server reconciliation.
//!
//! Jellyfin has no pre-minted API key; the orchestrator walks the first-run
//! wizard, authenticates as the admin it created, and registers the virtual
//! libraries pointing at the container-side media tree.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use convoy_config::constants::{MEDIA_ANIME, MEDIA_MOVIES, MEDIA_TV};
use convoy_config::{ServiceName, StackConfig};
use convoy_store::ConfigStore;

use crate::error::{ClientError, ClientResult};
use crate::http::{
    build_client, require_success, send_with_retry, wait_for_http_ready, RetryPolicy,
    READY_INTERVAL, READY_TIMEOUT,
};
use crate::{Outcome, ServiceClient};

const SERVICE: &str = "jellyfin";
const AUTH_HEADER: &str = "X-Emby-Authorization";
const AUTH_VALUE: &str = "MediaBrowser Client=\"convoy\", Device=\"convoy\", DeviceId=\"convoy\", Version=\"1.0.0\"";

/// Libraries the stack maintains: `(name, collection type, path)`.
const LIBRARIES: [(&str, &str, &str); 3] = [
    ("Movies", "movies", MEDIA_MOVIES),
    ("TV", "tvshows", MEDIA_TV),
    ("Anime", "tvshows", MEDIA_ANIME),
];

/// Reconciliation client for the media server.
pub struct JellyfinClient {
    store: Arc<ConfigStore>,
    base_url: String,
    policy: RetryPolicy,
}

impl JellyfinClient {
    /// Construct the client against the store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> Self {
        let port = ServiceName::Jellyfin.internal_port().unwrap_or(8096);
        Self {
            store,
            base_url: format!("http://jellyfin:{port}"),
            policy: RetryPolicy::default(),
        }
    }

    /// Override the API base URL (tests target a mock server).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn admin_credentials(&self) -> ClientResult<(String, String)> {
        let username = self
            .store
            .get_secret(SERVICE, "admin_username")?
            .unwrap_or_else(|| "admin".to_string());
        let password = self
            .store
            .get_secret(SERVICE, "admin_password")?
            .unwrap_or_else(|| "adminadmin".to_string());
        Ok((username, password))
    }

    async fn run_ensure(&self, config: &StackConfig) -> ClientResult<Outcome> {
        let ping_url = format!("{}/System/Ping", self.base_url);
        let (ready, ready_detail) =
            wait_for_http_ready(&ping_url, READY_TIMEOUT, READY_INTERVAL).await;
        if !ready {
            return Ok(Outcome::failed(format!(
                "Jellyfin not ready ({ready_detail})"
            )));
        }

        let (username, password) = self.admin_credentials()?;
        let client = build_client(Duration::from_secs(20))?;
        let mut detail_parts: Vec<String> = Vec::new();
        let mut changed = false;

        let status = self.get_public_info(&client).await?;
        if !status
            .get("StartupWizardCompleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            info!("completing Jellyfin startup wizard");
            self.run_startup_wizard(&client, config, &username, &password)
                .await?;
            detail_parts.push(
                "startup=configuration; startup=remote-access; startup=admin-created; startup=completed"
                    .to_string(),
            );
            changed = true;
        }

        let Some(token) = self.authenticate(&client, &username, &password).await? else {
            return Ok(Outcome::failed_after_change(
                "authentication failed (no token returned)",
                changed,
            ));
        };

        let (libraries_changed, libraries_detail) =
            self.ensure_libraries(&client, &token).await?;
        changed = changed || libraries_changed;
        detail_parts.push(libraries_detail);

        let detail = detail_parts
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        Ok(if changed {
            Outcome::changed(detail)
        } else {
            Outcome::ok(detail)
        })
    }

    async fn get_public_info(&self, client: &Client) -> ClientResult<Value> {
        let url = format!("{}/System/Info/Public", self.base_url);
        let response = send_with_retry(SERVICE, self.policy, || {
            client.get(&url).header(AUTH_HEADER, AUTH_VALUE)
        })
        .await?;
        let response = require_success(SERVICE, response).await?;
        response.json().await.map_err(|source| ClientError::Http {
            service: SERVICE,
            source,
        })
    }

    async fn run_startup_wizard(
        &self,
        client: &Client,
        config: &StackConfig,
        username: &str,
        password: &str,
    ) -> ClientResult<()> {
        let pool_name = config
            .paths
            .pool
            .file_name()
            .map_or_else(|| "pool".to_string(), |n| n.to_string_lossy().into_owned());
        let configuration = json!({
            "ServerName": format!("Convoy ({pool_name})"),
            "UICulture": "en-US",
            "MetadataCountryCode": "US",
            "PreferredMetadataLanguage": "en",
        });
        self.post_json(client, None, "/Startup/Configuration", &configuration)
            .await?;

        let remote_access = json!({
            "EnableRemoteAccess": true,
            "EnableAutomaticPortMapping": false,
        });
        self.post_json(client, None, "/Startup/RemoteAccess", &remote_access)
            .await?;

        // The wizard requires touching the first-user endpoint before the
        // admin user can be created.
        let first_user_url = format!("{}/Startup/FirstUser", self.base_url);
        let response = send_with_retry(SERVICE, self.policy, || {
            client.get(&first_user_url).header(AUTH_HEADER, AUTH_VALUE)
        })
        .await?;
        require_success(SERVICE, response).await?;

        let user = json!({"Name": username, "Password": password});
        self.post_json(client, None, "/Startup/User", &user).await?;
        self.post_json(client, None, "/Startup/Complete", &json!({}))
            .await?;
        Ok(())
    }

    async fn authenticate(
        &self,
        client: &Client,
        username: &str,
        password: &str,
    ) -> ClientResult<Option<String>> {
        let payload = json!({"Username": username, "Pw": password});
        let body = self
            .post_json(client, None, "/Users/AuthenticateByName", &payload)
            .await?;
        let token = body
            .get("AccessToken")
            .and_then(Value::as_str)
            .map(String::from);
        if token.is_none() {
            debug!("Jellyfin authentication succeeded without access token");
        }
        Ok(token)
    }

    async fn ensure_libraries(
        &self,
        client: &Client,
        token: &str,
    ) -> ClientResult<(bool, String)> {
        let url = format!("{}/Library/VirtualFolders", self.base_url);
        let response = send_with_retry(SERVICE, self.policy, || {
            client
                .get(&url)
                .header(AUTH_HEADER, AUTH_VALUE)
                .header("X-Emby-Token", token)
        })
        .await?;
        let response = require_success(SERVICE, response).await?;
        let existing: Value = response.json().await.map_err(|source| ClientError::Http {
            service: SERVICE,
            source,
        })?;

        let mut created = Vec::new();
        for (name, collection_type, path) in LIBRARIES {
            if library_exists(&existing, path) {
                continue;
            }
            info!(library = name, path, "creating Jellyfin library");
            let query_url = format!(
                "{}/Library/VirtualFolders?name={}&collectionType={}&Paths={}&refreshLibrary=false",
                self.base_url,
                urlencoding::encode(name),
                urlencoding::encode(collection_type),
                urlencoding::encode(path),
            );
            let payload = json!({"LibraryOptions": {}});
            let response = send_with_retry(SERVICE, self.policy, || {
                client
                    .post(&query_url)
                    .header(AUTH_HEADER, AUTH_VALUE)
                    .header("X-Emby-Token", token)
                    .json(&payload)
            })
            .await?;
            require_success(SERVICE, response).await?;
            created.push(name);
        }

        if created.is_empty() {
            Ok((false, "libraries=ready".to_string()))
        } else {
            Ok((true, format!("libraries=created:{}", created.join(","))))
        }
    }

    async fn post_json(
        &self,
        client: &Client,
        token: Option<&str>,
        path: &str,
        payload: &Value,
    ) -> ClientResult<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = send_with_retry(SERVICE, self.policy, || {
            let mut request = client
                .post(&url)
                .header(AUTH_HEADER, AUTH_VALUE)
                .json(payload);
            if let Some(token) = token {
                request = request.header("X-Emby-Token", token);
            }
            request
        })
        .await?;
        let response = require_success(SERVICE, response).await?;
        let bytes = response.bytes().await.map_err(|source| ClientError::Http {
            service: SERVICE,
            source,
        })?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn run_verify(&self, _config: &StackConfig) -> ClientResult<Outcome> {
        let (username, password) = self.admin_credentials()?;
        let client = build_client(Duration::from_secs(20))?;

        let status = self.get_public_info(&client).await?;
        if !status
            .get("StartupWizardCompleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Ok(Outcome::failed("startup wizard incomplete"));
        }

        let Some(token) = self.authenticate(&client, &username, &password).await? else {
            return Ok(Outcome::failed("authentication failed (no token returned)"));
        };

        let url = format!("{}/Library/VirtualFolders", self.base_url);
        let response = send_with_retry(SERVICE, self.policy, || {
            client
                .get(&url)
                .header(AUTH_HEADER, AUTH_VALUE)
                .header("X-Emby-Token", &token)
        })
        .await?;
        let response = require_success(SERVICE, response).await?;
        let existing: Value = response.json().await.map_err(|source| ClientError::Http {
            service: SERVICE,
            source,
        })?;

        let missing: Vec<&str> = LIBRARIES
            .iter()
            .filter(|(_, _, path)| !library_exists(&existing, path))
            .map(|(name, _, _)| *name)
            .collect();
        if missing.is_empty() {
            Ok(Outcome::ok("libraries ok"))
        } else {
            Ok(Outcome::failed(format!(
                "missing libraries: {}",
                missing.join(", ")
            )))
        }
    }
}

#[async_trait]
impl ServiceClient for JellyfinClient {
    fn name(&self) -> ServiceName {
        ServiceName::Jellyfin
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

fn library_exists(existing: &Value, path: &str) -> bool {
    existing
        .as_array()
        .into_iter()
        .flatten()
        .any(|entry| {
            entry
                .get("Locations")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .any(|location| location.as_str() == Some(path))
        })
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

    #[test]
    fn library_lookup_matches_on_location() {
        let existing = json!([
            {"Name": "Movies", "Locations": ["/data/media/movies"]},
            {"Name": "Shows", "Locations": []}
        ]);
        assert!(library_exists(&existing, "/data/media/movies"));
        assert!(!library_exists(&existing, "/data/media/tv"));
    }

    #[tokio::test]
    async fn ensure_runs_wizard_and_creates_libraries() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/System/Ping");
            then.status(200).body("\"Jellyfin Server\"");
        });
        server.mock(|when, then| {
            when.method(GET).path("/System/Info/Public");
            then.status(200)
                .json_body(json!({"StartupWizardCompleted": false}));
        });
        let startup_config = server.mock(|when, then| {
            when.method(POST).path("/Startup/Configuration");
            then.status(204);
        });
        server.mock(|when, then| {
            when.method(POST).path("/Startup/RemoteAccess");
            then.status(204);
        });
        server.mock(|when, then| {
            when.method(GET).path("/Startup/FirstUser");
            then.status(200).json_body(json!({"Name": ""}));
        });
        let startup_user = server.mock(|when, then| {
            when.method(POST).path("/Startup/User");
            then.status(204);
        });
        server.mock(|when, then| {
            when.method(POST).path("/Startup/Complete");
            then.status(204);
        });
        server.mock(|when, then| {
            when.method(POST).path("/Users/AuthenticateByName");
            then.status(200).json_body(json!({"AccessToken": "tok"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/Library/VirtualFolders");
            then.status(200).json_body(json!([]));
        });
        let create_library = server.mock(|when, then| {
            when.method(POST).path("/Library/VirtualFolders");
            then.status(204);
        });

        let client = JellyfinClient::new(store).with_base_url(server.base_url());
        let outcome = client.ensure(&test_config(&dir)).await;
        assert!(outcome.success, "{}", outcome.detail);
        assert!(outcome.changed);
        assert!(outcome.detail.contains("startup=completed"));
        assert!(outcome.detail.contains("libraries=created:Movies,TV,Anime"));

        startup_config.assert();
        startup_user.assert();
        assert_eq!(create_library.hits(), 3);
    }

    #[tokio::test]
    async fn ensure_skips_completed_wizard_and_existing_libraries() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/System/Ping");
            then.status(200).body("\"Jellyfin Server\"");
        });
        server.mock(|when, then| {
            when.method(GET).path("/System/Info/Public");
            then.status(200)
                .json_body(json!({"StartupWizardCompleted": true}));
        });
        server.mock(|when, then| {
            when.method(POST).path("/Users/AuthenticateByName");
            then.status(200).json_body(json!({"AccessToken": "tok"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/Library/VirtualFolders");
            then.status(200).json_body(json!([
                {"Locations": ["/data/media/movies"]},
                {"Locations": ["/data/media/tv"]},
                {"Locations": ["/data/media/anime"]}
            ]));
        });

        let client = JellyfinClient::new(store).with_base_url(server.base_url());
        let outcome = client.ensure(&test_config(&dir)).await;
        assert!(outcome.success, "{}", outcome.detail);
        assert!(!outcome.changed, "nothing to do on a converged server");
        assert_eq!(outcome.detail, "libraries=ready");
    }
}
