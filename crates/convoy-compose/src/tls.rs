//! Reverse-proxy TLS asset preparation.
//!
//! When HTTPS is enabled, the proxy needs a self-signed certificate covering
//! every hostname routed through it, plus a Traefik TLS configuration
//! document. The certificate is reused across applies while the hostname set
//! is unchanged; a sidecar metadata file records the set it was minted for.

use std::fs;
use std::path::Path;

use convoy_config::constants::SERVICE_ORDER;
use convoy_config::{PathMap, StackConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ComposeError, ComposeResult};
use crate::proc::CommandRunner;

const CERT_FILE: &str = "local.crt";
const KEY_FILE: &str = "local.key";
const METADATA_FILE: &str = "metadata.json";
const TLS_CONFIG_FILE: &str = "tls.yml";
const FALLBACK_HOSTNAME: &str = "convoy.local";
const CERT_DAYS: &str = "825";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct CertMetadata {
    hostnames: Vec<String>,
}

/// Ensure TLS assets exist for the proxy when HTTPS is enabled.
///
/// Returns `(changed, detail)`.
///
/// # Errors
///
/// Returns an error when directories or files cannot be written, or when the
/// `openssl` invocation fails.
pub async fn ensure_proxy_assets(
    config: &StackConfig,
    paths: &PathMap,
) -> ComposeResult<(bool, String)> {
    if !config.proxy.enabled {
        return Ok((false, "skipped (proxy disabled)".to_string()));
    }
    if config.proxy.https_port.is_none() {
        return Ok((false, "skipped (https disabled)".to_string()));
    }

    let traefik_dir = paths.translate(&config.paths.appdata).join("traefik");
    let certs_dir = traefik_dir.join("certs");
    fs::create_dir_all(&certs_dir)
        .map_err(|source| ComposeError::io("tls.create_certs_dir", &certs_dir, source))?;

    let mut hostnames = collect_proxy_hostnames(config);
    if hostnames.is_empty() {
        hostnames.push(FALLBACK_HOSTNAME.to_string());
    }

    let mut changed = false;
    if ensure_self_signed_cert(&certs_dir, &hostnames).await? {
        changed = true;
    }
    if ensure_tls_config(&traefik_dir)? {
        changed = true;
    }

    let detail = format!("tls assets ready ({})", hostnames.join(", "));
    Ok((changed, detail))
}

/// Hostnames of every service routed through the proxy, sorted and deduped.
fn collect_proxy_hostnames(config: &StackConfig) -> Vec<String> {
    let mut hostnames: Vec<String> = SERVICE_ORDER
        .iter()
        .filter_map(|service| config.services.settings(*service).proxy_url)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
        .collect();
    hostnames.sort();
    hostnames.dedup();
    hostnames
}

async fn ensure_self_signed_cert(certs_dir: &Path, hostnames: &[String]) -> ComposeResult<bool> {
    let cert_path = certs_dir.join(CERT_FILE);
    let key_path = certs_dir.join(KEY_FILE);
    let metadata_path = certs_dir.join(METADATA_FILE);

    let desired = CertMetadata {
        hostnames: hostnames.to_vec(),
    };

    if cert_path.exists() && key_path.exists() && metadata_path.exists() {
        let current = fs::read_to_string(&metadata_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<CertMetadata>(&raw).ok());
        if current.as_ref() == Some(&desired) {
            return Ok(false);
        }
    }

    let san = hostnames
        .iter()
        .map(|hostname| format!("DNS:{hostname}"))
        .collect::<Vec<_>>()
        .join(",");
    let subject = format!("/CN={}", hostnames[0]);
    let san_ext = format!("subjectAltName={san}");
    let key_str = key_path.display().to_string();
    let cert_str = cert_path.display().to_string();

    let runner = CommandRunner::default();
    runner
        .run_checked(
            "openssl",
            &[
                "req",
                "-x509",
                "-newkey",
                "rsa:4096",
                "-sha256",
                "-days",
                CERT_DAYS,
                "-nodes",
                "-keyout",
                &key_str,
                "-out",
                &cert_str,
                "-subj",
                &subject,
                "-addext",
                &san_ext,
            ],
        )
        .await?;

    let rendered =
        serde_json::to_string_pretty(&desired).map_err(|source| ComposeError::Json {
            operation: "tls.serialise_metadata",
            path: metadata_path.clone(),
            source,
        })?;
    fs::write(&metadata_path, rendered)
        .map_err(|source| ComposeError::io("tls.write_metadata", &metadata_path, source))?;
    info!(hostnames = ?hostnames, "minted self-signed proxy certificate");
    Ok(true)
}

fn ensure_tls_config(traefik_dir: &Path) -> ComposeResult<bool> {
    let tls_path = traefik_dir.join(TLS_CONFIG_FILE);
    let content = "tls:\n  certificates:\n    - certFile: /config/certs/local.crt\n      keyFile: /config/certs/local.key\n  stores:\n    default:\n      defaultCertificate:\n        certFile: /config/certs/local.crt\n        keyFile: /config/certs/local.key\n";

    if tls_path.exists() {
        let current = fs::read_to_string(&tls_path)
            .map_err(|source| ComposeError::io("tls.read_config", &tls_path, source))?;
        if current == content {
            return Ok(false);
        }
    }
    fs::write(&tls_path, content)
        .map_err(|source| ComposeError::io("tls.write_config", &tls_path, source))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_with_proxy(dir: &TempDir) -> StackConfig {
        let mut config = StackConfig::with_paths(
            dir.path().join("pool"),
            dir.path().join("appdata"),
            None,
        );
        config.proxy.enabled = true;
        config.proxy.https_port = Some(443);
        config
    }

    #[tokio::test]
    async fn disabled_proxy_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut config = config_with_proxy(&dir);
        config.proxy.enabled = false;
        let (changed, detail) = ensure_proxy_assets(&config, &PathMap::default()).await.expect("skip");
        assert!(!changed);
        assert!(detail.contains("proxy disabled"));
    }

    #[tokio::test]
    async fn http_only_proxy_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut config = config_with_proxy(&dir);
        config.proxy.https_port = None;
        let (changed, detail) = ensure_proxy_assets(&config, &PathMap::default()).await.expect("skip");
        assert!(!changed);
        assert!(detail.contains("https disabled"));
    }

    #[test]
    fn hostname_collection_dedupes_and_sorts() {
        let dir = TempDir::new().unwrap();
        let mut config = config_with_proxy(&dir);
        config.services.sonarr.proxy_url = Some("tv.lan".to_string());
        config.services.radarr.proxy_url = Some("movies.lan".to_string());
        config.services.jellyfin.proxy_url = Some("tv.lan".to_string());
        config.services.prowlarr.proxy_url = Some("  ".to_string());
        assert_eq!(collect_proxy_hostnames(&config), vec!["movies.lan", "tv.lan"]);
    }

    #[test]
    fn tls_config_write_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let traefik_dir = dir.path().join("traefik");
        fs::create_dir_all(&traefik_dir).unwrap();
        assert!(ensure_tls_config(&traefik_dir).expect("first write"));
        assert!(!ensure_tls_config(&traefik_dir).expect("second write"));
    }
}
