//! Invariant validation for the configuration document.
//!
//! This enforces the structural rules of the document itself. Preflight
//! checks against the live host (path existence, port probes) belong to the
//! converge validator, not here.

use crate::constants::{SERVICE_ORDER, SUPPORTED_CONFIG_VERSION};
use crate::error::{ConfigError, ConfigResult};
use crate::model::{MediaPolicyEntry, StackConfig};

/// Validate every document invariant.
///
/// # Errors
///
/// Returns the first violated invariant: unsupported version, relative path,
/// zero or duplicated host port, malformed language token, or an empty
/// download category label.
pub fn validate_document(config: &StackConfig) -> ConfigResult<()> {
    if config.version > SUPPORTED_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion {
            found: config.version,
            supported: SUPPORTED_CONFIG_VERSION,
        });
    }

    check_absolute("paths.pool", &config.paths.pool)?;
    check_absolute("paths.appdata", &config.paths.appdata)?;
    if let Some(scratch) = &config.paths.scratch {
        check_absolute("paths.scratch", scratch)?;
    }

    let mut claimed: Vec<(u16, &'static str)> = Vec::new();
    for service in SERVICE_ORDER {
        let settings = config.services.settings(service);
        if !settings.enabled {
            continue;
        }
        let Some(port) = settings.port else { continue };
        if port == 0 {
            return Err(ConfigError::InvalidPort {
                service: service.as_str(),
            });
        }
        if let Some((_, first)) = claimed.iter().find(|(claimed_port, _)| *claimed_port == port) {
            return Err(ConfigError::PortConflict {
                port,
                first,
                second: service.as_str(),
            });
        }
        claimed.push((port, service.as_str()));
    }

    check_policy_entry("media_policy.movies", &config.media_policy.movies)?;
    check_policy_entry("media_policy.anime", &config.media_policy.anime)?;

    let categories = &config.download_policy.categories;
    for (field, value) in [
        ("download_policy.categories.radarr", &categories.radarr),
        ("download_policy.categories.sonarr", &categories.sonarr),
        ("download_policy.categories.anime", &categories.anime),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyCategory { field });
        }
    }

    Ok(())
}

fn check_absolute(field: &'static str, path: &std::path::Path) -> ConfigResult<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(ConfigError::RelativePath {
            field,
            value: path.display().to_string(),
        })
    }
}

fn check_policy_entry(prefix: &'static str, entry: &MediaPolicyEntry) -> ConfigResult<()> {
    for code in &entry.keep_audio {
        if !is_language_code(code) {
            return Err(ConfigError::InvalidLanguageCode {
                field: prefix,
                code: code.clone(),
            });
        }
    }
    for code in &entry.keep_subs {
        if code == "forced" {
            continue;
        }
        if !is_language_code(code) {
            return Err(ConfigError::InvalidLanguageCode {
                field: prefix,
                code: code.clone(),
            });
        }
    }
    Ok(())
}

/// A valid token is a lowercase three-letter ISO-639-2 code; `und` is already
/// of that shape.
fn is_language_code(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StackConfig;

    fn valid_config() -> StackConfig {
        StackConfig::with_paths("/mnt/pool".into(), "/mnt/appdata".into(), None)
    }

    #[test]
    fn accepts_default_document() {
        validate_document(&valid_config()).expect("default document is valid");
    }

    #[test]
    fn rejects_future_version() {
        let mut config = valid_config();
        config.version = SUPPORTED_CONFIG_VERSION + 1;
        assert!(matches!(
            validate_document(&config),
            Err(ConfigError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn rejects_relative_pool() {
        let mut config = valid_config();
        config.paths.pool = "pool".into();
        assert!(matches!(
            validate_document(&config),
            Err(ConfigError::RelativePath {
                field: "paths.pool",
                ..
            })
        ));
    }

    #[test]
    fn rejects_duplicate_ports_only_among_enabled() {
        let mut config = valid_config();
        config.services.radarr.port = 8080;
        assert!(matches!(
            validate_document(&config),
            Err(ConfigError::PortConflict { port: 8080, .. })
        ));

        config.services.qbittorrent.enabled = false;
        validate_document(&config).expect("disabled services release their ports");
    }

    #[test]
    fn rejects_uppercase_language_token() {
        let mut config = valid_config();
        config.media_policy.movies.keep_audio = vec!["ENG".to_string()];
        assert!(matches!(
            validate_document(&config),
            Err(ConfigError::InvalidLanguageCode { .. })
        ));
    }

    #[test]
    fn forced_token_is_legal_in_subs_only() {
        let mut config = valid_config();
        config.media_policy.movies.keep_subs = vec!["eng".to_string(), "forced".to_string()];
        validate_document(&config).expect("forced is a legal subtitle token");

        config.media_policy.movies.keep_audio = vec!["forced".to_string()];
        assert!(matches!(
            validate_document(&config),
            Err(ConfigError::InvalidLanguageCode { .. })
        ));
    }

    #[test]
    fn rejects_blank_category() {
        let mut config = valid_config();
        config.download_policy.categories.sonarr = "  ".to_string();
        assert!(matches!(
            validate_document(&config),
            Err(ConfigError::EmptyCategory { .. })
        ));
    }
}
