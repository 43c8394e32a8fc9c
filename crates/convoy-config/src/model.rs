//! Typed configuration document and its subtrees.
//!
//! # Design
//! - Pure data carriers; IO and invariant enforcement live elsewhere.
//! - Serde defaults mirror the values a fresh install starts from, so a
//!   minimal document (paths only) deserialises into a working stack.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::ServiceName;

/// Host directory layout the stack operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Media library root. Absolute, required.
    pub pool: PathBuf,
    /// Download and post-processing staging area. Absolute when present.
    #[serde(default)]
    pub scratch: Option<PathBuf>,
    /// Per-service configuration directories. Absolute, required.
    pub appdata: PathBuf,
}

/// POSIX identity and timezone the containers run as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Numeric uid passed to every container.
    pub user_id: u32,
    /// Numeric gid passed to every container.
    pub group_id: u32,
    /// IANA timezone string.
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            user_id: 1000,
            group_id: 1000,
            timezone: "UTC".to_string(),
        }
    }
}

/// Category labels shared between the torrent client and the library managers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadCategories {
    /// Label for movie downloads.
    pub radarr: String,
    /// Label for TV downloads.
    pub sonarr: String,
    /// Label for anime downloads.
    pub anime: String,
}

impl Default for DownloadCategories {
    fn default() -> Self {
        Self {
            radarr: "movies".to_string(),
            sonarr: "tv".to_string(),
            anime: "anime".to_string(),
        }
    }
}

/// Download routing policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadPolicy {
    /// Named download categories.
    pub categories: DownloadCategories,
}

/// Track-retention lists for one content class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaPolicyEntry {
    /// ISO-639-2 audio languages to keep, in preference order.
    pub keep_audio: Vec<String>,
    /// ISO-639-2 subtitle languages to keep; the token `forced` additionally
    /// keeps any track whose forced disposition is set.
    pub keep_subs: Vec<String>,
}

impl Default for MediaPolicyEntry {
    fn default() -> Self {
        Self {
            keep_audio: vec!["eng".to_string(), "und".to_string()],
            keep_subs: vec!["eng".to_string()],
        }
    }
}

/// Per content class track-retention policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaPolicy {
    /// Policy applied to movie downloads.
    pub movies: MediaPolicyEntry,
    /// Policy applied to anime downloads.
    pub anime: MediaPolicyEntry,
}

impl Default for MediaPolicy {
    fn default() -> Self {
        Self {
            movies: MediaPolicyEntry::default(),
            anime: MediaPolicyEntry {
                keep_audio: vec!["jpn".to_string(), "eng".to_string(), "und".to_string()],
                keep_subs: vec!["eng".to_string()],
            },
        }
    }
}

/// Named quality presets offered by the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityPreset {
    /// Prefer 1080p releases.
    #[serde(rename = "1080p")]
    Hd,
    /// Prefer 4k releases.
    #[serde(rename = "4k")]
    Uhd,
    /// Let the library managers pick.
    #[default]
    #[serde(rename = "balanced")]
    Balanced,
}

impl QualityPreset {
    /// Token used when matching quality profile names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hd => "1080p",
            Self::Uhd => "4k",
            Self::Balanced => "balanced",
        }
    }
}

/// Target resolution presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionPreset {
    /// 1280x720.
    #[serde(rename = "720p")]
    P720,
    /// 1920x1080.
    #[serde(rename = "1080p")]
    P1080,
    /// 2560x1440.
    #[serde(rename = "1440p")]
    P1440,
    /// 3840x2160.
    #[serde(rename = "2160p")]
    P2160,
}

impl ResolutionPreset {
    /// Token used when matching quality profile names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::P720 => "720p",
            Self::P1080 => "1080p",
            Self::P1440 => "1440p",
            Self::P2160 => "2160p",
        }
    }
}

/// Quality preferences applied to the library managers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Named preset.
    pub preset: QualityPreset,
    /// Optional resolution override; wins over the preset when matching
    /// quality profiles.
    pub target_resolution: Option<ResolutionPreset>,
    /// Optional bitrate ceiling in Mbps.
    pub max_bitrate_mbps: Option<u32>,
    /// Preferred container extension for remuxed output.
    pub preferred_container: String,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            preset: QualityPreset::Balanced,
            target_resolution: None,
            max_bitrate_mbps: None,
            preferred_container: "mkv".to_string(),
        }
    }
}

/// Port the orchestrator's own UI binds to. Served out of process; carried
/// here so the validator can check it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// Host port for the UI.
    pub port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { port: 8443 }
    }
}

/// Reverse proxy (Traefik) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Whether the proxy container is part of the stack.
    pub enabled: bool,
    /// Image tag to deploy.
    pub image: String,
    /// HTTP entrypoint port.
    pub http_port: u16,
    /// HTTPS entrypoint port; TLS assets are only prepared when set.
    pub https_port: Option<u16>,
    /// Whether the Traefik dashboard is exposed.
    pub dashboard: bool,
    /// Extra command-line arguments appended verbatim.
    pub additional_args: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "traefik:v3.1".to_string(),
            http_port: 80,
            https_port: None,
            dashboard: false,
            additional_args: Vec::new(),
        }
    }
}

/// Torrent client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QbittorrentConfig {
    /// Whether the service is part of the stack.
    pub enabled: bool,
    /// Host-visible port.
    pub port: u16,
    /// Hostname routed through the reverse proxy, when any.
    pub proxy_url: Option<String>,
    /// Stop seeding once the download completes (ratio limit 0).
    pub stop_after_download: bool,
    /// Web UI username the orchestrator enforces.
    pub username: String,
    /// Web UI password the orchestrator enforces.
    pub password: String,
}

impl Default for QbittorrentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
            proxy_url: None,
            stop_after_download: true,
            username: "admin".to_string(),
            password: "adminadmin".to_string(),
        }
    }
}

macro_rules! simple_service_config {
    ($(#[$doc:meta])* $name:ident, $port:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct $name {
            /// Whether the service is part of the stack.
            pub enabled: bool,
            /// Host-visible port.
            pub port: u16,
            /// Hostname routed through the reverse proxy, when any.
            pub proxy_url: Option<String>,
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    enabled: true,
                    port: $port,
                    proxy_url: None,
                }
            }
        }
    };
}

simple_service_config!(
    /// Movie library manager settings.
    RadarrConfig,
    7878
);
simple_service_config!(
    /// TV library manager settings.
    SonarrConfig,
    8989
);
simple_service_config!(
    /// Request broker settings.
    JellyseerrConfig,
    5055
);
simple_service_config!(
    /// Media server settings.
    JellyfinConfig,
    8096
);

/// Indexer aggregator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProwlarrConfig {
    /// Whether the service is part of the stack.
    pub enabled: bool,
    /// Host-visible port.
    pub port: u16,
    /// Hostname routed through the reverse proxy, when any.
    pub proxy_url: Option<String>,
    /// When true, auto-populated indexers must match the user's audio
    /// language preferences; when false every public Movies/TV indexer
    /// qualifies.
    pub language_filter: bool,
}

impl Default for ProwlarrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9696,
            proxy_url: None,
            language_filter: true,
        }
    }
}

/// Media post-processing worker settings. Runs on the host, so it carries no
/// default port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Whether the worker runs.
    pub enabled: bool,
    /// Optional host port (unused by the worker itself).
    pub port: Option<u16>,
    /// Hostname routed through the reverse proxy, when any.
    pub proxy_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: None,
            proxy_url: None,
        }
    }
}

/// Generic view of one service's toggles, for code that iterates the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings<'a> {
    /// Whether the service is part of the stack.
    pub enabled: bool,
    /// Host-visible port, when the service exposes one.
    pub port: Option<u16>,
    /// Hostname routed through the reverse proxy, when any.
    pub proxy_url: Option<&'a str>,
}

/// The fixed services map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Torrent client.
    pub qbittorrent: QbittorrentConfig,
    /// Movie library manager.
    pub radarr: RadarrConfig,
    /// TV library manager.
    pub sonarr: SonarrConfig,
    /// Indexer aggregator.
    pub prowlarr: ProwlarrConfig,
    /// Request broker.
    pub jellyseerr: JellyseerrConfig,
    /// Media server.
    pub jellyfin: JellyfinConfig,
    /// Post-processing worker.
    pub pipeline: PipelineConfig,
}

impl ServicesConfig {
    /// Uniform view of one service's enable flag, port, and proxy hostname.
    #[must_use]
    pub fn settings(&self, service: ServiceName) -> ServiceSettings<'_> {
        match service {
            ServiceName::Qbittorrent => ServiceSettings {
                enabled: self.qbittorrent.enabled,
                port: Some(self.qbittorrent.port),
                proxy_url: self.qbittorrent.proxy_url.as_deref(),
            },
            ServiceName::Radarr => ServiceSettings {
                enabled: self.radarr.enabled,
                port: Some(self.radarr.port),
                proxy_url: self.radarr.proxy_url.as_deref(),
            },
            ServiceName::Sonarr => ServiceSettings {
                enabled: self.sonarr.enabled,
                port: Some(self.sonarr.port),
                proxy_url: self.sonarr.proxy_url.as_deref(),
            },
            ServiceName::Prowlarr => ServiceSettings {
                enabled: self.prowlarr.enabled,
                port: Some(self.prowlarr.port),
                proxy_url: self.prowlarr.proxy_url.as_deref(),
            },
            ServiceName::Jellyseerr => ServiceSettings {
                enabled: self.jellyseerr.enabled,
                port: Some(self.jellyseerr.port),
                proxy_url: self.jellyseerr.proxy_url.as_deref(),
            },
            ServiceName::Jellyfin => ServiceSettings {
                enabled: self.jellyfin.enabled,
                port: Some(self.jellyfin.port),
                proxy_url: self.jellyfin.proxy_url.as_deref(),
            },
            ServiceName::Pipeline => ServiceSettings {
                enabled: self.pipeline.enabled,
                port: self.pipeline.port,
                proxy_url: self.pipeline.proxy_url.as_deref(),
            },
        }
    }
}

/// Role assigned to an orchestrator user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// Full control, including destructive operations.
    Owner,
    /// Administrative control.
    Admin,
    /// Can edit configuration.
    Editor,
    /// Read-only access.
    Viewer,
}

impl UserRole {
    /// Lowercase string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }
}

/// An orchestrator user declared in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    /// Login name.
    pub username: String,
    /// Optional contact address.
    #[serde(default)]
    pub email: Option<String>,
    /// Assigned role.
    pub role: UserRole,
}

fn default_version() -> u32 {
    1
}

/// The root declarative document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    /// Monotonically increasing document version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Host directory layout.
    pub paths: PathsConfig,
    /// Managed services map.
    #[serde(default)]
    pub services: ServicesConfig,
    /// Reverse proxy settings.
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Download routing policy.
    #[serde(default)]
    pub download_policy: DownloadPolicy,
    /// Track-retention policies.
    #[serde(default)]
    pub media_policy: MediaPolicy,
    /// Quality preferences.
    #[serde(default)]
    pub quality: QualityConfig,
    /// Orchestrator UI settings.
    #[serde(default)]
    pub ui: UiConfig,
    /// Container runtime identity.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Declared users.
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

impl StackConfig {
    /// Build a document with default services rooted at the given paths.
    #[must_use]
    pub fn with_paths(pool: PathBuf, appdata: PathBuf, scratch: Option<PathBuf>) -> Self {
        Self {
            version: default_version(),
            paths: PathsConfig {
                pool,
                scratch,
                appdata,
            },
            services: ServicesConfig::default(),
            proxy: ProxyConfig::default(),
            download_policy: DownloadPolicy::default(),
            media_policy: MediaPolicy::default(),
            quality: QualityConfig::default(),
            ui: UiConfig::default(),
            runtime: RuntimeConfig::default(),
            users: Vec::new(),
        }
    }

    /// Media policy entry for a download category label, if the label belongs
    /// to the download policy.
    #[must_use]
    pub fn media_policy_for_category(&self, category: &str) -> Option<&MediaPolicyEntry> {
        let categories = &self.download_policy.categories;
        if category == categories.anime {
            Some(&self.media_policy.anime)
        } else if category == categories.radarr || category == categories.sonarr {
            Some(&self.media_policy.movies)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_fills_defaults() {
        let yaml = "paths:\n  pool: /mnt/pool\n  appdata: /mnt/appdata\n";
        let config: StackConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.version, 1);
        assert!(config.services.qbittorrent.enabled);
        assert_eq!(config.services.sonarr.port, 8989);
        assert_eq!(config.download_policy.categories.sonarr, "tv");
        assert_eq!(config.media_policy.anime.keep_audio[0], "jpn");
        assert_eq!(config.quality.preferred_container, "mkv");
        assert!(config.paths.scratch.is_none());
    }

    #[test]
    fn document_round_trips() {
        let mut config = StackConfig::with_paths(
            PathBuf::from("/mnt/pool"),
            PathBuf::from("/mnt/appdata"),
            Some(PathBuf::from("/mnt/scratch")),
        );
        config.services.radarr.port = 7879;
        config.proxy.enabled = true;
        config.proxy.https_port = Some(443);
        config.users.push(UserEntry {
            username: "ops".to_string(),
            email: None,
            role: UserRole::Admin,
        });

        let yaml = serde_yaml::to_string(&config).expect("serialise");
        let reparsed: StackConfig = serde_yaml::from_str(&yaml).expect("reparse");
        assert_eq!(reparsed, config);
    }

    #[test]
    fn settings_view_matches_typed_fields() {
        let mut config = StackConfig::with_paths("/p".into(), "/a".into(), None);
        config.services.prowlarr.enabled = false;
        let view = config.services.settings(ServiceName::Prowlarr);
        assert!(!view.enabled);
        assert_eq!(view.port, Some(9696));
        assert_eq!(
            config.services.settings(ServiceName::Pipeline).port,
            None,
            "pipeline exposes no port by default"
        );
    }

    #[test]
    fn category_policy_lookup() {
        let config = StackConfig::with_paths("/p".into(), "/a".into(), None);
        assert_eq!(
            config.media_policy_for_category("anime").unwrap().keep_audio[0],
            "jpn"
        );
        assert!(config.media_policy_for_category("movies").is_some());
        assert!(config.media_policy_for_category("books").is_none());
    }
}
