//! Fixed service topology shared across the workspace.
//!
//! Internal container ports, container names, and API prefixes live here so
//! they are not scattered across individual clients. Host-visible ports come
//! from the configuration document and may differ.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Highest configuration document version this build understands.
pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

/// Container path for completed downloads inside the torrent container.
pub const DOWNLOADS_COMPLETE: &str = "/downloads/complete";
/// Container path for in-flight downloads inside the torrent container.
pub const DOWNLOADS_INCOMPLETE: &str = "/downloads/incomplete";
/// Movie library path as seen by the library managers and the media server.
pub const MEDIA_MOVIES: &str = "/data/media/movies";
/// TV library path as seen by the library managers and the media server.
pub const MEDIA_TV: &str = "/data/media/tv";
/// Anime library path as seen by the library managers and the media server.
pub const MEDIA_ANIME: &str = "/data/media/anime";

/// The fixed set of managed services, in dependency-safe configure order.
pub const SERVICE_ORDER: [ServiceName; 7] = [
    ServiceName::Qbittorrent,
    ServiceName::Radarr,
    ServiceName::Sonarr,
    ServiceName::Prowlarr,
    ServiceName::Jellyfin,
    ServiceName::Jellyseerr,
    ServiceName::Pipeline,
];

/// Identifier for a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    /// Torrent download worker.
    Qbittorrent,
    /// Movie library manager.
    Radarr,
    /// TV library manager.
    Sonarr,
    /// Indexer aggregator.
    Prowlarr,
    /// Media server.
    Jellyfin,
    /// Request broker.
    Jellyseerr,
    /// Media post-processing worker (no container port of its own).
    Pipeline,
}

impl ServiceName {
    /// Lowercase identifier used in config keys, stage names, and state files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Qbittorrent => "qbittorrent",
            Self::Radarr => "radarr",
            Self::Sonarr => "sonarr",
            Self::Prowlarr => "prowlarr",
            Self::Jellyfin => "jellyfin",
            Self::Jellyseerr => "jellyseerr",
            Self::Pipeline => "pipeline",
        }
    }

    /// Container name on the compose network, when the service runs in one.
    #[must_use]
    pub const fn container_name(self) -> Option<&'static str> {
        match self {
            Self::Pipeline => None,
            other => Some(other.as_str()),
        }
    }

    /// Port the service listens on inside its container.
    ///
    /// These are fixed by the container images; only the host mapping is
    /// user-configurable.
    #[must_use]
    pub const fn internal_port(self) -> Option<u16> {
        match self {
            Self::Qbittorrent => Some(8080),
            Self::Radarr => Some(7878),
            Self::Sonarr => Some(8989),
            Self::Prowlarr => Some(9696),
            Self::Jellyfin => Some(8096),
            Self::Jellyseerr => Some(5055),
            Self::Pipeline => None,
        }
    }

    /// API path prefix for the service's management API.
    #[must_use]
    pub const fn api_prefix(self) -> &'static str {
        match self {
            Self::Radarr | Self::Sonarr => "/api/v3",
            Self::Prowlarr | Self::Jellyseerr => "/api/v1",
            Self::Qbittorrent => "/api/v2",
            Self::Jellyfin | Self::Pipeline => "",
        }
    }

    /// Upstream services that must be configured before this one.
    #[must_use]
    pub const fn dependencies(self) -> &'static [Self] {
        match self {
            Self::Qbittorrent | Self::Jellyfin | Self::Pipeline => &[],
            Self::Radarr | Self::Sonarr => &[Self::Qbittorrent],
            Self::Prowlarr => &[Self::Radarr, Self::Sonarr],
            Self::Jellyseerr => &[Self::Radarr, Self::Sonarr, Self::Jellyfin],
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qbittorrent" => Ok(Self::Qbittorrent),
            "radarr" => Ok(Self::Radarr),
            "sonarr" => Ok(Self::Sonarr),
            "prowlarr" => Ok(Self::Prowlarr),
            "jellyfin" => Ok(Self::Jellyfin),
            "jellyseerr" => Ok(Self::Jellyseerr),
            "pipeline" => Ok(Self::Pipeline),
            other => Err(ConfigError::UnknownService {
                name: other.to_string(),
            }),
        }
    }
}
