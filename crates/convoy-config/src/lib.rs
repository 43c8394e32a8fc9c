#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Declarative configuration document for the Convoy stack.
//!
//! The document describes paths, runtime identity, the fixed set of managed
//! services, download and media policies, quality preferences, and the
//! optional reverse proxy. It is a pure data model: persistence lives in
//! `convoy-store`, live reconciliation in `convoy-clients`.

pub mod constants;
pub mod error;
pub mod model;
pub mod paths;
pub mod validate;

pub use constants::{ServiceName, SUPPORTED_CONFIG_VERSION};
pub use error::{ConfigError, ConfigResult};
pub use model::{
    DownloadCategories, DownloadPolicy, JellyfinConfig, JellyseerrConfig, MediaPolicy,
    MediaPolicyEntry, PathsConfig, PipelineConfig, ProwlarrConfig, ProxyConfig, QbittorrentConfig,
    QualityConfig, QualityPreset, RadarrConfig, ResolutionPreset, RuntimeConfig, ServiceSettings,
    ServicesConfig, SonarrConfig, StackConfig, UiConfig, UserEntry, UserRole,
};
pub use paths::PathMap;
pub use validate::validate_document;
