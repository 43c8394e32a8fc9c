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

//! Reconciliation clients for the managed services.
//!
//! Each client implements two idempotent operations against its service's
//! HTTP management API: `ensure` drives live configuration to the declarative
//! target, `verify` asserts the target holds without mutating anything.
//! Failures are values, never panics: every client folds its errors into an
//! [`Outcome`] so the scheduler can record a stage event and move on.

pub mod arr;
pub mod error;
pub mod http;
pub mod jellyfin;
pub mod jellyseerr;
pub mod prowlarr;
pub mod qbittorrent;
pub mod radarr;
pub mod sonarr;

use async_trait::async_trait;
use convoy_config::{ServiceName, StackConfig};

pub use error::{ClientError, ClientResult};
pub use jellyfin::JellyfinClient;
pub use jellyseerr::JellyseerrClient;
pub use prowlarr::ProwlarrClient;
pub use qbittorrent::{QbApi, QbittorrentClient, TorrentFileEntry, TorrentRecord};
pub use radarr::RadarrClient;
pub use sonarr::SonarrClient;

/// Result of running `ensure` or `verify` for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Whether the operation achieved (or confirmed) the target state.
    pub success: bool,
    /// Whether any live state was mutated.
    pub changed: bool,
    /// Short human-readable detail.
    pub detail: String,
}

impl Outcome {
    /// Successful outcome without mutation.
    #[must_use]
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            changed: false,
            detail: detail.into(),
        }
    }

    /// Successful outcome that mutated live state.
    #[must_use]
    pub fn changed(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            changed: true,
            detail: detail.into(),
        }
    }

    /// Failed outcome.
    #[must_use]
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            changed: false,
            detail: detail.into(),
        }
    }

    /// Failed outcome that had already mutated some state.
    #[must_use]
    pub fn failed_after_change(detail: impl Into<String>, changed: bool) -> Self {
        Self {
            success: false,
            changed,
            detail: detail.into(),
        }
    }
}

/// Contract every service client implements; the scheduler depends only on
/// this trait.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// The service this client manages.
    fn name(&self) -> ServiceName;

    /// Bring the live service into the state demanded by the config.
    /// Idempotent; a second invocation against converged state reports
    /// `changed = false`.
    async fn ensure(&self, config: &StackConfig) -> Outcome;

    /// Assert the live state matches the config. Never mutates.
    async fn verify(&self, config: &StackConfig) -> Outcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_constructors() {
        assert!(Outcome::ok("x").success);
        assert!(!Outcome::ok("x").changed);
        assert!(Outcome::changed("x").changed);
        assert!(!Outcome::failed("x").success);
        let partial = Outcome::failed_after_change("x", true);
        assert!(!partial.success);
        assert!(partial.changed);
    }
}
