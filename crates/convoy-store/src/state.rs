//! Typed runtime state sections.
//!
//! Each section is persisted as its own JSON file; writes to one never
//! endanger another. Unknown fields are preserved where a section is shared
//! with external tooling by keeping the maps open-ended.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use convoy_events::StageEvent;
use serde::{Deserialize, Serialize};

/// Maximum number of apply runs retained in the run log.
pub const RUN_LOG_CAPACITY: usize = 20;

/// The five independent state sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    /// User records and active sessions.
    Auth,
    /// Per-service credentials discovered or generated by the orchestrator.
    Secrets,
    /// Per-service reconciliation bookkeeping.
    Services,
    /// Bounded ring of past apply runs.
    Runs,
    /// Ledger of torrents the media worker has handled.
    Pipeline,
}

impl Section {
    /// All sections, in migration order.
    pub const ALL: [Self; 5] = [
        Self::Auth,
        Self::Secrets,
        Self::Services,
        Self::Runs,
        Self::Pipeline,
    ];

    /// File name the section is stored under.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Auth => "auth.json",
            Self::Secrets => "secrets.json",
            Self::Services => "services.json",
            Self::Runs => "runs.json",
            Self::Pipeline => "pipeline.json",
        }
    }

    /// Key the section occupied inside the legacy monolithic state file.
    #[must_use]
    pub const fn legacy_key(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Secrets => "secrets",
            Self::Services => "services",
            Self::Runs => "runs",
            Self::Pipeline => "pipeline",
        }
    }
}

/// A stored orchestrator user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Login name.
    pub username: String,
    /// Password hash; argon2id PHC string, or the legacy `salt$sha256` form
    /// until the next successful verification rehashes it.
    pub password_hash: String,
    /// Role string (`owner`, `admin`, `editor`, `viewer`).
    pub role: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// An active UI session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque bearer token.
    pub token: String,
    /// Owning user.
    pub username: String,
    /// Role captured at login.
    pub role: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Hard expiry.
    pub expires_at: DateTime<Utc>,
    /// Elevated-privilege expiry, when sudo mode is active.
    #[serde(default)]
    pub sudo_expires_at: Option<DateTime<Utc>>,
}

/// User records and sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Section schema version.
    pub version: u32,
    /// Stored users.
    pub users: Vec<UserRecord>,
    /// Active sessions.
    pub sessions: Vec<SessionRecord>,
}

/// Credentials keyed by service then credential name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretsSection {
    /// `service → key → value`.
    pub services: BTreeMap<String, BTreeMap<String, String>>,
}

impl SecretsSection {
    /// Read one secret.
    #[must_use]
    pub fn get(&self, service: &str, key: &str) -> Option<&str> {
        self.services
            .get(service)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
    }

    /// Write one secret; returns true when the stored value changed.
    pub fn set(&mut self, service: &str, key: &str, value: impl Into<String>) -> bool {
        let value = value.into();
        let entries = self.services.entry(service.to_string()).or_default();
        if entries.get(key).is_some_and(|current| *current == value) {
            return false;
        }
        entries.insert(key.to_string(), value);
        true
    }
}

/// Reconciliation bookkeeping for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceState {
    /// Movie root folder id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_folder_id: Option<i64>,
    /// TV root folder id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_tv_id: Option<i64>,
    /// Anime root folder id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_anime_id: Option<i64>,
    /// Download client id inside the service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_client_id: Option<i64>,
    /// Username last pushed to the download client linkage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_client_username: Option<String>,
    /// Password last pushed to the download client linkage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_client_password: Option<String>,
    /// One-shot gate for indexer auto-population.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub indexers_populated: bool,
}

/// Per-service reconciliation bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServicesSection {
    /// `service → bookkeeping`.
    pub services: BTreeMap<String, ServiceState>,
}

impl ServicesSection {
    /// Mutable bookkeeping entry for a service, created on first access.
    pub fn entry(&mut self, service: &str) -> &mut ServiceState {
        self.services.entry(service.to_string()).or_default()
    }

    /// Bookkeeping entry for a service, when present.
    #[must_use]
    pub fn get(&self, service: &str) -> Option<&ServiceState> {
        self.services.get(service)
    }
}

/// One recorded apply run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: String,
    /// Terminal result; `None` while the run is in flight.
    #[serde(default)]
    pub ok: Option<bool>,
    /// Ordered stage events.
    #[serde(default)]
    pub events: Vec<StageEvent>,
    /// Terminal summary.
    #[serde(default)]
    pub summary: Option<String>,
}

impl RunRecord {
    /// Fresh in-flight record.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ok: None,
            events: Vec::new(),
            summary: None,
        }
    }
}

/// Bounded run history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunsSection {
    /// Oldest-first run records.
    pub runs: Vec<RunRecord>,
}

impl RunsSection {
    /// Append a record, evicting the oldest entries beyond
    /// [`RUN_LOG_CAPACITY`].
    pub fn push(&mut self, record: RunRecord) {
        self.runs.push(record);
        if self.runs.len() > RUN_LOG_CAPACITY {
            let excess = self.runs.len() - RUN_LOG_CAPACITY;
            self.runs.drain(..excess);
        }
    }

    /// Mutable record lookup by run id.
    pub fn find_mut(&mut self, run_id: &str) -> Option<&mut RunRecord> {
        self.runs.iter_mut().find(|record| record.run_id == run_id)
    }

    /// Record lookup by run id.
    #[must_use]
    pub fn find(&self, run_id: &str) -> Option<&RunRecord> {
        self.runs.iter().find(|record| record.run_id == run_id)
    }
}

/// Terminal pipeline status for one torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Remuxed and relocated successfully.
    Ok,
    /// The remux subprocess exited nonzero.
    FfmpegFailed,
    /// The torrent carried no usable video file.
    SkippedNoFiles,
}

impl LedgerStatus {
    /// Lowercase string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::FfmpegFailed => "ffmpeg_failed",
            Self::SkippedNoFiles => "skipped_no_files",
        }
    }

    /// Whether the worker may try this item again.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::FfmpegFailed)
    }
}

/// One ledger entry for a handled torrent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Terminal status.
    pub status: LedgerStatus,
    /// Unix timestamp of the decision.
    pub timestamp: i64,
}

/// Ledger of torrents the media worker has handled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// `torrent hash → entry`.
    pub processed: BTreeMap<String, LedgerEntry>,
}

impl PipelineSection {
    /// Whether the hash is settled: present and not retryable.
    #[must_use]
    pub fn is_settled(&self, hash: &str) -> bool {
        self.processed
            .get(hash)
            .is_some_and(|entry| !entry.status.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_events::StageStatus;

    #[test]
    fn run_log_is_bounded() {
        let mut section = RunsSection::default();
        for i in 0..(RUN_LOG_CAPACITY + 5) {
            section.push(RunRecord::new(format!("run-{i}")));
        }
        assert_eq!(section.runs.len(), RUN_LOG_CAPACITY);
        assert_eq!(section.runs[0].run_id, "run-5", "oldest entries evicted");
    }

    #[test]
    fn secrets_set_reports_change() {
        let mut secrets = SecretsSection::default();
        assert!(secrets.set("sonarr", "api_key", "abc"));
        assert!(!secrets.set("sonarr", "api_key", "abc"));
        assert!(secrets.set("sonarr", "api_key", "def"));
        assert_eq!(secrets.get("sonarr", "api_key"), Some("def"));
    }

    #[test]
    fn ledger_retry_semantics() {
        let mut pipeline = PipelineSection::default();
        pipeline.processed.insert(
            "aa".to_string(),
            LedgerEntry {
                status: LedgerStatus::FfmpegFailed,
                timestamp: 0,
            },
        );
        pipeline.processed.insert(
            "bb".to_string(),
            LedgerEntry {
                status: LedgerStatus::Ok,
                timestamp: 0,
            },
        );
        assert!(!pipeline.is_settled("aa"), "failed entries may be retried");
        assert!(pipeline.is_settled("bb"));
        assert!(!pipeline.is_settled("cc"));
    }

    #[test]
    fn run_record_round_trips_with_events() {
        let mut record = RunRecord::new("r1");
        record
            .events
            .push(StageEvent::new("validate", StageStatus::Ok, Some("checks")));
        let json = serde_json::to_string(&record).unwrap();
        let parsed: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
