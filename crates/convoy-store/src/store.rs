//! The file-backed configuration and state store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use convoy_config::{validate_document, PathMap, StackConfig};
use convoy_events::StageEvent;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::atomic::write_atomic;
use crate::auth::{hash_password, needs_rehash, verify_password};
use crate::error::{StoreError, StoreResult};
use crate::recover::recover_json_prefix;
use crate::state::{AuthSection, RunRecord, RunsSection, Section, SecretsSection, UserRecord};

const STACK_FILE: &str = "stack.yaml";
const LEGACY_STATE_FILE: &str = "state.json";
const GENERATED_DIR: &str = "generated";
const CORRUPT_SUFFIX: &str = "corrupted";

/// File-backed persistence for the stack configuration and runtime state.
///
/// The store is the sole mutator of its files. All writes are serialised
/// through an internal mutex and land atomically, so concurrent readers in
/// other tasks observe complete documents only.
pub struct ConfigStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Open a store rooted at `root`, creating the generated-artifact
    /// directory and splitting a legacy monolithic state file when present.
    ///
    /// # Errors
    ///
    /// Returns an error when the root or generated directory cannot be
    /// created, or when legacy migration fails to write a section.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::io("store.root", &root, source))?;
        let generated = root.join(GENERATED_DIR);
        fs::create_dir_all(&generated)
            .map_err(|source| StoreError::io("store.generated", &generated, source))?;

        let store = Self {
            root,
            write_lock: Mutex::new(()),
        };
        store.migrate_legacy_state()?;
        Ok(store)
    }

    /// Directory the store is rooted at.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory compose artifacts are rendered into.
    #[must_use]
    pub fn generated_dir(&self) -> PathBuf {
        self.root.join(GENERATED_DIR)
    }

    /// Location of the stack configuration document.
    #[must_use]
    pub fn stack_path(&self) -> PathBuf {
        self.root.join(STACK_FILE)
    }

    // ------------------------------------------------------------------ config

    /// Load and validate the stack configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConfigMissing`] when no document exists,
    /// [`StoreError::Yaml`] on malformed YAML, or a validation error when the
    /// document violates an invariant (including an unsupported version).
    pub fn load_config(&self) -> StoreResult<StackConfig> {
        let path = self.stack_path();
        if !path.exists() {
            return Err(StoreError::ConfigMissing { path });
        }
        let raw = fs::read_to_string(&path)
            .map_err(|source| StoreError::io("config.read", &path, source))?;
        let config: StackConfig = serde_yaml::from_str(&raw).map_err(|source| StoreError::Yaml {
            operation: "config.parse",
            path: path.clone(),
            source,
        })?;
        validate_document(&config)?;
        Ok(config)
    }

    /// Validate and persist the stack configuration document atomically.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid document, or an IO error on
    /// disk-full or permission failure.
    pub fn save_config(&self, config: &StackConfig) -> StoreResult<()> {
        validate_document(config)?;
        let path = self.stack_path();
        let rendered = serde_yaml::to_string(config).map_err(|source| StoreError::Yaml {
            operation: "config.serialise",
            path: path.clone(),
            source,
        })?;
        let _guard = self.lock_writes();
        write_atomic(&path, rendered.as_bytes())
    }

    // ------------------------------------------------------------------ sections

    /// Load a typed state section, recovering from corruption and returning
    /// the default when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error only for IO failures; parse failures degrade to
    /// recovery or the section default.
    pub fn load_section<T>(&self, section: Section) -> StoreResult<T>
    where
        T: DeserializeOwned + Default + Serialize,
    {
        let path = self.section_path(section);
        if !path.exists() {
            return Ok(T::default());
        }
        let raw = fs::read_to_string(&path)
            .map_err(|source| StoreError::io("section.read", &path, source))?;
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => Ok(value),
            Err(parse_err) => self.recover_section(section, &path, &raw, &parse_err),
        }
    }

    /// Persist a typed state section atomically.
    ///
    /// # Errors
    ///
    /// Returns an error when serialisation or the atomic write fails.
    pub fn save_section<T>(&self, section: Section, value: &T) -> StoreResult<()>
    where
        T: Serialize,
    {
        let path = self.section_path(section);
        let rendered =
            serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
                operation: "section.serialise",
                path: path.clone(),
                source,
            })?;
        let _guard = self.lock_writes();
        write_atomic(&path, rendered.as_bytes())
    }

    fn recover_section<T>(
        &self,
        section: Section,
        path: &Path,
        raw: &str,
        parse_err: &serde_json::Error,
    ) -> StoreResult<T>
    where
        T: DeserializeOwned + Default + Serialize,
    {
        warn!(
            section = section.file_name(),
            error = %parse_err,
            "corrupt state section detected; attempting prefix recovery"
        );
        let recovered = recover_json_prefix(raw)
            .and_then(|value| serde_json::from_value::<T>(value).ok());

        let backup = path.with_extension(format!("json.{CORRUPT_SUFFIX}"));
        if let Err(err) = fs::rename(path, &backup) {
            warn!(
                path = %path.display(),
                error = %err,
                "failed to move corrupt section aside"
            );
        } else {
            info!(backup = %backup.display(), "corrupt section moved aside");
        }

        match recovered {
            Some(value) => {
                self.save_section(section, &value)?;
                info!(section = section.file_name(), "state section recovered");
                Ok(value)
            }
            None => {
                warn!(
                    section = section.file_name(),
                    "state section unrecoverable; starting empty"
                );
                Ok(T::default())
            }
        }
    }

    fn section_path(&self, section: Section) -> PathBuf {
        self.root.join(section.file_name())
    }

    // ------------------------------------------------------------------ legacy

    /// Split a pre-section `state.json` into the five section files, then
    /// rename the legacy file so the migration never reruns.
    fn migrate_legacy_state(&self) -> StoreResult<()> {
        let legacy = self.root.join(LEGACY_STATE_FILE);
        if !legacy.exists() {
            return Ok(());
        }
        if Section::ALL
            .iter()
            .any(|section| self.section_path(*section).exists())
        {
            // Sections already exist; the legacy file is stale residue.
            return Ok(());
        }

        let raw = fs::read_to_string(&legacy)
            .map_err(|source| StoreError::io("legacy.read", &legacy, source))?;
        let document: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "legacy state unreadable; attempting prefix recovery");
                recover_json_prefix(&raw).unwrap_or(Value::Null)
            }
        };

        if let Value::Object(map) = document {
            for section in Section::ALL {
                if let Some(value) = map.get(section.legacy_key()) {
                    let rendered = serde_json::to_string_pretty(value).map_err(|source| {
                        StoreError::Json {
                            operation: "legacy.serialise",
                            path: self.section_path(section),
                            source,
                        }
                    })?;
                    write_atomic(&self.section_path(section), rendered.as_bytes())?;
                }
            }
            info!("legacy state split into section files");
        }

        let parked = legacy.with_extension("json.migrated");
        fs::rename(&legacy, &parked)
            .map_err(|source| StoreError::io("legacy.rename", &legacy, source))?;
        Ok(())
    }

    // ------------------------------------------------------------------ secrets

    /// Return the stored secret, or generate and persist one on first use.
    ///
    /// # Errors
    ///
    /// Returns an error when the section cannot be read or written.
    pub fn ensure_secret(
        &self,
        service: &str,
        key: &str,
        generator: impl FnOnce() -> String,
    ) -> StoreResult<String> {
        let mut secrets: SecretsSection = self.load_section(Section::Secrets)?;
        if let Some(value) = secrets.get(service, key) {
            return Ok(value.to_string());
        }
        let value = generator();
        secrets.set(service, key, value.clone());
        self.save_section(Section::Secrets, &secrets)?;
        Ok(value)
    }

    /// Overwrite a secret; a no-op write is skipped. Returns whether the
    /// stored value changed.
    ///
    /// # Errors
    ///
    /// Returns an error when the section cannot be read or written.
    pub fn set_secret(&self, service: &str, key: &str, value: &str) -> StoreResult<bool> {
        let mut secrets: SecretsSection = self.load_section(Section::Secrets)?;
        if !secrets.set(service, key, value) {
            return Ok(false);
        }
        self.save_section(Section::Secrets, &secrets)?;
        Ok(true)
    }

    /// Read a single secret.
    ///
    /// # Errors
    ///
    /// Returns an error when the section cannot be read.
    pub fn get_secret(&self, service: &str, key: &str) -> StoreResult<Option<String>> {
        let secrets: SecretsSection = self.load_section(Section::Secrets)?;
        Ok(secrets.get(service, key).map(String::from))
    }

    /// Generate a URL-safe random token of `len` alphanumeric characters.
    #[must_use]
    pub fn generate_token(len: usize) -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    // ------------------------------------------------------------------ run log

    /// Create a new in-flight run record.
    ///
    /// # Errors
    ///
    /// Returns an error when the runs section cannot be read or written.
    pub fn start_run(&self, run_id: &str) -> StoreResult<()> {
        let mut runs: RunsSection = self.load_section(Section::Runs)?;
        runs.push(RunRecord::new(run_id));
        self.save_section(Section::Runs, &runs)
    }

    /// Append a stage event to a run, creating the record if the run log
    /// evicted it mid-flight.
    ///
    /// # Errors
    ///
    /// Returns an error when the runs section cannot be read or written.
    pub fn append_run_event(&self, run_id: &str, event: StageEvent) -> StoreResult<()> {
        let mut runs: RunsSection = self.load_section(Section::Runs)?;
        if let Some(record) = runs.find_mut(run_id) {
            record.events.push(event);
        } else {
            let mut record = RunRecord::new(run_id);
            record.events.push(event);
            runs.push(record);
        }
        self.save_section(Section::Runs, &runs)
    }

    /// Finalise a run with its terminal result.
    ///
    /// # Errors
    ///
    /// Returns an error when the runs section cannot be read or written.
    pub fn finalize_run(&self, run_id: &str, ok: bool, summary: Option<&str>) -> StoreResult<()> {
        let mut runs: RunsSection = self.load_section(Section::Runs)?;
        if let Some(record) = runs.find_mut(run_id) {
            record.ok = Some(ok);
            record.summary = summary.map(String::from);
        } else {
            let mut record = RunRecord::new(run_id);
            record.ok = Some(ok);
            record.summary = summary.map(String::from);
            runs.push(record);
        }
        self.save_section(Section::Runs, &runs)
    }

    /// Fetch one run record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownRun`] when the run is not in the log.
    pub fn get_run(&self, run_id: &str) -> StoreResult<RunRecord> {
        let runs: RunsSection = self.load_section(Section::Runs)?;
        runs.find(run_id).cloned().ok_or_else(|| StoreError::UnknownRun {
            run_id: run_id.to_string(),
        })
    }

    /// Most recent runs, newest first, capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error when the runs section cannot be read.
    pub fn list_runs(&self, limit: usize) -> StoreResult<Vec<RunRecord>> {
        let runs: RunsSection = self.load_section(Section::Runs)?;
        Ok(runs.runs.iter().rev().take(limit).cloned().collect())
    }

    // ------------------------------------------------------------------ auth

    /// First stored user with an administrative role, when any.
    ///
    /// # Errors
    ///
    /// Returns an error when the auth section cannot be read.
    pub fn admin_user(&self) -> StoreResult<Option<UserRecord>> {
        let auth: AuthSection = self.load_section(Section::Auth)?;
        Ok(auth
            .users
            .iter()
            .find(|user| user.role == "admin" || user.role == "owner")
            .cloned())
    }

    /// Create a user record with a freshly hashed password.
    ///
    /// # Errors
    ///
    /// Returns an error when hashing fails or the section cannot be written.
    pub fn create_user(&self, username: &str, password: &str, role: &str) -> StoreResult<()> {
        let mut auth: AuthSection = self.load_section(Section::Auth)?;
        auth.users.retain(|user| user.username != username);
        auth.users.push(UserRecord {
            username: username.to_string(),
            password_hash: hash_password(password)?,
            role: role.to_string(),
            created_at: chrono::Utc::now(),
        });
        self.save_section(Section::Auth, &auth)
    }

    /// Verify a user's password; on success a legacy hash is transparently
    /// rewritten with the current algorithm (the write is atomic, so the
    /// record never holds a torn value).
    ///
    /// # Errors
    ///
    /// Returns an error when the section cannot be read or the rehash cannot
    /// be persisted.
    pub fn verify_user_password(&self, username: &str, password: &str) -> StoreResult<bool> {
        let mut auth: AuthSection = self.load_section(Section::Auth)?;
        let Some(user) = auth
            .users
            .iter_mut()
            .find(|user| user.username == username)
        else {
            return Ok(false);
        };
        if !verify_password(password, &user.password_hash) {
            return Ok(false);
        }
        if needs_rehash(&user.password_hash) {
            user.password_hash = hash_password(password)?;
            let name = user.username.clone();
            self.save_section(Section::Auth, &auth)?;
            info!(username = %name, "upgraded legacy password hash");
        }
        Ok(true)
    }

    // ------------------------------------------------------------------ directories

    /// Create the host directory tree the configuration demands and fix
    /// ownership to the configured runtime identity where possible. Config
    /// paths are rewritten through `paths` so the store works when the
    /// orchestrator itself runs inside a container.
    ///
    /// Returns a list of `created <path>` change descriptions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::PathPermission`] carrying the exact remediation
    /// commands when a directory cannot be created or adjusted.
    pub fn ensure_dirs(&self, config: &StackConfig, paths: &PathMap) -> StoreResult<Vec<String>> {
        let mut changes = Vec::new();
        let uid = config.runtime.user_id;
        let gid = config.runtime.group_id;
        let pool = paths.translate(&config.paths.pool);
        let pool = &pool;
        let appdata = paths.translate(&config.paths.appdata);
        let appdata = &appdata;
        let scratch_root = config
            .paths
            .scratch
            .as_deref()
            .map_or_else(|| pool.join("downloads"), |scratch| paths.translate(scratch));

        let mut wanted: Vec<PathBuf> = vec![pool.clone(), appdata.clone(), scratch_root.clone()];

        for service in convoy_config::constants::SERVICE_ORDER {
            if config.services.settings(service).enabled {
                wanted.push(appdata.join(service.as_str()));
            }
        }
        if config.proxy.enabled {
            wanted.push(appdata.join("traefik"));
            wanted.push(appdata.join("traefik").join("certs"));
        }

        let download_root = if config.paths.scratch.is_some() {
            scratch_root.join("downloads")
        } else {
            scratch_root.clone()
        };
        let complete = download_root.join("complete");
        wanted.push(download_root.clone());
        wanted.push(complete.clone());
        wanted.push(download_root.join("incomplete"));
        wanted.push(scratch_root.join("postproc"));
        wanted.push(scratch_root.join("transcode"));

        let categories = &config.download_policy.categories;
        for label in [&categories.radarr, &categories.sonarr, &categories.anime] {
            wanted.push(complete.join(label));
        }

        let media_root = pool.join("media");
        for class in ["movies", "tv", "anime"] {
            wanted.push(media_root.join(class));
        }

        for dir in wanted {
            if dir.exists() {
                continue;
            }
            fs::create_dir_all(&dir).map_err(|source| permission_error(&dir, uid, gid, source))?;
            apply_ownership(&dir, uid, gid);
            changes.push(format!("created {}", dir.display()));
        }
        Ok(changes)
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("store write mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

fn permission_error(path: &Path, uid: u32, gid: u32, source: std::io::Error) -> StoreError {
    if source.kind() == std::io::ErrorKind::PermissionDenied {
        StoreError::PathPermission {
            path: path.to_path_buf(),
            uid,
            gid,
            source,
        }
    } else {
        StoreError::io("ensure_dirs.create", path, source)
    }
}

/// Best effort: ownership and mode fixes require privileges the process may
/// not hold, and their absence is not fatal to the apply.
#[cfg(unix)]
fn apply_ownership(path: &Path, uid: u32, gid: u32) {
    use std::os::unix::fs::PermissionsExt;

    use nix::unistd::{chown, Gid, Uid};

    if let Err(err) = chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
        warn!(path = %path.display(), error = %err, "unable to chown directory");
    }
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o775)) {
        warn!(path = %path.display(), error = %err, "unable to chmod directory");
    }
}

#[cfg(not(unix))]
fn apply_ownership(_path: &Path, _uid: u32, _gid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{LedgerEntry, LedgerStatus, PipelineSection};
    use convoy_events::{StageEvent, StageStatus};
    use tempfile::TempDir;

    fn store() -> (TempDir, ConfigStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = ConfigStore::open(dir.path()).expect("open store");
        (dir, store)
    }

    fn sample_config(dir: &TempDir) -> StackConfig {
        StackConfig::with_paths(
            dir.path().join("pool"),
            dir.path().join("appdata"),
            Some(dir.path().join("scratch")),
        )
    }

    #[test]
    fn config_round_trips() {
        let (dir, store) = store();
        assert!(matches!(
            store.load_config(),
            Err(StoreError::ConfigMissing { .. })
        ));

        let config = sample_config(&dir);
        store.save_config(&config).expect("save");
        let loaded = store.load_config().expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn save_rejects_invalid_document() {
        let (dir, store) = store();
        let mut config = sample_config(&dir);
        config.paths.pool = "relative/pool".into();
        assert!(store.save_config(&config).is_err());
        assert!(!store.stack_path().exists());
    }

    #[test]
    fn sections_default_when_absent() {
        let (_dir, store) = store();
        let secrets: SecretsSection = store.load_section(Section::Secrets).expect("load");
        assert!(secrets.services.is_empty());
    }

    #[test]
    fn corrupt_section_recovers_prefix_and_parks_original() {
        let (dir, store) = store();
        let path = dir.path().join("secrets.json");
        fs::write(&path, "{\"sonarr\": {\"api_key\": \"abc\"}}{{{garbage").unwrap();

        let secrets: SecretsSection = store.load_section(Section::Secrets).expect("recover");
        assert_eq!(secrets.get("sonarr", "api_key"), Some("abc"));
        assert!(dir.path().join("secrets.json.corrupted").exists());
        // The recovered document was rewritten cleanly.
        let reread: SecretsSection = store.load_section(Section::Secrets).expect("reread");
        assert_eq!(reread, secrets);
    }

    #[test]
    fn unrecoverable_section_starts_empty() {
        let (dir, store) = store();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, "complete garbage").unwrap();
        let pipeline: PipelineSection = store.load_section(Section::Pipeline).expect("load");
        assert!(pipeline.processed.is_empty());
        assert!(dir.path().join("pipeline.json.corrupted").exists());
    }

    #[test]
    fn legacy_state_splits_into_sections() {
        let dir = TempDir::new().expect("tempdir");
        let legacy = serde_json::json!({
            "secrets": {"sonarr": {"api_key": "legacy-key"}},
            "runs": [{"run_id": "r1", "ok": true, "events": [], "summary": "done"}],
            "pipeline": {"processed": {"aa": {"status": "ok", "timestamp": 1}}},
        });
        fs::write(
            dir.path().join("state.json"),
            serde_json::to_string_pretty(&legacy).unwrap(),
        )
        .unwrap();

        let store = ConfigStore::open(dir.path()).expect("open");
        let secrets: SecretsSection = store.load_section(Section::Secrets).expect("secrets");
        assert_eq!(secrets.get("sonarr", "api_key"), Some("legacy-key"));
        let run = store.get_run("r1").expect("run migrated");
        assert_eq!(run.ok, Some(true));
        assert!(!dir.path().join("state.json").exists());
        assert!(dir.path().join("state.json.migrated").exists());

        // Reopening must not re-migrate.
        drop(store);
        let store = ConfigStore::open(dir.path()).expect("reopen");
        let secrets: SecretsSection = store.load_section(Section::Secrets).expect("secrets");
        assert_eq!(secrets.get("sonarr", "api_key"), Some("legacy-key"));
    }

    #[test]
    fn ensure_secret_generates_once() {
        let (_dir, store) = store();
        let first = store
            .ensure_secret("prowlarr", "ui_password", || "generated-1".to_string())
            .expect("first");
        let second = store
            .ensure_secret("prowlarr", "ui_password", || "generated-2".to_string())
            .expect("second");
        assert_eq!(first, "generated-1");
        assert_eq!(second, "generated-1", "existing secret is never replaced");
    }

    #[test]
    fn set_secret_reports_change() {
        let (_dir, store) = store();
        assert!(store.set_secret("qbittorrent", "username", "admin").unwrap());
        assert!(!store.set_secret("qbittorrent", "username", "admin").unwrap());
        assert!(store.set_secret("qbittorrent", "username", "ops").unwrap());
        assert_eq!(
            store.get_secret("qbittorrent", "username").unwrap(),
            Some("ops".to_string())
        );
    }

    #[test]
    fn run_log_lifecycle() {
        let (_dir, store) = store();
        store.start_run("r1").expect("start");
        store
            .append_run_event("r1", StageEvent::ok("validate", "checks"))
            .expect("append");
        store
            .finalize_run("r1", true, Some("all good"))
            .expect("finalize");

        let record = store.get_run("r1").expect("get");
        assert_eq!(record.ok, Some(true));
        assert_eq!(record.events.len(), 1);
        assert_eq!(record.events[0].status, StageStatus::Ok);
        assert_eq!(record.summary.as_deref(), Some("all good"));

        assert!(matches!(
            store.get_run("missing"),
            Err(StoreError::UnknownRun { .. })
        ));
    }

    #[test]
    fn run_log_eviction_keeps_latest() {
        let (_dir, store) = store();
        for i in 0..25 {
            store.start_run(&format!("run-{i}")).expect("start");
        }
        let listed = store.list_runs(100).expect("list");
        assert_eq!(listed.len(), crate::state::RUN_LOG_CAPACITY);
        assert_eq!(listed[0].run_id, "run-24", "newest first");
        assert!(matches!(
            store.get_run("run-0"),
            Err(StoreError::UnknownRun { .. })
        ));
    }

    #[test]
    fn user_verification_rehashes_legacy() {
        let (dir, store) = store();
        // Seed a legacy-format record directly.
        let mut auth = AuthSection::default();
        let salt = "deadbeef";
        let digest = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(b"hunter2");
            hasher.update(salt.as_bytes());
            hasher.finalize()
        };
        let mut legacy_hash = format!("{salt}$");
        for byte in digest {
            use std::fmt::Write as _;
            let _ = write!(legacy_hash, "{byte:02x}");
        }
        auth.users.push(UserRecord {
            username: "ops".to_string(),
            password_hash: legacy_hash,
            role: "admin".to_string(),
            created_at: chrono::Utc::now(),
        });
        store.save_section(Section::Auth, &auth).expect("seed");

        assert!(store.verify_user_password("ops", "hunter2").expect("verify"));
        let auth: AuthSection = store.load_section(Section::Auth).expect("reload");
        assert!(
            auth.users[0].password_hash.starts_with("$argon2"),
            "hash upgraded in place"
        );
        assert!(store.verify_user_password("ops", "hunter2").expect("verify again"));
        assert!(!store.verify_user_password("ops", "wrong").expect("reject"));
        assert!(!store.verify_user_password("ghost", "x").expect("unknown user"));

        let admin = store.admin_user().expect("admin").expect("present");
        assert_eq!(admin.username, "ops");
        drop(dir);
    }

    #[test]
    fn ensure_dirs_creates_expected_tree() {
        let (dir, store) = store();
        let config = sample_config(&dir);
        let changes = store.ensure_dirs(&config, &PathMap::default()).expect("ensure");
        assert!(!changes.is_empty());

        let scratch = dir.path().join("scratch");
        assert!(scratch.join("downloads/complete/movies").is_dir());
        assert!(scratch.join("downloads/complete/tv").is_dir());
        assert!(scratch.join("downloads/complete/anime").is_dir());
        assert!(scratch.join("postproc").is_dir());
        assert!(dir.path().join("pool/media/movies").is_dir());
        assert!(dir.path().join("pool/media/anime").is_dir());
        assert!(dir.path().join("appdata/sonarr").is_dir());
        assert!(
            !dir.path().join("appdata/traefik").exists(),
            "traefik dirs only appear when the proxy is enabled"
        );

        let second = store.ensure_dirs(&config, &PathMap::default()).expect("idempotent");
        assert!(second.is_empty(), "second pass changes nothing");
    }

    #[test]
    fn ensure_dirs_with_proxy_creates_cert_dir() {
        let (dir, store) = store();
        let mut config = sample_config(&dir);
        config.proxy.enabled = true;
        store.ensure_dirs(&config, &PathMap::default()).expect("ensure");
        assert!(dir.path().join("appdata/traefik/certs").is_dir());
    }

    #[test]
    fn ledger_survives_store_reopen() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = ConfigStore::open(dir.path()).expect("open");
            let mut pipeline = PipelineSection::default();
            pipeline.processed.insert(
                "aa".to_string(),
                LedgerEntry {
                    status: LedgerStatus::Ok,
                    timestamp: 42,
                },
            );
            store
                .save_section(Section::Pipeline, &pipeline)
                .expect("save");
        }
        let store = ConfigStore::open(dir.path()).expect("reopen");
        let pipeline: PipelineSection = store.load_section(Section::Pipeline).expect("load");
        assert!(pipeline.is_settled("aa"));
    }
}
