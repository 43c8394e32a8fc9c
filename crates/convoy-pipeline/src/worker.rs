//! The pipeline worker loop.
//!
//! Each tick authenticates to the torrent client, walks completed torrents
//! whose category belongs to the download policy, and processes everything
//! the ledger has not already settled: probe, remux into a per-hash staging
//! directory, relocate into the library, delete the torrent (keeping files
//! already moved), and record the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use convoy_clients::{QbApi, TorrentRecord};
use convoy_compose::CommandRunner;
use convoy_config::{PathMap, ServiceName, StackConfig};
use convoy_store::{
    ConfigStore, LedgerEntry, LedgerStatus, PipelineSection, Section, StoreError,
};
use convoy_telemetry::Metrics;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::naming::{parse_movie_name, parse_tv_episode};
use crate::probe::probe_streams;
use crate::remux::{build_remux_args, TrackSelection};

/// Extensions treated as video payloads.
const VIDEO_EXTENSIONS: [&str; 6] = ["mkv", "mp4", "avi", "mov", "ts", "m2ts"];

/// Deadline for one remux; copies are IO-bound but large files take a while.
const REMUX_TIMEOUT: Duration = Duration::from_secs(3_600);

/// Per-tick processing summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Items remuxed and relocated.
    pub processed: u32,
    /// Items that failed remuxing.
    pub failed: u32,
    /// Items skipped (foreign category, already settled, no files).
    pub skipped: u32,
}

/// Media post-processing worker.
pub struct PipelineWorker {
    store: Arc<ConfigStore>,
    metrics: Metrics,
    paths: PathMap,
    qb_base_url: String,
}

impl PipelineWorker {
    /// Construct the worker against the store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>, metrics: Metrics) -> Self {
        let port = ServiceName::Qbittorrent.internal_port().unwrap_or(8080);
        Self {
            store,
            metrics,
            paths: PathMap::default(),
            qb_base_url: format!("http://qbittorrent:{port}"),
        }
    }

    /// Apply a host-to-container path map.
    #[must_use]
    pub fn with_paths(mut self, paths: PathMap) -> Self {
        self.paths = paths;
        self
    }

    /// Override the torrent client base URL (tests target a mock server).
    #[must_use]
    pub fn with_qb_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.qb_base_url = base_url.into();
        self
    }

    /// Run ticks forever at the given interval. Errors are logged and the
    /// next tick proceeds; the loop never unwinds.
    pub async fn run_forever(&self, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "pipeline worker started");
        loop {
            match self.tick().await {
                Ok(summary) => {
                    if summary.processed > 0 || summary.failed > 0 {
                        info!(
                            processed = summary.processed,
                            failed = summary.failed,
                            skipped = summary.skipped,
                            "pipeline tick complete"
                        );
                    }
                }
                Err(err) => warn!(error = %err, "pipeline tick failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// One polling pass.
    ///
    /// # Errors
    ///
    /// Returns an error when the config or ledger cannot be read, or the
    /// torrent client is unreachable. Per-item failures are recorded in the
    /// ledger instead of failing the tick.
    pub async fn tick(&self) -> PipelineResult<TickSummary> {
        let config = match self.store.load_config() {
            Ok(config) => config,
            Err(StoreError::ConfigMissing { .. }) => return Ok(TickSummary::default()),
            Err(err) => return Err(err.into()),
        };
        if !config.services.pipeline.enabled {
            return Ok(TickSummary::default());
        }

        let username = self
            .store
            .get_secret("qbittorrent", "username")?
            .unwrap_or_else(|| config.services.qbittorrent.username.clone());
        let password = self
            .store
            .get_secret("qbittorrent", "password")?
            .unwrap_or_else(|| config.services.qbittorrent.password.clone());

        let api = QbApi::new(&self.qb_base_url)?;
        if !api.login(&username, &password).await? {
            return Err(PipelineError::QbAuthFailed);
        }

        let torrents = api.list_completed().await?;
        if torrents.is_empty() {
            return Ok(TickSummary::default());
        }

        let mut summary = TickSummary::default();
        for torrent in torrents {
            let category = normalize_category(&torrent.category);
            if config.media_policy_for_category(category).is_none() {
                summary.skipped += 1;
                continue;
            }
            let ledger: PipelineSection = self.store.load_section(Section::Pipeline)?;
            if ledger.is_settled(&torrent.hash) {
                summary.skipped += 1;
                continue;
            }

            match self.process_torrent(&api, &config, &torrent, category).await {
                Ok(ProcessOutcome::Done) => {
                    self.mark(&torrent.hash, LedgerStatus::Ok)?;
                    summary.processed += 1;
                }
                Ok(ProcessOutcome::NoFiles) => {
                    self.mark(&torrent.hash, LedgerStatus::SkippedNoFiles)?;
                    summary.skipped += 1;
                }
                Ok(ProcessOutcome::RemuxFailed) => {
                    self.mark(&torrent.hash, LedgerStatus::FfmpegFailed)?;
                    summary.failed += 1;
                }
                Err(err) => {
                    // Transient infrastructure problems are not settled in
                    // the ledger; the next tick retries.
                    warn!(hash = %torrent.hash, error = %err, "torrent processing failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn process_torrent(
        &self,
        api: &QbApi,
        config: &StackConfig,
        torrent: &TorrentRecord,
        category: &str,
    ) -> PipelineResult<ProcessOutcome> {
        let files = api.list_files(&torrent.hash).await?;
        if files.is_empty() {
            return Ok(ProcessOutcome::NoFiles);
        }

        // The client reports container-side paths; rewrite them to the view
        // this process has of the download area.
        let qb_map = self.qb_path_map(config);
        let save_path = qb_map.translate(Path::new(&torrent.save_path));

        let Some(primary) = files
            .iter()
            .filter(|entry| {
                Path::new(&entry.name)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| {
                        VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str())
                    })
            })
            .max_by_key(|entry| entry.size)
        else {
            return Ok(ProcessOutcome::NoFiles);
        };
        let source = save_path.join(&primary.name);

        let probe = probe_streams(&source).await;
        let selection = config
            .media_policy_for_category(category)
            .map(|policy| TrackSelection {
                audio: policy.keep_audio.clone(),
                subtitles: policy.keep_subs.clone(),
            })
            .unwrap_or_default();

        let container_ext = &config.quality.preferred_container;
        let stem = source
            .file_stem()
            .map_or_else(|| torrent.hash.clone(), |stem| stem.to_string_lossy().into_owned());

        let staging_dir = self
            .scratch_root(config)
            .join("postproc")
            .join(&torrent.hash);
        std::fs::create_dir_all(&staging_dir)
            .map_err(|source_err| PipelineError::io("staging.create", &staging_dir, source_err))?;
        let staging_output = staging_dir.join(format!("{stem}.{container_ext}"));

        let final_output = self.final_output_path(config, torrent, category, container_ext);

        let args = build_remux_args(&source, &staging_output, &selection, probe.as_ref());
        debug!(hash = %torrent.hash, ?args, "running remux");
        if !self.run_ffmpeg(&args).await {
            return Ok(ProcessOutcome::RemuxFailed);
        }

        if let Some(parent) = final_output.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source_err| PipelineError::io("library.create", parent, source_err))?;
        }
        move_file(&staging_output, &final_output)?;
        info!(hash = %torrent.hash, output = %final_output.display(), "media relocated");

        // Remove the torrent payload and staging residue, then drop the
        // torrent from the client while keeping the (already moved) files.
        let content_path = qb_map.translate(Path::new(&torrent.content_path));
        cleanup_path(&content_path);
        cleanup_path(&staging_dir);
        api.delete_torrents(std::slice::from_ref(&torrent.hash), false)
            .await?;
        Ok(ProcessOutcome::Done)
    }

    fn final_output_path(
        &self,
        config: &StackConfig,
        torrent: &TorrentRecord,
        category: &str,
        container_ext: &str,
    ) -> PathBuf {
        let categories = &config.download_policy.categories;
        let media_root = self.paths.translate(&config.paths.pool).join("media");

        if category == categories.radarr {
            let (title, year) = parse_movie_name(&torrent.name);
            let folder = year.as_ref().map_or_else(
                || title.clone(),
                |year| format!("{title} ({year})"),
            );
            return media_root
                .join("movies")
                .join(&folder)
                .join(format!("{folder}.{container_ext}"));
        }

        let class_dir = if category == categories.sonarr {
            "tv"
        } else {
            "anime"
        };
        if let Some((show, season, episode)) = parse_tv_episode(&torrent.name) {
            return media_root
                .join(class_dir)
                .join(&show)
                .join(format!("Season {season}"))
                .join(format!("{show} - S{season:02}E{episode:02}.{container_ext}"));
        }

        // Unparseable name: keep it flat under the class directory.
        let (title, year) = parse_movie_name(&torrent.name);
        let base = year.map_or(title.clone(), |year| format!("{title} ({year})"));
        media_root
            .join(class_dir)
            .join(format!("{base}.{container_ext}"))
    }

    async fn run_ffmpeg(&self, args: &[String]) -> bool {
        let runner = CommandRunner::new(REMUX_TIMEOUT);
        let arg_refs: Vec<&str> = args.iter().skip(1).map(String::as_str).collect();
        match runner.run(&args[0], &arg_refs).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!(status = output.status, stderr = %output.stderr.trim(), "ffmpeg failed");
                false
            }
            Err(err) => {
                warn!(error = %err, "ffmpeg could not run");
                false
            }
        }
    }

    /// Map qBittorrent's container-side `/downloads` tree onto the locally
    /// visible download root.
    fn qb_path_map(&self, config: &StackConfig) -> PathMap {
        let downloads_root = self.scratch_root(config).join("downloads");
        PathMap::with_rules(vec![(PathBuf::from("/downloads"), downloads_root)])
    }

    fn scratch_root(&self, config: &StackConfig) -> PathBuf {
        config.paths.scratch.as_deref().map_or_else(
            || self.paths.translate(&config.paths.pool).join("downloads"),
            |scratch| self.paths.translate(scratch),
        )
    }

    fn mark(&self, hash: &str, status: LedgerStatus) -> PipelineResult<()> {
        let mut ledger: PipelineSection = self.store.load_section(Section::Pipeline)?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(0));
        ledger
            .processed
            .insert(hash.to_string(), LedgerEntry { status, timestamp });
        self.store.save_section(Section::Pipeline, &ledger)?;
        self.metrics.inc_pipeline_item(status.as_str());
        Ok(())
    }
}

enum ProcessOutcome {
    Done,
    NoFiles,
    RemuxFailed,
}

/// Strip the `-radarr`/`-sonarr` suffixes the library managers append to
/// their categories.
fn normalize_category(category: &str) -> &str {
    for suffix in ["-sonarr", "-radarr"] {
        if let Some(stripped) = category.strip_suffix(suffix) {
            return stripped;
        }
    }
    category
}

/// Rename, falling back to copy-and-remove across filesystems.
fn move_file(source: &Path, destination: &Path) -> PipelineResult<()> {
    match std::fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(source, destination)
                .map_err(|err| PipelineError::io("move.copy", destination, err))?;
            std::fs::remove_file(source)
                .map_err(|err| PipelineError::io("move.remove_source", source, err))?;
            Ok(())
        }
    }
}

fn cleanup_path(path: &Path) {
    if path.as_os_str().is_empty() || !path.exists() {
        return;
    }
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(err) = result {
        warn!(path = %path.display(), error = %err, "cleanup failed");
    }
}
