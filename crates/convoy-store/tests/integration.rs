//! End-to-end persistence behaviour across store reopen and simulated
//! crashes.

use std::fs;

use convoy_config::{PathMap, StackConfig};
use convoy_events::StageEvent;
use convoy_store::{ConfigStore, Section, SecretsSection};
use tempfile::TempDir;

fn sample_config(dir: &TempDir) -> StackConfig {
    StackConfig::with_paths(
        dir.path().join("pool"),
        dir.path().join("appdata"),
        Some(dir.path().join("scratch")),
    )
}

#[test]
fn config_round_trips_across_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("state");

    let mut config = sample_config(&dir);
    config.services.sonarr.port = 18_989;
    config.media_policy.movies.keep_subs = vec!["eng".to_string(), "forced".to_string()];

    {
        let store = ConfigStore::open(&root).expect("open");
        store.save_config(&config).expect("save");
    }
    let store = ConfigStore::open(&root).expect("reopen");
    assert_eq!(store.load_config().expect("load"), config);
}

/// A crash between the temp-file write and the rename leaves the previous
/// content untouched and produces no `.corrupted` artifact.
#[test]
fn interrupted_write_preserves_previous_content() {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("state");
    let store = ConfigStore::open(&root).expect("open");

    let mut secrets = SecretsSection::default();
    secrets.set("sonarr", "api_key", "original");
    store
        .save_section(Section::Secrets, &secrets)
        .expect("initial write");

    // Simulate the crash: a fully written temp sibling that never got
    // renamed over the target.
    fs::write(
        root.join(format!(".secrets.json.tmp.{}", std::process::id())),
        "{\"sonarr\": {\"api_key\": \"half-finished\"}}",
    )
    .expect("stage temp file");

    drop(store);
    let store = ConfigStore::open(&root).expect("reopen after crash");
    let reloaded: SecretsSection = store.load_section(Section::Secrets).expect("load");
    assert_eq!(reloaded.get("sonarr", "api_key"), Some("original"));
    assert!(
        !root.join("secrets.json.corrupted").exists(),
        "an interrupted write is not corruption"
    );
}

#[test]
fn run_log_and_secrets_survive_many_writers() {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("state");
    let store = ConfigStore::open(&root).expect("open");

    store.start_run("r1").expect("start");
    for stage in ["validate", "render", "deploy.compose"] {
        store
            .append_run_event("r1", StageEvent::ok(stage, "fine"))
            .expect("append");
    }
    store
        .set_secret("qbittorrent", "password", "hunter2")
        .expect("secret");
    store.finalize_run("r1", true, Some("done")).expect("finalize");

    // Each section lives in its own file; writing one never disturbs the
    // others.
    drop(store);
    let store = ConfigStore::open(&root).expect("reopen");
    let run = store.get_run("r1").expect("run");
    assert_eq!(run.events.len(), 3);
    assert_eq!(run.ok, Some(true));
    assert_eq!(
        store.get_secret("qbittorrent", "password").expect("read"),
        Some("hunter2".to_string())
    );
}

#[test]
fn ensure_dirs_honours_path_translation() {
    let dir = TempDir::new().expect("tempdir");
    let store = ConfigStore::open(dir.path().join("state")).expect("open");

    // The document names host paths; the map redirects them to a local view,
    // as when the orchestrator runs inside a container.
    let config = StackConfig::with_paths(
        "/mnt/tank/pool".into(),
        "/mnt/tank/appdata".into(),
        None,
    );
    let local_pool = dir.path().join("mapped-pool");
    let local_appdata = dir.path().join("mapped-appdata");
    let map = PathMap::with_rules(vec![
        ("/mnt/tank/pool".into(), local_pool.clone()),
        ("/mnt/tank/appdata".into(), local_appdata.clone()),
    ]);

    store.ensure_dirs(&config, &map).expect("ensure");
    assert!(local_pool.join("media/movies").is_dir());
    assert!(local_pool.join("downloads/complete/tv").is_dir());
    assert!(local_appdata.join("sonarr").is_dir());
}
