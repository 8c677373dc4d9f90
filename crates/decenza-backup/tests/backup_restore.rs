//! End-to-end backup and restore over real temp directories.

use std::sync::Arc;

use decenza_backup::{BackupEngine, BackupEvent, RestoreOptions};
use decenza_core::{PlatformServices, SettingsStore};
use decenza_history::model::{PhaseMarker, ShotSaveData};
use decenza_history::samples::{self, Channel, SampleSet};
use decenza_history::{ShotFilter, ShotHistory};

struct Fixture {
    _dir: tempfile::TempDir,
    paths: PlatformServices,
    settings: Arc<SettingsStore>,
    history: ShotHistory,
    engine: BackupEngine,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = PlatformServices::new(dir.path().join("data"), dir.path().join("cache"))
        .expect("paths");
    let settings = Arc::new(SettingsStore::load(paths.settings_path()).expect("settings"));
    let history = ShotHistory::open(paths.shot_db_path()).expect("history");
    let engine = BackupEngine::new(paths.clone(), Arc::clone(&settings), history.clone());
    Fixture { _dir: dir, paths, settings, history, engine }
}

fn sample_shot(uuid: &str) -> ShotSaveData {
    let mut set = SampleSet::new();
    set.insert("pressure".to_string(), Channel::from_points(&[(0.0, 9.0), (1.0, 9.1)]));
    ShotSaveData {
        uuid: uuid.to_string(),
        timestamp: 1_700_000_000,
        profile_name: "D-Flow".to_string(),
        beverage_type: "espresso".to_string(),
        duration: 28.0,
        final_weight: 36.0,
        dose_weight: 18.0,
        bean_brand: "Square Mile".to_string(),
        enjoyment: 80,
        compressed_samples: samples::compress(&set).expect("compress"),
        sample_count: 2,
        phase_markers: vec![PhaseMarker::default()],
        ..ShotSaveData::default()
    }
}

async fn save_shot(fixture: &Fixture, uuid: &str) {
    let mut events = fixture.history.events();
    fixture.history.save_shot(sample_shot(uuid));
    loop {
        match events.recv().await.expect("event") {
            decenza_history::HistoryEvent::ShotSaved(id) => {
                assert!(id > 0);
                return;
            },
            _ => continue,
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn backup_archive_has_fixed_layout() {
    let fixture = fixture();
    save_shot(&fixture, "u1").await;
    fixture.settings.set("visualizerUsername", "alice").expect("set");
    fixture.settings.set("visualizerPassword", "secret").expect("set");
    std::fs::write(fixture.paths.profiles_user_dir().join("classic.json"), b"{}")
        .expect("profile");
    std::fs::write(fixture.paths.media_dir().join("photo.jpg"), b"jpeg").expect("media");
    std::fs::write(fixture.paths.media_dir().join("catalog.json"), b"{}").expect("catalog");

    let mut events = fixture.engine.events();
    let zip_path = fixture.engine.create_backup(true).await.expect("backup");
    assert!(matches!(events.recv().await.expect("event"), BackupEvent::Created(_)));

    let name = zip_path.file_name().and_then(|n| n.to_str()).expect("name").to_string();
    assert!(name.starts_with("shots_backup_") && name.ends_with(".zip"));

    // Extract and verify the fixed layout
    let out = tempfile::tempdir().expect("tempdir");
    let extracted =
        decenza_backup::archive::extract_zip(&zip_path, out.path()).expect("extract");
    assert!(extracted >= 3);

    let db_name = name.replace(".zip", ".db");
    assert!(out.path().join(&db_name).is_file(), "db snapshot present");
    assert!(out.path().join("profiles/user/classic.json").is_file());
    assert!(out.path().join("media/photo.jpg").is_file());
    assert!(!out.path().join("media/catalog.json").exists(), "catalog excluded");

    let settings_text =
        std::fs::read_to_string(out.path().join("settings.json")).expect("settings");
    let settings_json: serde_json::Value =
        serde_json::from_str(&settings_text).expect("parse");
    assert_eq!(
        settings_json.get("visualizerUsername").and_then(|v| v.as_str()),
        Some("alice")
    );
    assert!(settings_json.get("visualizerPassword").is_none(), "sensitive key excluded");
    assert!(settings_json.get("ai_conversations").is_some());

    // The embedded snapshot is a valid SQLite database
    let header = std::fs::read(out.path().join(&db_name)).expect("read db");
    assert!(header.starts_with(b"SQLite format 3"));
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_replace_round_trip() {
    let fixture = fixture();
    save_shot(&fixture, "original").await;
    std::fs::write(fixture.paths.profiles_user_dir().join("keep.json"), b"{}")
        .expect("profile");
    let zip_path = fixture.engine.create_backup(true).await.expect("backup");
    let filename = zip_path.file_name().and_then(|n| n.to_str()).expect("name").to_string();

    // Mutate state after the backup
    save_shot(&fixture, "newer").await;
    std::fs::write(fixture.paths.profiles_user_dir().join("extra.json"), b"{}")
        .expect("profile");
    assert_eq!(fixture.history.total_shots(), 2);

    let mut events = fixture.engine.events();
    fixture
        .engine
        .restore_backup(&filename, RestoreOptions { merge: false, ..RestoreOptions::default() })
        .await
        .expect("restore");

    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, BackupEvent::RestoreCompleted(_)) {
            completed = true;
        }
    }
    assert!(completed, "restoreCompleted emitted");

    // Shots replaced with the backup's single shot
    let (shots, total) = fixture
        .history
        .request_shots_filtered(ShotFilter::default(), 0, 10)
        .await
        .expect("query")
        .expect("latest");
    assert_eq!(total, 1);
    assert_eq!(shots[0].uuid, "original");

    // Profiles replaced
    assert!(fixture.paths.profiles_user_dir().join("keep.json").is_file());
    assert!(!fixture.paths.profiles_user_dir().join("extra.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_replace_aborts_on_invalid_database() {
    let fixture = fixture();
    save_shot(&fixture, "u1").await;
    std::fs::write(fixture.paths.profiles_user_dir().join("keep.json"), b"{}")
        .expect("profile");

    // Hand-build a corrupt archive: the .db entry is not SQLite
    let staging = tempfile::tempdir().expect("tempdir");
    std::fs::write(staging.path().join("shots_backup_20250101.db"), b"not a database, sorry")
        .expect("write");
    std::fs::create_dir_all(staging.path().join("profiles/user")).expect("mkdir");
    std::fs::write(staging.path().join("profiles/user/evil.json"), b"{}").expect("write");
    let bad_zip = fixture.paths.backups_dir().join("shots_backup_20250101.zip");
    decenza_backup::archive::build_zip(staging.path(), &bad_zip).expect("zip");

    let mut events = fixture.engine.events();
    let result = fixture
        .engine
        .restore_backup(
            "shots_backup_20250101.zip",
            RestoreOptions { merge: false, ..RestoreOptions::default() },
        )
        .await;
    assert!(result.is_err());

    let event = events.recv().await.expect("event");
    let BackupEvent::RestoreFailed(message) = event else {
        unreachable!("expected failure, got {event:?}")
    };
    assert!(message.contains("not a valid SQLite database"), "got: {message}");

    // Nothing else was touched: shots intact, profiles intact
    assert_eq!(fixture.history.total_shots(), 1);
    assert!(fixture.paths.profiles_user_dir().join("keep.json").is_file());
    assert!(!fixture.paths.profiles_user_dir().join("evil.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn second_backup_same_day_is_reused() {
    let fixture = fixture();
    save_shot(&fixture, "u1").await;

    let first = fixture.engine.create_backup(false).await.expect("backup");
    let modified_before = std::fs::metadata(&first).expect("meta").modified().expect("time");

    let second = fixture.engine.create_backup(false).await.expect("backup");
    assert_eq!(first, second);
    let modified_after = std::fs::metadata(&second).expect("meta").modified().expect("time");
    assert_eq!(modified_before, modified_after, "existing archive reused");
}

#[test]
fn backup_filename_dates_parse() {
    use decenza_backup::engine::parse_backup_date;
    assert!(parse_backup_date("shots_backup_20250601.zip").is_some());
    assert!(parse_backup_date("shots_backup_20250601.db").is_some());
    assert!(parse_backup_date("shots_backup_2025.zip").is_none());
    assert!(parse_backup_date("random.zip").is_none());
    assert!(parse_backup_date("shots_backup_99999999.zip").is_none());
}
