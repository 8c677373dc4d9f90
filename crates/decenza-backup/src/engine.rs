//! Backup/restore orchestration.
//!
//! The engine never blocks the caller: heavy I/O runs on the blocking
//! pool and outcomes land on the event channel. One backup and one
//! restore may run at a time, never both.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Local, NaiveDate};
use decenza_chat::ConversationStore;
use decenza_core::{PlatformServices, SettingsStore};
use decenza_history::ShotHistory;
use tokio::sync::broadcast;

use crate::schedule::{self, should_backup_now};
use crate::{BackupError, archive};

/// Days a dated archive is retained.
const RETENTION_DAYS: i64 = 5;

/// Settings key for the scheduled backup hour (-1 disables).
pub const DAILY_BACKUP_HOUR_KEY: &str = "dailyBackupHour";

/// Which domains a restore touches, and how.
#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    /// Merge into existing data (`true`) or replace it (`false`).
    pub merge: bool,
    /// Restore the shot database.
    pub shots: bool,
    /// Restore settings and AI conversations.
    pub settings: bool,
    /// Restore profile files.
    pub profiles: bool,
    /// Restore personal media.
    pub media: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self { merge: true, shots: true, settings: true, profiles: true, media: true }
    }
}

/// Outcomes published by the engine.
#[derive(Debug, Clone)]
pub enum BackupEvent {
    /// A backup archive is in place.
    Created(PathBuf),
    /// Backup failed; any partial archive was removed.
    Failed(String),
    /// Restore finished cleanly.
    RestoreCompleted(String),
    /// Restore failed; sub-errors joined with `"; "`.
    RestoreFailed(String),
    /// Profile files changed during restore.
    ProfilesRestored,
    /// Media files changed during restore.
    MediaRestored,
}

struct Inner {
    paths: PlatformServices,
    settings: Arc<SettingsStore>,
    conversations: ConversationStore,
    history: ShotHistory,
    events: broadcast::Sender<BackupEvent>,
    backup_in_progress: AtomicBool,
    restore_in_progress: AtomicBool,
    last_backup_date: std::sync::Mutex<Option<NaiveDate>>,
}

/// The backup/restore engine. Cheap to clone.
#[derive(Clone)]
pub struct BackupEngine {
    inner: Arc<Inner>,
}

impl BackupEngine {
    /// Create an engine over the data-domain owners.
    #[must_use]
    pub fn new(
        paths: PlatformServices,
        settings: Arc<SettingsStore>,
        history: ShotHistory,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let conversations = ConversationStore::new(Arc::clone(&settings));
        Self {
            inner: Arc::new(Inner {
                paths,
                settings,
                conversations,
                history,
                events,
                backup_in_progress: AtomicBool::new(false),
                restore_in_progress: AtomicBool::new(false),
                last_backup_date: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Subscribe to outcomes.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<BackupEvent> {
        self.inner.events.subscribe()
    }

    /// Available backup archives, newest first.
    #[must_use]
    pub fn available_backups(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.inner.paths.backups_dir())
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter_map(|e| e.file_name().into_string().ok())
                    .filter(|name| parse_backup_date(name).is_some())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names.reverse();
        names
    }

    /// Start the hourly scheduler. Runs until the engine is dropped.
    pub fn start_scheduler(&self) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            // First check runs immediately so a missed window is caught at
            // startup; the task holds only a weak handle so dropping the
            // engine stops the schedule.
            loop {
                let Some(inner) = weak.upgrade() else { return };
                let engine = BackupEngine { inner };
                engine.check_schedule().await;
                drop(engine);
                tokio::time::sleep(schedule::CHECK_INTERVAL).await;
            }
        });
    }

    /// One schedule check: backup if the daily window says so.
    pub async fn check_schedule(&self) {
        let backup_hour = self.inner.settings.int_or(DAILY_BACKUP_HOUR_KEY, -1);
        let last = self.inner.last_backup_date.lock().ok().and_then(|d| *d);
        if should_backup_now(backup_hour, last, Local::now().naive_local()) {
            if let Err(e) = self.create_backup(false).await {
                tracing::warn!(error = %e, "scheduled backup failed");
            }
        }
    }

    /// Create a backup archive for today.
    ///
    /// Without `force`, an existing non-empty archive for today is
    /// accepted as-is. The outcome is emitted as [`BackupEvent::Created`]
    /// or [`BackupEvent::Failed`] and also returned.
    pub async fn create_backup(&self, force: bool) -> Result<PathBuf, BackupError> {
        if self.inner.backup_in_progress.swap(true, Ordering::AcqRel) {
            return Err(BackupError::Busy("backup"));
        }
        if self.inner.restore_in_progress.load(Ordering::Acquire) {
            self.inner.backup_in_progress.store(false, Ordering::Release);
            return Err(BackupError::Busy("restore"));
        }

        let result = self.create_backup_inner(force).await;
        self.inner.backup_in_progress.store(false, Ordering::Release);

        match &result {
            Ok(path) => {
                if let Ok(mut last) = self.inner.last_backup_date.lock() {
                    *last = Some(Local::now().date_naive());
                }
                let _ = self.inner.events.send(BackupEvent::Created(path.clone()));
                self.clean_old_backups();
            },
            Err(e) => {
                let _ = self.inner.events.send(BackupEvent::Failed(e.to_string()));
            },
        }
        result
    }

    async fn create_backup_inner(&self, force: bool) -> Result<PathBuf, BackupError> {
        let date_str = Local::now().format("%Y%m%d").to_string();
        let zip_path = self.inner.paths.backups_dir().join(format!("shots_backup_{date_str}.zip"));

        // A valid archive for today satisfies the schedule without rework
        if !force {
            if let Ok(meta) = std::fs::metadata(&zip_path) {
                if meta.len() > 0 {
                    tracing::debug!(path = %zip_path.display(), "backup for today already exists");
                    return Ok(zip_path);
                }
            }
        }
        if zip_path.exists() {
            std::fs::remove_file(&zip_path)?;
        }

        // Snapshot settings + conversations up front; the worker must not
        // touch the live stores
        let mut settings_json = self.inner.settings.export_json(false);
        if let Some(object) = settings_json.as_object_mut() {
            object.insert("ai_conversations".to_string(), self.inner.conversations.export_all());
        }

        // Staging lives under the cache dir and is removed on drop
        let staging = tempfile::Builder::new()
            .prefix("backup_staging_")
            .tempdir_in(self.inner.paths.cache_dir())?;

        // Database snapshot: checkpoint + copy on a dedicated connection;
        // saves are refused while it runs
        let db_dest = staging.path().join(format!("shots_backup_{date_str}.db"));
        self.inner.history.snapshot_to(db_dest.clone()).await?;
        if std::fs::metadata(&db_dest).map(|m| m.len()).unwrap_or(0) == 0 {
            return Err(BackupError::Restore("database snapshot is empty".to_string()));
        }

        let staging_path = staging.path().to_path_buf();
        let user_profiles = self.inner.paths.profiles_user_dir();
        let downloaded_profiles = self.inner.paths.profiles_downloaded_dir();
        let media_dir = self.inner.paths.media_dir();
        let final_zip = zip_path.clone();

        let result = tokio::task::spawn_blocking(move || -> Result<(), BackupError> {
            std::fs::write(
                staging_path.join("settings.json"),
                serde_json::to_string_pretty(&settings_json)
                    .map_err(|e| BackupError::Restore(e.to_string()))?,
            )?;

            archive::copy_directory(&user_profiles, &staging_path.join("profiles/user"), &[])?;
            archive::copy_directory(
                &downloaded_profiles,
                &staging_path.join("profiles/downloaded"),
                &[],
            )?;
            archive::copy_directory(&media_dir, &staging_path.join("media"), &["catalog.json"])?;

            // Build next to the target, then atomically move into place
            let partial = final_zip.with_extension("zip.part");
            if let Err(e) = archive::build_zip(&staging_path, &partial) {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            }
            std::fs::rename(&partial, &final_zip)?;
            Ok(())
        })
        .await;

        drop(staging);

        match result {
            Ok(Ok(())) => {
                tracing::info!(path = %zip_path.display(), "backup created");
                Ok(zip_path)
            },
            Ok(Err(e)) => {
                let _ = std::fs::remove_file(&zip_path);
                Err(e)
            },
            Err(join_error) => {
                // Safety net: the worker died without reporting
                tracing::error!(error = %join_error, "backup worker exited unexpectedly");
                let _ = std::fs::remove_file(&zip_path);
                Err(BackupError::Restore("backup failed unexpectedly".to_string()))
            },
        }
    }

    /// Delete archives older than [`RETENTION_DAYS`], matched by the date
    /// in their `shots_backup_YYYYMMDD.{db,zip}` filename.
    pub fn clean_old_backups(&self) {
        let cutoff = Local::now().date_naive() - chrono::Days::new(RETENTION_DAYS as u64);
        let Ok(entries) = std::fs::read_dir(self.inner.paths.backups_dir()) else {
            return;
        };
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = parse_backup_date(name) else { continue };
            if date < cutoff {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => tracing::debug!(name, "removed old backup"),
                    Err(e) => tracing::warn!(name, error = %e, "failed to remove old backup"),
                }
            }
        }
    }

    /// Restore selected domains from an archive in the backups directory.
    ///
    /// A legacy raw `.db` file restores shots only. Partial failures are
    /// accumulated and reported joined with `"; "`; a shot-import failure
    /// in replace mode aborts before any other domain is touched.
    pub async fn restore_backup(
        &self,
        filename: &str,
        options: RestoreOptions,
    ) -> Result<(), BackupError> {
        if self.inner.restore_in_progress.swap(true, Ordering::AcqRel) {
            return Err(BackupError::Busy("restore"));
        }
        if self.inner.backup_in_progress.load(Ordering::Acquire) {
            self.inner.restore_in_progress.store(false, Ordering::Release);
            return Err(BackupError::Busy("backup"));
        }

        let result = self.restore_inner(filename, options).await;
        self.inner.restore_in_progress.store(false, Ordering::Release);

        match &result {
            Ok(()) => {
                let _ = self
                    .inner
                    .events
                    .send(BackupEvent::RestoreCompleted(filename.to_string()));
            },
            Err(e) => {
                let _ = self.inner.events.send(BackupEvent::RestoreFailed(e.to_string()));
            },
        }
        result
    }

    async fn restore_inner(
        &self,
        filename: &str,
        options: RestoreOptions,
    ) -> Result<(), BackupError> {
        let archive_path = self.inner.paths.backups_dir().join(filename);
        if !archive_path.is_file() {
            return Err(BackupError::Restore(format!("backup file not found: {filename}")));
        }

        let is_raw_db = filename.ends_with(".db");
        let mut errors: Vec<String> = Vec::new();

        // Extraction happens into a guarded temp dir; raw .db backups skip it
        let temp = tempfile::Builder::new()
            .prefix("restore_temp_")
            .tempdir_in(self.inner.paths.cache_dir())?;
        let restore_dir = temp.path().to_path_buf();

        if !is_raw_db {
            let zip = archive_path.clone();
            let dest = restore_dir.clone();
            let extracted =
                tokio::task::spawn_blocking(move || archive::extract_zip(&zip, &dest))
                    .await
                    .map_err(|e| BackupError::Restore(format!("restore worker died: {e}")))?;
            if let Err(e) = extracted {
                return Err(BackupError::Restore(format!("failed to extract backup file: {e}")));
            }
        }

        // Shots
        if options.shots {
            let db_path = if is_raw_db {
                Some(archive_path.clone())
            } else {
                find_newest_db(&restore_dir)
            };
            if let Some(db_path) = db_path {
                match validate_sqlite_file(&db_path) {
                    Err(message) => {
                        errors.push(message);
                        if !options.merge {
                            // Replace mode aborts before other domains are
                            // touched so a bad archive cannot wipe data
                            return Err(BackupError::Restore(errors.join("; ")));
                        }
                    },
                    Ok(()) => {
                        match self.inner.history.import_database(db_path, options.merge).await {
                            Ok((imported, skipped)) => {
                                tracing::info!(imported, skipped, "shots restored");
                            },
                            Err(e) => {
                                tracing::warn!(error = %e, "shot import failed");
                                errors.push("failed to import shot history".to_string());
                                if !options.merge {
                                    return Err(BackupError::Restore(errors.join("; ")));
                                }
                            },
                        }
                    },
                }
            } else {
                tracing::debug!("no database in backup, skipping shot restore");
            }
        }

        // Profiles
        if options.profiles && !is_raw_db {
            let targets = [
                (restore_dir.join("profiles/user"), self.inner.paths.profiles_user_dir()),
                (
                    restore_dir.join("profiles/downloaded"),
                    self.inner.paths.profiles_downloaded_dir(),
                ),
            ];
            if !options.merge {
                for (_, dest) in &targets {
                    clear_directory_files(dest);
                }
            }
            let mut restored = !options.merge;
            for (src, dest) in &targets {
                match restore_files(src, dest, options.merge) {
                    Ok(count) => restored |= count > 0,
                    Err(e) => errors.push(format!("profile restore: {e}")),
                }
            }
            if restored {
                let _ = self.inner.events.send(BackupEvent::ProfilesRestored);
            }
        }

        // Media
        if options.media && !is_raw_db {
            let dest = self.inner.paths.media_dir();
            let mut restored = false;
            if !options.merge {
                restored = clear_directory_files(&dest) > 0;
            }
            match restore_files(&restore_dir.join("media"), &dest, options.merge) {
                Ok(count) => restored |= count > 0,
                Err(e) => errors.push(format!("media restore: {e}")),
            }
            if restored {
                let _ = self.inner.events.send(BackupEvent::MediaRestored);
            }
        }

        // Settings + AI conversations, last: the key/value store is shared
        // with live engines, so it is touched only after file domains
        if options.settings && !is_raw_db {
            let settings_path = restore_dir.join("settings.json");
            if settings_path.is_file() {
                match std::fs::read_to_string(&settings_path)
                    .map_err(|e| e.to_string())
                    .and_then(|text| {
                        serde_json::from_str::<serde_json::Value>(&text).map_err(|e| e.to_string())
                    }) {
                    Ok(mut json) => {
                        let conversations = json
                            .as_object_mut()
                            .and_then(|o| o.remove("ai_conversations"));
                        if let Err(e) = self.inner.settings.import_json(&json, options.merge) {
                            errors.push(format!("settings restore: {e}"));
                        }
                        if let Some(conversations) = conversations {
                            match self
                                .inner
                                .conversations
                                .import_all(&conversations, options.merge)
                            {
                                Ok(count) => {
                                    tracing::debug!(count, "conversations restored");
                                },
                                Err(e) => errors.push(format!("conversation restore: {e}")),
                            }
                        }
                    },
                    Err(e) => errors.push(format!("settings file in backup is corrupted: {e}")),
                }
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(BackupError::Restore(errors.join("; "))) }
    }
}

/// Parse the date out of a `shots_backup_YYYYMMDD.{db,zip}` filename.
#[must_use]
pub fn parse_backup_date(filename: &str) -> Option<NaiveDate> {
    let rest = filename.strip_prefix("shots_backup_")?;
    let date_str = rest.strip_suffix(".zip").or_else(|| rest.strip_suffix(".db"))?;
    if date_str.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(date_str, "%Y%m%d").ok()
}

/// The SQLite magic header every valid database starts with.
const SQLITE_MAGIC: &[u8] = b"SQLite format 3";

fn validate_sqlite_file(path: &std::path::Path) -> Result<(), String> {
    let meta = std::fs::metadata(path)
        .map_err(|_| "extracted file not found".to_string())?;
    if meta.len() < 100 {
        return Err("extracted file is too small to be a valid database".to_string());
    }
    let mut header = [0u8; 16];
    let mut file = std::fs::File::open(path)
        .map_err(|_| "cannot open extracted file for validation".to_string())?;
    std::io::Read::read_exact(&mut file, &mut header)
        .map_err(|_| "cannot open extracted file for validation".to_string())?;
    if !header.starts_with(SQLITE_MAGIC) {
        return Err("extracted file is not a valid SQLite database".to_string());
    }
    Ok(())
}

fn find_newest_db(dir: &std::path::Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "db"))
        .collect();
    candidates.sort();
    candidates.pop()
}

/// Remove all regular files directly under `dir`; returns how many.
fn clear_directory_files(dir: &std::path::Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else { return 0 };
    let mut removed = 0usize;
    for entry in entries.filter_map(Result::ok) {
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false)
            && std::fs::remove_file(entry.path()).is_ok()
        {
            removed += 1;
        }
    }
    removed
}

/// Copy files from an extracted domain dir into its target; in merge mode
/// existing files win.
fn restore_files(
    src: &std::path::Path,
    dest: &std::path::Path,
    merge: bool,
) -> Result<usize, BackupError> {
    if !src.is_dir() {
        return Ok(0);
    }
    std::fs::create_dir_all(dest)?;
    let mut restored = 0usize;
    for entry in std::fs::read_dir(src)?.filter_map(Result::ok) {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let target = dest.join(entry.file_name());
        if merge && target.exists() {
            continue;
        }
        std::fs::copy(entry.path(), &target)?;
        restored += 1;
    }
    Ok(restored)
}
