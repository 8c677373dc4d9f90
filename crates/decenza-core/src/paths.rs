//! Explicit platform services.
//!
//! The engines never look up storage roots through ambient global state;
//! everything that touches disk receives a [`PlatformServices`] value at
//! construction. This keeps tests hermetic (point it at a temp dir) and
//! makes the on-disk layout auditable in one place.
//!
//! Layout under the data root:
//!
//! ```text
//! data/
//!   shots.db                 shot history database (+ -wal/-shm)
//!   settings.json            settings store
//!   sessions.json            companion server sessions
//!   profiles/user/*.json
//!   profiles/downloaded/*.json
//!   media/                   personal screensaver media
//!   backups/                 shots_backup_YYYYMMDD.zip
//! ```

use std::io;
use std::path::{Path, PathBuf};

/// Storage roots and platform facilities, passed through construction.
#[derive(Debug, Clone)]
pub struct PlatformServices {
    data_dir: PathBuf,
    cache_dir: PathBuf,
}

impl PlatformServices {
    /// Create platform services rooted at the given directories, creating
    /// the expected subdirectories if absent.
    pub fn new(data_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let services = Self { data_dir: data_dir.into(), cache_dir: cache_dir.into() };
        for dir in [
            services.data_dir.clone(),
            services.cache_dir.clone(),
            services.profiles_user_dir(),
            services.profiles_downloaded_dir(),
            services.media_dir(),
            services.backups_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(services)
    }

    /// The data root.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Scratch space for staging (upload spills, backup assembly).
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The shot history database file.
    #[must_use]
    pub fn shot_db_path(&self) -> PathBuf {
        self.data_dir.join("shots.db")
    }

    /// The settings store file.
    #[must_use]
    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    /// The companion server session table file.
    #[must_use]
    pub fn sessions_path(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    /// User-authored profile files.
    #[must_use]
    pub fn profiles_user_dir(&self) -> PathBuf {
        self.data_dir.join("profiles").join("user")
    }

    /// Downloaded profile files.
    #[must_use]
    pub fn profiles_downloaded_dir(&self) -> PathBuf {
        self.data_dir.join("profiles").join("downloaded")
    }

    /// Personal screensaver media.
    #[must_use]
    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }

    /// Backup archives.
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }
}
