//! Async engine facade.
//!
//! [`ShotHistory`] wraps the synchronous store with non-blocking
//! pipelines: every operation snapshots its inputs, runs on the blocking
//! pool with a worker connection, and delivers its result both as a
//! returned value (for direct callers like the companion server) and as a
//! [`HistoryEvent`] on the broadcast channel (for UI-style subscribers).
//!
//! # Lifetime safety
//!
//! Fire-and-forget tasks hold a [`std::sync::Weak`] to the engine
//! internals. When the engine is dropped mid-flight the worker finishes
//! its database work, fails to upgrade, and silently discards the
//! completion. Nothing ever touches freed engine state.
//!
//! # Serialized queries
//!
//! `request_shots_filtered` stamps each request with a monotonically
//! increasing serial. Completions carry their serial; subscribers (and the
//! engine's own bookkeeping) drop results that are not the latest, which
//! cancels stale pages when the user types faster than SQLite answers.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use tokio::sync::broadcast;

use crate::model::{
    AutoFavorite, FavoriteGroupBy, FavoriteGroupDetails, FavoriteGroupKey, ShotFilter,
    ShotMetadataUpdate, ShotRecord, ShotSaveData, ShotSummary,
};
use crate::{HistoryError, schema, store};

/// Signals published by the engine, all delivered after the corresponding
/// database work committed.
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    /// A shot was saved (`-1` on failure, matching the error event).
    ShotSaved(i64),
    /// A shot was deleted.
    ShotDeleted(i64),
    /// A filtered page is ready.
    ShotsFiltered {
        /// Request serial; stale serials should be ignored.
        serial: u64,
        /// The page.
        shots: Vec<ShotSummary>,
        /// Total rows matching the filter.
        total_count: i64,
    },
    /// A full record load finished.
    ShotReady(i64),
    /// Metadata update finished.
    MetadataUpdated {
        /// The shot.
        shot_id: i64,
        /// Whether a row changed.
        success: bool,
    },
    /// An import finished.
    ImportFinished {
        /// Whether the import committed.
        success: bool,
    },
    /// Something failed; the operation rolled back.
    ErrorOccurred(String),
}

struct Inner {
    db_path: PathBuf,
    events: broadcast::Sender<HistoryEvent>,
    total_shots: AtomicI64,
    filter_serial: AtomicU64,
    import_in_progress: AtomicBool,
    /// Set by the backup engine while it snapshots; saves are refused.
    backup_in_progress: AtomicBool,
    distinct_cache: std::sync::Mutex<std::collections::HashMap<String, Vec<String>>>,
}

/// The shot history engine. Cheap to clone.
#[derive(Clone)]
pub struct ShotHistory {
    inner: Arc<Inner>,
}

impl ShotHistory {
    /// Open (or create) the database and run migrations.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let db_path = db_path.into();
        let total = {
            let conn = schema::open(&db_path)?;
            store::shot_count(&conn)?
        };

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            inner: Arc::new(Inner {
                db_path,
                events,
                total_shots: AtomicI64::new(total),
                filter_serial: AtomicU64::new(0),
                import_in_progress: AtomicBool::new(false),
                backup_in_progress: AtomicBool::new(false),
                distinct_cache: std::sync::Mutex::new(std::collections::HashMap::new()),
            }),
        })
    }

    /// Subscribe to engine events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<HistoryEvent> {
        self.inner.events.subscribe()
    }

    /// The database file path.
    #[must_use]
    pub fn db_path(&self) -> &std::path::Path {
        &self.inner.db_path
    }

    /// Total shots, maintained across saves/deletes/imports.
    #[must_use]
    pub fn total_shots(&self) -> i64 {
        self.inner.total_shots.load(Ordering::Acquire)
    }

    /// Mark a backup snapshot as running; saves are refused while held.
    pub fn set_backup_in_progress(&self, in_progress: bool) {
        self.inner.backup_in_progress.store(in_progress, Ordering::Release);
    }

    /// Save a shot without waiting for the result.
    ///
    /// A missing UUID is assigned here so every caller gets the uniqueness
    /// invariant for free. The outcome arrives as
    /// [`HistoryEvent::ShotSaved`] (id, or -1 after an
    /// [`HistoryEvent::ErrorOccurred`]).
    pub fn save_shot(&self, mut data: ShotSaveData) {
        if data.uuid.is_empty() {
            data.uuid = uuid::Uuid::new_v4().to_string();
        }
        if self.inner.backup_in_progress.load(Ordering::Acquire) {
            tracing::warn!("refusing shot save: backup in progress");
            let _ = self.inner.events.send(HistoryEvent::ShotSaved(-1));
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let db_path = self.inner.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let result = schema::open_worker(&db_path)
                .and_then(|mut conn| store::save_shot(&mut conn, &data));
            let Some(inner) = weak.upgrade() else { return };
            match result {
                Ok(id) => {
                    inner.total_shots.fetch_add(1, Ordering::AcqRel);
                    invalidate_cache(&inner);
                    tracing::debug!(
                        shot_id = id,
                        profile = %data.profile_name,
                        samples = data.sample_count,
                        "shot saved"
                    );
                    let _ = inner.events.send(HistoryEvent::ShotSaved(id));
                },
                Err(e) => {
                    tracing::error!(error = %e, "shot save failed");
                    let _ = inner
                        .events
                        .send(HistoryEvent::ErrorOccurred("failed to save shot".to_string()));
                    let _ = inner.events.send(HistoryEvent::ShotSaved(-1));
                },
            }
        });
    }

    /// Request a filtered page; the result is serialized against newer
    /// requests and also returned directly (None when superseded).
    pub async fn request_shots_filtered(
        &self,
        filter: ShotFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Option<(Vec<ShotSummary>, i64)>, HistoryError> {
        let serial = self.inner.filter_serial.fetch_add(1, Ordering::AcqRel) + 1;
        let db_path = self.inner.db_path.clone();

        let (shots, total_count) = tokio::task::spawn_blocking(move || {
            let conn = schema::open_worker(&db_path)?;
            let shots = store::list_filtered(&conn, &filter, offset, limit)?;
            let total = store::count_filtered(&conn, &filter)?;
            Ok::<_, HistoryError>((shots, total))
        })
        .await
        .map_err(|e| HistoryError::Worker(format!("worker panicked: {e}")))??;

        // Drop stale pages: only the latest serial wins
        if self.inner.filter_serial.load(Ordering::Acquire) != serial {
            tracing::debug!(serial, "dropping stale filter result");
            return Ok(None);
        }
        let _ = self.inner.events.send(HistoryEvent::ShotsFiltered {
            serial,
            shots: shots.clone(),
            total_count,
        });
        Ok(Some((shots, total_count)))
    }

    /// Load the full record for one shot.
    pub async fn get_shot(&self, shot_id: i64) -> Result<Option<ShotRecord>, HistoryError> {
        let db_path = self.inner.db_path.clone();
        let record = tokio::task::spawn_blocking(move || {
            let conn = schema::open_worker(&db_path)?;
            store::load_shot(&conn, shot_id)
        })
        .await
        .map_err(|e| HistoryError::Worker(format!("worker panicked: {e}")))??;
        if record.is_some() {
            let _ = self.inner.events.send(HistoryEvent::ShotReady(shot_id));
        }
        Ok(record)
    }

    /// Load several shots for comparison.
    pub async fn get_shots(&self, shot_ids: Vec<i64>) -> Result<Vec<ShotRecord>, HistoryError> {
        let db_path = self.inner.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = schema::open_worker(&db_path)?;
            store::load_shots(&conn, &shot_ids)
        })
        .await
        .map_err(|e| HistoryError::Worker(format!("worker panicked: {e}")))?
    }

    /// Delete one shot.
    pub async fn delete_shot(&self, shot_id: i64) -> Result<bool, HistoryError> {
        let weak = Arc::downgrade(&self.inner);
        let db_path = self.inner.db_path.clone();
        let deleted = tokio::task::spawn_blocking(move || {
            let conn = schema::open_worker(&db_path)?;
            store::delete_shot(&conn, shot_id)
        })
        .await
        .map_err(|e| HistoryError::Worker(format!("worker panicked: {e}")))??;

        if let Some(inner) = weak.upgrade() {
            if deleted {
                inner.total_shots.fetch_sub(1, Ordering::AcqRel);
                invalidate_cache(&inner);
                let _ = inner.events.send(HistoryEvent::ShotDeleted(shot_id));
            }
        }
        Ok(deleted)
    }

    /// Update editable metadata for a shot.
    pub async fn update_metadata(
        &self,
        shot_id: i64,
        update: ShotMetadataUpdate,
    ) -> Result<bool, HistoryError> {
        let weak = Arc::downgrade(&self.inner);
        let db_path = self.inner.db_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = schema::open_worker(&db_path)?;
            store::update_metadata(&conn, shot_id, &update)
        })
        .await
        .map_err(|e| HistoryError::Worker(format!("worker panicked: {e}")))?;

        let Some(inner) = weak.upgrade() else { return result };
        match &result {
            Ok(success) => {
                if *success {
                    // Cache is only stale when the update actually landed
                    invalidate_cache(&inner);
                }
                let _ = inner
                    .events
                    .send(HistoryEvent::MetadataUpdated { shot_id, success: *success });
            },
            Err(e) => {
                let _ = inner.events.send(HistoryEvent::ErrorOccurred(e.to_string()));
            },
        }
        result
    }

    /// Record a visualizer upload for a shot.
    pub async fn update_visualizer(
        &self,
        shot_id: i64,
        visualizer_id: String,
        visualizer_url: String,
    ) -> Result<bool, HistoryError> {
        let db_path = self.inner.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = schema::open_worker(&db_path)?;
            store::update_visualizer(&conn, shot_id, &visualizer_id, &visualizer_url)
        })
        .await
        .map_err(|e| HistoryError::Worker(format!("worker panicked: {e}")))?
    }

    /// Distinct values for a dropdown column, cached until a mutation
    /// commits.
    pub async fn get_distinct(&self, column: &str) -> Result<Vec<String>, HistoryError> {
        if let Ok(cache) = self.inner.distinct_cache.lock() {
            if let Some(values) = cache.get(column) {
                return Ok(values.clone());
            }
        }

        let db_path = self.inner.db_path.clone();
        let column_owned = column.to_string();
        let values = tokio::task::spawn_blocking(move || {
            let conn = schema::open_worker(&db_path)?;
            store::distinct_values(&conn, &column_owned)
        })
        .await
        .map_err(|e| HistoryError::Worker(format!("worker panicked: {e}")))??;

        if let Ok(mut cache) = self.inner.distinct_cache.lock() {
            cache.insert(column.to_string(), values.clone());
        }
        Ok(values)
    }

    /// Distinct values for cascading dropdowns (not cached; the filter
    /// makes the key space unbounded).
    pub async fn get_distinct_filtered(
        &self,
        column: &str,
        filter: ShotFilter,
    ) -> Result<Vec<String>, HistoryError> {
        let db_path = self.inner.db_path.clone();
        let column = column.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = schema::open_worker(&db_path)?;
            store::distinct_values_filtered(&conn, &column, &filter)
        })
        .await
        .map_err(|e| HistoryError::Worker(format!("worker panicked: {e}")))?
    }

    /// Auto-favorites: most recent shot per group.
    pub async fn auto_favorites(
        &self,
        group_by: FavoriteGroupBy,
        max_items: i64,
    ) -> Result<Vec<AutoFavorite>, HistoryError> {
        let db_path = self.inner.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = schema::open_worker(&db_path)?;
            store::auto_favorites(&conn, group_by, max_items)
        })
        .await
        .map_err(|e| HistoryError::Worker(format!("worker panicked: {e}")))?
    }

    /// Aggregates for one favorite group.
    pub async fn favorite_group_details(
        &self,
        group_by: FavoriteGroupBy,
        key: FavoriteGroupKey,
    ) -> Result<FavoriteGroupDetails, HistoryError> {
        let db_path = self.inner.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = schema::open_worker(&db_path)?;
            store::favorite_group_details(&conn, group_by, &key)
        })
        .await
        .map_err(|e| HistoryError::Worker(format!("worker panicked: {e}")))?
    }

    /// Import shots from another database file.
    ///
    /// At most one import runs at a time; a second call fails fast with
    /// [`HistoryError::Busy`].
    pub async fn import_database(
        &self,
        source_path: PathBuf,
        merge: bool,
    ) -> Result<(usize, usize), HistoryError> {
        if self.inner.import_in_progress.swap(true, Ordering::AcqRel) {
            return Err(HistoryError::Busy("import"));
        }

        let weak = Arc::downgrade(&self.inner);
        let db_path = self.inner.db_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = schema::open_worker(&db_path)?;
            store::import_database(&mut conn, &source_path, merge)
        })
        .await
        .map_err(|e| HistoryError::Worker(format!("worker panicked: {e}")));
        let result = match result {
            Ok(inner_result) => inner_result,
            Err(e) => Err(e),
        };

        if let Some(inner) = weak.upgrade() {
            inner.import_in_progress.store(false, Ordering::Release);
            match &result {
                Ok(_) => {
                    invalidate_cache(&inner);
                    if let Ok(conn) = schema::open_worker(&inner.db_path) {
                        if let Ok(count) = store::shot_count(&conn) {
                            inner.total_shots.store(count, Ordering::Release);
                        }
                    }
                    let _ = inner.events.send(HistoryEvent::ImportFinished { success: true });
                },
                Err(e) => {
                    let _ = inner.events.send(HistoryEvent::ErrorOccurred(e.to_string()));
                    let _ = inner.events.send(HistoryEvent::ImportFinished { success: false });
                },
            }
        }
        result
    }

    /// Snapshot the database into `dest_path` (checkpoint + copy),
    /// refusing saves for the duration.
    pub async fn snapshot_to(&self, dest_path: PathBuf) -> Result<(), HistoryError> {
        self.set_backup_in_progress(true);
        let db_path = self.inner.db_path.clone();
        let result = tokio::task::spawn_blocking(move || store::snapshot_to(&db_path, &dest_path))
            .await
            .map_err(|e| HistoryError::Worker(format!("worker panicked: {e}")));
        self.set_backup_in_progress(false);
        match result {
            Ok(inner_result) => inner_result,
            Err(e) => Err(e),
        }
    }
}

fn invalidate_cache(inner: &Inner) {
    if let Ok(mut cache) = inner.distinct_cache.lock() {
        cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PhaseMarker;
    use crate::samples::{self, Channel, SampleSet};

    fn save_data(uuid: &str, enjoyment: i64) -> ShotSaveData {
        let mut set = SampleSet::new();
        set.insert("pressure".to_string(), Channel::from_points(&[(0.0, 9.0)]));
        ShotSaveData {
            uuid: uuid.to_string(),
            timestamp: 1_700_000_000,
            profile_name: "Test".to_string(),
            beverage_type: "espresso".to_string(),
            duration: 28.0,
            final_weight: 36.0,
            dose_weight: 18.0,
            bean_brand: "Brand".to_string(),
            enjoyment,
            compressed_samples: samples::compress(&set).expect("compress"),
            sample_count: 1,
            phase_markers: vec![PhaseMarker::default()],
            ..ShotSaveData::default()
        }
    }

    async fn engine() -> (tempfile::TempDir, ShotHistory) {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = ShotHistory::open(dir.path().join("shots.db")).expect("open");
        (dir, engine)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_emits_event_and_updates_count() {
        let (_dir, engine) = engine().await;
        let mut events = engine.events();

        engine.save_shot(save_data("u1", 80));
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("timeout")
            .expect("event");
        let HistoryEvent::ShotSaved(id) = event else {
            unreachable!("unexpected event: {event:?}")
        };
        assert!(id > 0);
        assert_eq!(engine.total_shots(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn distinct_cache_invalidated_by_save() {
        let (_dir, engine) = engine().await;
        let mut events = engine.events();

        engine.save_shot(save_data("u1", 80));
        events.recv().await.expect("saved");

        let brands = engine.get_distinct("bean_brand").await.expect("distinct");
        assert_eq!(brands, vec!["Brand".to_string()]);

        // Save invalidates; next call recomputes and sees the new row
        let mut second = save_data("u2", 70);
        second.bean_brand = "Other".to_string();
        engine.save_shot(second);
        events.recv().await.expect("saved");

        let brands = engine.get_distinct("bean_brand").await.expect("distinct");
        assert_eq!(brands.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_refused_during_backup() {
        let (_dir, engine) = engine().await;
        let mut events = engine.events();

        engine.set_backup_in_progress(true);
        engine.save_shot(save_data("u1", 80));
        let event = events.recv().await.expect("event");
        assert!(matches!(event, HistoryEvent::ShotSaved(-1)));
        assert_eq!(engine.total_shots(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn filtered_request_returns_page_and_total() {
        let (_dir, engine) = engine().await;
        let mut events = engine.events();
        for (uuid, enjoyment) in [("u1", 40), ("u2", 80), ("u3", 90)] {
            engine.save_shot(save_data(uuid, enjoyment));
            events.recv().await.expect("saved");
        }

        let filter = ShotFilter {
            min_enjoyment: Some(50),
            sort_field: Some("enjoyment".to_string()),
            ..ShotFilter::default()
        };
        let (shots, total) = engine
            .request_shots_filtered(filter, 0, 10)
            .await
            .expect("query")
            .expect("latest serial");
        assert_eq!(total, 2);
        assert_eq!(shots[0].enjoyment, 90);
        assert_eq!(shots[1].enjoyment, 80);
    }
}
