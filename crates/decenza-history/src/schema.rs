//! Table creation and versioned migrations.
//!
//! The schema version lives in a single-row `schema_version` table. Early
//! releases accidentally inserted duplicate rows, so bumps are written as
//! `DELETE` + `INSERT` and any duplicates are collapsed to the maximum on
//! startup. Migrations are defensive: each checks for the columns/tables
//! it adds so a partially-migrated database converges.

use rusqlite::Connection;

use crate::HistoryError;
use crate::samples;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 7;

/// Busy timeout applied to every connection.
pub const BUSY_TIMEOUT_MS: u64 = 5000;

/// Open the main connection: WAL, foreign keys, schema, migrations.
pub fn open(path: &std::path::Path) -> Result<Connection, HistoryError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
    // journal_mode returns the resulting mode as a row
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    create_tables(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Open a worker connection: pragmas only, schema assumed present.
pub fn open_worker(path: &std::path::Path) -> Result<Connection, HistoryError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Whether `table` has a column named `column`.
pub fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, HistoryError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn create_tables(conn: &Connection) -> Result<(), HistoryError> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS shots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT UNIQUE NOT NULL,
            timestamp INTEGER NOT NULL,

            profile_name TEXT NOT NULL,
            profile_json TEXT,
            beverage_type TEXT DEFAULT 'espresso',

            duration_seconds REAL NOT NULL,
            final_weight REAL,
            dose_weight REAL,

            bean_brand TEXT,
            bean_type TEXT,
            roast_date TEXT,
            roast_level TEXT,
            grinder_model TEXT,
            grinder_setting TEXT,
            drink_tds REAL,
            drink_ey REAL,
            enjoyment INTEGER,
            espresso_notes TEXT,
            bean_notes TEXT,
            barista TEXT,
            profile_notes TEXT,

            visualizer_id TEXT,
            visualizer_url TEXT,

            debug_log TEXT,

            temperature_override REAL,
            yield_override REAL,

            created_at INTEGER DEFAULT (strftime('%s', 'now')),
            updated_at INTEGER DEFAULT (strftime('%s', 'now'))
        );

        CREATE TABLE IF NOT EXISTS shot_samples (
            shot_id INTEGER PRIMARY KEY REFERENCES shots(id) ON DELETE CASCADE,
            sample_count INTEGER NOT NULL,
            data_blob BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS shot_phases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            shot_id INTEGER NOT NULL REFERENCES shots(id) ON DELETE CASCADE,
            time_offset REAL NOT NULL,
            label TEXT NOT NULL,
            frame_number INTEGER,
            is_flow_mode INTEGER DEFAULT 0,
            transition_reason TEXT DEFAULT ''
        );
        ",
    )?;

    create_fts(conn)?;

    conn.execute_batch(
        r"
        CREATE INDEX IF NOT EXISTS idx_shots_timestamp ON shots(timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_shots_profile ON shots(profile_name);
        CREATE INDEX IF NOT EXISTS idx_shots_bean ON shots(bean_brand, bean_type);
        CREATE INDEX IF NOT EXISTS idx_shots_grinder ON shots(grinder_model);
        CREATE INDEX IF NOT EXISTS idx_shots_enjoyment ON shots(enjoyment);
        CREATE INDEX IF NOT EXISTS idx_shot_phases_shot ON shot_phases(shot_id);

        CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);
        INSERT INTO schema_version (version)
            SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM schema_version);
        ",
    )?;

    Ok(())
}

/// Create the FTS5 external-content table and its sync triggers.
fn create_fts(conn: &Connection) -> Result<(), HistoryError> {
    conn.execute_batch(
        r"
        CREATE VIRTUAL TABLE IF NOT EXISTS shots_fts USING fts5(
            espresso_notes,
            bean_brand,
            bean_type,
            profile_name,
            grinder_model,
            content='shots',
            content_rowid='id'
        );

        CREATE TRIGGER IF NOT EXISTS shots_ai AFTER INSERT ON shots BEGIN
            INSERT INTO shots_fts(rowid, espresso_notes, bean_brand, bean_type, profile_name, grinder_model)
            VALUES (new.id, new.espresso_notes, new.bean_brand, new.bean_type, new.profile_name, new.grinder_model);
        END;

        CREATE TRIGGER IF NOT EXISTS shots_ad AFTER DELETE ON shots BEGIN
            INSERT INTO shots_fts(shots_fts, rowid, espresso_notes, bean_brand, bean_type, profile_name, grinder_model)
            VALUES ('delete', old.id, old.espresso_notes, old.bean_brand, old.bean_type, old.profile_name, old.grinder_model);
        END;

        CREATE TRIGGER IF NOT EXISTS shots_au AFTER UPDATE ON shots BEGIN
            INSERT INTO shots_fts(shots_fts, rowid, espresso_notes, bean_brand, bean_type, profile_name, grinder_model)
            VALUES ('delete', old.id, old.espresso_notes, old.bean_brand, old.bean_type, old.profile_name, old.grinder_model);
            INSERT INTO shots_fts(rowid, espresso_notes, bean_brand, bean_type, profile_name, grinder_model)
            VALUES (new.id, new.espresso_notes, new.bean_brand, new.bean_type, new.profile_name, new.grinder_model);
        END;
        ",
    )?;
    Ok(())
}

/// Read the current schema version, collapsing duplicate rows first.
pub fn current_version(conn: &Connection) -> Result<i64, HistoryError> {
    conn.execute(
        "DELETE FROM schema_version WHERE version != (SELECT MAX(version) FROM schema_version)",
        [],
    )?;
    let version = conn
        .query_row("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1", [], |row| {
            row.get(0)
        })
        .unwrap_or(1);
    Ok(version)
}

/// Bump the stored version with DELETE + INSERT.
///
/// UPDATE on the primary-key column hits UNIQUE constraints when stale
/// duplicate rows exist, so the row is always rewritten.
fn set_version(conn: &Connection, version: i64) -> Result<(), HistoryError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

fn run_migrations(conn: &Connection) -> Result<(), HistoryError> {
    let mut version = current_version(conn)?;

    // v3: dedicated override columns
    if version < 3 {
        tracing::info!("migrating shot history to v3 (override columns)");
        if !has_column(conn, "shots", "temperature_override")? {
            conn.execute("ALTER TABLE shots ADD COLUMN temperature_override REAL", [])?;
        }
        if !has_column(conn, "shots", "yield_override")? {
            conn.execute("ALTER TABLE shots ADD COLUMN yield_override REAL", [])?;
        }
        set_version(conn, 3)?;
        version = 3;
    }

    // v4: transition_reason on phase markers
    if version < 4 {
        tracing::info!("migrating shot history to v4 (transition_reason)");
        if !has_column(conn, "shot_phases", "transition_reason")? {
            conn.execute(
                "ALTER TABLE shot_phases ADD COLUMN transition_reason TEXT DEFAULT ''",
                [],
            )?;
        }
        set_version(conn, 4)?;
        version = 4;
    }

    // v5: widen FTS to profile_name + grinder_model, rebuild the index
    if version < 5 {
        tracing::info!("migrating shot history to v5 (FTS profile + grinder)");
        conn.execute_batch(
            r"
            DROP TRIGGER IF EXISTS shots_ai;
            DROP TRIGGER IF EXISTS shots_ad;
            DROP TRIGGER IF EXISTS shots_au;
            DROP TABLE IF EXISTS shots_fts;
            ",
        )?;
        create_fts(conn)?;
        conn.execute(
            "INSERT INTO shots_fts(rowid, espresso_notes, bean_brand, bean_type, profile_name, grinder_model)
             SELECT id, espresso_notes, bean_brand, bean_type, profile_name, grinder_model FROM shots",
            [],
        )?;
        set_version(conn, 5)?;
        version = 5;
    }

    // v6: beverage_type + notes columns, backfill from profile_json
    if version < 6 {
        tracing::info!("migrating shot history to v6 (beverage_type)");
        if !has_column(conn, "shots", "beverage_type")? {
            conn.execute(
                "ALTER TABLE shots ADD COLUMN beverage_type TEXT DEFAULT 'espresso'",
                [],
            )?;
        }
        if !has_column(conn, "shots", "bean_notes")? {
            conn.execute("ALTER TABLE shots ADD COLUMN bean_notes TEXT", [])?;
        }
        if !has_column(conn, "shots", "profile_notes")? {
            conn.execute("ALTER TABLE shots ADD COLUMN profile_notes TEXT", [])?;
        }
        backfill_beverage_type(conn)?;
        set_version(conn, 6)?;
        version = 6;
    }

    // v7: smooth historical weight flow rates. The raw data carries
    // staircase artifacts from 0.1 g scale quantization; apply the same
    // centered moving average used for new shots. Cosmetic: on failure the
    // version is bumped anyway so startup never loops on it.
    if version < 7 {
        tracing::info!("migrating shot history to v7 (smooth weight flow rate)");
        match smooth_existing_flow_rates(conn) {
            Ok(count) => {
                tracing::info!(shots = count, "smoothed historical weight flow rates");
            },
            Err(e) => {
                tracing::warn!(error = %e, "v7 smoothing failed, bumping version anyway");
                set_version(conn, 7)?;
            },
        }
    }

    Ok(())
}

/// Apply the centered moving average to every stored shot's weight flow
/// rate channel, inside one transaction that also bumps the version.
fn smooth_existing_flow_rates(conn: &Connection) -> Result<usize, HistoryError> {
    conn.execute_batch("BEGIN")?;

    let result = (|| -> Result<usize, HistoryError> {
        // Read all blobs first: no read cursor while writing the same table
        let rows: Vec<(i64, Vec<u8>)> = {
            let mut stmt = conn.prepare("SELECT shot_id, data_blob FROM shot_samples")?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            mapped.collect::<Result<_, _>>()?
        };

        let mut smoothed_count = 0usize;
        for (shot_id, blob) in rows {
            let mut samples = match samples::decompress(&blob) {
                Ok(samples) => samples,
                Err(e) => {
                    tracing::warn!(shot_id, error = %e, "skipping undecodable sample blob");
                    continue;
                },
            };
            let Some(channel) = samples.get_mut(samples::WEIGHT_FLOW_RATE) else {
                continue;
            };
            if channel.len() < 3 {
                continue;
            }
            channel.v = samples::smooth_centered(&channel.v);

            let new_blob = samples::compress(&samples)?;
            conn.execute(
                "UPDATE shot_samples SET data_blob = ?1 WHERE shot_id = ?2",
                rusqlite::params![new_blob, shot_id],
            )?;
            smoothed_count += 1;
        }

        set_version(conn, 7)?;
        Ok(smoothed_count)
    })();

    match result {
        Ok(count) => {
            conn.execute_batch("COMMIT")?;
            Ok(count)
        },
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        },
    }
}

/// Parse `beverage_type` out of stored profile JSON for rows still at the
/// default, covering imports from databases that predate the column.
pub fn backfill_beverage_type(conn: &Connection) -> Result<(), HistoryError> {
    let rows: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(
            "SELECT id, profile_json FROM shots
             WHERE profile_json IS NOT NULL AND profile_json != ''
               AND (beverage_type IS NULL OR beverage_type = 'espresso')",
        )?;
        let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        mapped.collect::<Result<_, _>>()?
    };

    for (id, profile_json) in rows {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(&profile_json) else {
            continue;
        };
        let Some(beverage) = json.get("beverage_type").and_then(|v| v.as_str()) else {
            continue;
        };
        if beverage != "espresso" {
            conn.execute(
                "UPDATE shots SET beverage_type = ?1 WHERE id = ?2",
                rusqlite::params![beverage, id],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_schema_at_current_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open(&dir.path().join("shots.db")).expect("open");
        assert_eq!(current_version(&conn).expect("version"), SCHEMA_VERSION);
        assert!(has_column(&conn, "shots", "beverage_type").expect("column"));
        assert!(has_column(&conn, "shot_phases", "transition_reason").expect("column"));

        // WAL journal mode stuck
        let mode: String =
            conn.pragma_query_value(None, "journal_mode", |row| row.get(0)).expect("pragma");
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shots.db");
        drop(open(&path).expect("first open"));
        let conn = open(&path).expect("second open");
        assert_eq!(current_version(&conn).expect("version"), SCHEMA_VERSION);
    }

    #[test]
    fn duplicate_version_rows_collapse_to_max() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shots.db");
        {
            let conn = open(&path).expect("open");
            conn.execute("INSERT INTO schema_version (version) VALUES (3)", []).expect("insert");
        }
        let conn = open(&path).expect("reopen");
        assert_eq!(current_version(&conn).expect("version"), SCHEMA_VERSION);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn v7_smooths_stored_flow_rates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shots.db");

        {
            let conn = open(&path).expect("open");
            // Insert a shot with a staircase flow rate, then rewind the
            // schema version so v7 reruns on next open.
            conn.execute(
                "INSERT INTO shots (uuid, timestamp, profile_name, duration_seconds)
                 VALUES ('u1', 1, 'Test', 30.0)",
                [],
            )
            .expect("shot");
            let mut set = crate::samples::SampleSet::new();
            let stairs: Vec<(f64, f64)> =
                (0..20).map(|i| (f64::from(i) * 0.2, if i % 3 == 0 { 3.0 } else { 1.0 })).collect();
            set.insert(
                samples::WEIGHT_FLOW_RATE.to_string(),
                crate::samples::Channel::from_points(&stairs),
            );
            let blob = samples::compress(&set).expect("compress");
            conn.execute(
                "INSERT INTO shot_samples (shot_id, sample_count, data_blob) VALUES (1, 20, ?1)",
                rusqlite::params![blob],
            )
            .expect("samples");
            conn.execute("DELETE FROM schema_version", []).expect("del");
            conn.execute("INSERT INTO schema_version (version) VALUES (6)", []).expect("ins");
        }

        let conn = open(&path).expect("reopen runs v7");
        assert_eq!(current_version(&conn).expect("version"), 7);

        let blob: Vec<u8> = conn
            .query_row("SELECT data_blob FROM shot_samples WHERE shot_id = 1", [], |row| {
                row.get(0)
            })
            .expect("blob");
        let set = samples::decompress(&blob).expect("decompress");
        let channel = &set[samples::WEIGHT_FLOW_RATE];
        // Smoothed: no value should remain at the staircase extremes
        assert!(channel.v.iter().all(|&v| v > 1.0 && v < 3.0));
        assert_eq!(channel.t.len(), channel.v.len());
    }
}
