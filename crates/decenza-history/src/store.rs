//! Synchronous store operations.
//!
//! Every function takes an explicit connection; workers open their own via
//! [`crate::schema::open_worker`] so concurrent queries never share
//! statement state. Mutations run inside transactions and roll back on
//! failure.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::HistoryError;
use crate::model::{
    AutoFavorite, FavoriteGroupBy, FavoriteGroupDetails, FavoriteGroupKey, PhaseMarker,
    ShotFilter, ShotMetadataUpdate, ShotRecord, ShotSaveData, ShotSummary,
};
use crate::query;
use crate::samples;
use crate::schema;

/// WAL checkpoint modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Non-blocking; checkpoints what it can.
    Passive,
    /// Waits for writers, checkpoints everything.
    Full,
    /// Like Full, then truncates the WAL file.
    Truncate,
}

impl CheckpointMode {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
            Self::Full => "PRAGMA wal_checkpoint(FULL)",
            Self::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        }
    }
}

/// Run a WAL checkpoint.
pub fn checkpoint(conn: &Connection, mode: CheckpointMode) -> Result<(), HistoryError> {
    conn.query_row(mode.as_sql(), [], |_row| Ok(()))?;
    Ok(())
}

/// Insert a shot with its samples and phases, in one transaction.
///
/// Commits, then checkpoints the WAL passively so the main database file
/// trails the log by at most one shot.
pub fn save_shot(conn: &mut Connection, data: &ShotSaveData) -> Result<i64, HistoryError> {
    let tx = conn.transaction()?;

    tx.execute(
        r"INSERT INTO shots (
            uuid, timestamp, profile_name, profile_json, beverage_type,
            duration_seconds, final_weight, dose_weight,
            bean_brand, bean_type, roast_date, roast_level,
            grinder_model, grinder_setting,
            drink_tds, drink_ey, enjoyment, espresso_notes, bean_notes, barista,
            profile_notes, debug_log,
            temperature_override, yield_override
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                  ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
        params![
            data.uuid,
            data.timestamp,
            data.profile_name,
            data.profile_json,
            data.beverage_type,
            data.duration,
            data.final_weight,
            data.dose_weight,
            data.bean_brand,
            data.bean_type,
            data.roast_date,
            data.roast_level,
            data.grinder_model,
            data.grinder_setting,
            data.drink_tds,
            data.drink_ey,
            data.enjoyment,
            data.espresso_notes,
            "",
            data.barista,
            data.profile_notes,
            data.debug_log,
            data.temperature_override,
            data.yield_override,
        ],
    )?;
    let shot_id = tx.last_insert_rowid();

    tx.execute(
        "INSERT INTO shot_samples (shot_id, sample_count, data_blob) VALUES (?1, ?2, ?3)",
        params![shot_id, data.sample_count, data.compressed_samples],
    )?;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO shot_phases (shot_id, time_offset, label, frame_number, is_flow_mode, transition_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for marker in &data.phase_markers {
            stmt.execute(params![
                shot_id,
                marker.time,
                marker.label,
                marker.frame_number,
                i64::from(marker.is_flow_mode),
                marker.transition_reason,
            ])?;
        }
    }

    tx.commit()?;
    checkpoint(conn, CheckpointMode::Passive)?;
    Ok(shot_id)
}

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShotSummary> {
    Ok(ShotSummary {
        id: row.get(0)?,
        uuid: row.get(1)?,
        timestamp: row.get(2)?,
        profile_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        duration: row.get::<_, Option<f64>>(4)?.unwrap_or_default(),
        final_weight: row.get::<_, Option<f64>>(5)?.unwrap_or_default(),
        dose_weight: row.get::<_, Option<f64>>(6)?.unwrap_or_default(),
        bean_brand: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        bean_type: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        enjoyment: row.get::<_, Option<i64>>(9)?.unwrap_or_default(),
        has_visualizer_upload: row.get::<_, Option<String>>(10)?.is_some(),
        grinder_setting: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
        temperature_override: row.get::<_, Option<f64>>(12)?.unwrap_or_default(),
        yield_override: row.get::<_, Option<f64>>(13)?.unwrap_or_default(),
        beverage_type: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
        drink_tds: row.get::<_, Option<f64>>(15)?.unwrap_or_default(),
        drink_ey: row.get::<_, Option<f64>>(16)?.unwrap_or_default(),
    })
}

/// Run the paged list query for a filter.
pub fn list_filtered(
    conn: &Connection,
    filter: &ShotFilter,
    offset: i64,
    limit: i64,
) -> Result<Vec<ShotSummary>, HistoryError> {
    let (sql, binds) = query::build_list_query(filter, offset, limit);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(binds), summary_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Count shots matching a filter.
pub fn count_filtered(conn: &Connection, filter: &ShotFilter) -> Result<i64, HistoryError> {
    let (sql, binds) = query::build_count_query(filter);
    Ok(conn.query_row(&sql, params_from_iter(binds), |row| row.get(0))?)
}

/// Total number of shots.
pub fn shot_count(conn: &Connection) -> Result<i64, HistoryError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM shots", [], |row| row.get(0))?)
}

/// Timestamp of one shot, if it exists.
pub fn shot_timestamp(conn: &Connection, shot_id: i64) -> Result<Option<i64>, HistoryError> {
    Ok(conn
        .query_row("SELECT timestamp FROM shots WHERE id = ?1", [shot_id], |row| row.get(0))
        .optional()?)
}

/// Load the full record for a shot: summary, metadata, decompressed
/// samples, and phase markers ordered by time offset.
pub fn load_shot(conn: &Connection, shot_id: i64) -> Result<Option<ShotRecord>, HistoryError> {
    let sql = format!(
        "SELECT {}, roast_date, roast_level, grinder_model, espresso_notes, bean_notes, \
         barista, profile_notes, visualizer_id, visualizer_url, debug_log, profile_json \
         FROM shots WHERE id = ?1",
        query::SUMMARY_COLUMNS
    );
    let record = conn
        .query_row(&sql, [shot_id], |row| {
            let summary = summary_from_row(row)?;
            Ok(ShotRecord {
                summary,
                roast_date: row.get::<_, Option<String>>(17)?.unwrap_or_default(),
                roast_level: row.get::<_, Option<String>>(18)?.unwrap_or_default(),
                grinder_model: row.get::<_, Option<String>>(19)?.unwrap_or_default(),
                espresso_notes: row.get::<_, Option<String>>(20)?.unwrap_or_default(),
                bean_notes: row.get::<_, Option<String>>(21)?.unwrap_or_default(),
                barista: row.get::<_, Option<String>>(22)?.unwrap_or_default(),
                profile_notes: row.get::<_, Option<String>>(23)?.unwrap_or_default(),
                visualizer_id: row.get::<_, Option<String>>(24)?.unwrap_or_default(),
                visualizer_url: row.get::<_, Option<String>>(25)?.unwrap_or_default(),
                debug_log: row.get::<_, Option<String>>(26)?.unwrap_or_default(),
                profile_json: row.get::<_, Option<String>>(27)?.unwrap_or_default(),
                samples: samples::SampleSet::new(),
                phases: Vec::new(),
            })
        })
        .optional()?;

    let Some(mut record) = record else {
        return Ok(None);
    };

    let blob: Option<Vec<u8>> = conn
        .query_row("SELECT data_blob FROM shot_samples WHERE shot_id = ?1", [shot_id], |row| {
            row.get(0)
        })
        .optional()?;
    if let Some(blob) = blob {
        match samples::decompress(&blob) {
            Ok(set) => record.samples = set,
            Err(e) => tracing::warn!(shot_id, error = %e, "sample blob failed to decode"),
        }
    }

    let mut stmt = conn.prepare(
        "SELECT time_offset, label, frame_number, is_flow_mode, transition_reason
         FROM shot_phases WHERE shot_id = ?1 ORDER BY time_offset",
    )?;
    let phases = stmt.query_map([shot_id], |row| {
        Ok(PhaseMarker {
            time: row.get(0)?,
            label: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            frame_number: row.get::<_, Option<i64>>(2)?.unwrap_or_default(),
            is_flow_mode: row.get::<_, Option<i64>>(3)?.unwrap_or_default() != 0,
            transition_reason: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        })
    })?;
    record.phases = phases.collect::<Result<_, _>>()?;

    Ok(Some(record))
}

/// Load several shots for comparison.
pub fn load_shots(
    conn: &Connection,
    shot_ids: &[i64],
) -> Result<Vec<ShotRecord>, HistoryError> {
    let mut records = Vec::with_capacity(shot_ids.len());
    for &id in shot_ids {
        if let Some(record) = load_shot(conn, id)? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Delete a shot; samples and phases cascade.
pub fn delete_shot(conn: &Connection, shot_id: i64) -> Result<bool, HistoryError> {
    let changed = conn.execute("DELETE FROM shots WHERE id = ?1", [shot_id])?;
    Ok(changed > 0)
}

/// Update editable metadata fields; `None` fields are left untouched.
pub fn update_metadata(
    conn: &Connection,
    shot_id: i64,
    update: &ShotMetadataUpdate,
) -> Result<bool, HistoryError> {
    let mut sets: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    let mut push_text = |column: &str, value: &Option<String>, sets: &mut Vec<String>,
                         binds: &mut Vec<rusqlite::types::Value>| {
        if let Some(v) = value {
            sets.push(format!("{column} = ?"));
            binds.push(rusqlite::types::Value::Text(v.clone()));
        }
    };
    push_text("bean_brand", &update.bean_brand, &mut sets, &mut binds);
    push_text("bean_type", &update.bean_type, &mut sets, &mut binds);
    push_text("roast_date", &update.roast_date, &mut sets, &mut binds);
    push_text("roast_level", &update.roast_level, &mut sets, &mut binds);
    push_text("grinder_model", &update.grinder_model, &mut sets, &mut binds);
    push_text("grinder_setting", &update.grinder_setting, &mut sets, &mut binds);
    push_text("espresso_notes", &update.espresso_notes, &mut sets, &mut binds);
    push_text("bean_notes", &update.bean_notes, &mut sets, &mut binds);
    push_text("barista", &update.barista, &mut sets, &mut binds);

    if let Some(v) = update.drink_tds {
        sets.push("drink_tds = ?".to_string());
        binds.push(rusqlite::types::Value::Real(v));
    }
    if let Some(v) = update.drink_ey {
        sets.push("drink_ey = ?".to_string());
        binds.push(rusqlite::types::Value::Real(v));
    }
    if let Some(v) = update.enjoyment {
        sets.push("enjoyment = ?".to_string());
        binds.push(rusqlite::types::Value::Integer(v));
    }

    if sets.is_empty() {
        return Ok(false);
    }

    let sql = format!(
        "UPDATE shots SET {}, updated_at = strftime('%s', 'now') WHERE id = ?",
        sets.join(", ")
    );
    binds.push(rusqlite::types::Value::Integer(shot_id));
    let changed = conn.execute(&sql, params_from_iter(binds))?;
    Ok(changed > 0)
}

/// Record a visualizer upload. Id and URL are set together.
pub fn update_visualizer(
    conn: &Connection,
    shot_id: i64,
    visualizer_id: &str,
    visualizer_url: &str,
) -> Result<bool, HistoryError> {
    let changed = conn.execute(
        "UPDATE shots SET visualizer_id = ?1, visualizer_url = ?2,
         updated_at = strftime('%s', 'now') WHERE id = ?3",
        params![visualizer_id, visualizer_url, shot_id],
    )?;
    Ok(changed > 0)
}

/// Distinct non-empty values for a whitelisted column, sorted.
pub fn distinct_values(conn: &Connection, column: &str) -> Result<Vec<String>, HistoryError> {
    if !query::is_distinct_column(column) {
        tracing::warn!(column, "rejected distinct-value column");
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT DISTINCT {column} FROM shots
         WHERE {column} IS NOT NULL AND {column} != '' ORDER BY {column}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Distinct values constrained by the cascading dropdown filter.
///
/// Only the profile/bean text criteria participate, and the queried
/// column never filters on itself.
pub fn distinct_values_filtered(
    conn: &Connection,
    column: &str,
    filter: &ShotFilter,
) -> Result<Vec<String>, HistoryError> {
    if !query::is_distinct_column(column) {
        tracing::warn!(column, "rejected distinct-value column");
        return Ok(Vec::new());
    }

    let mut sql = format!(
        "SELECT DISTINCT {column} FROM shots WHERE {column} IS NOT NULL AND {column} != ''"
    );
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    let cascade: [(&str, &Option<String>); 3] = [
        ("profile_name", &filter.profile_name),
        ("bean_brand", &filter.bean_brand),
        ("bean_type", &filter.bean_type),
    ];
    for (filter_column, value) in cascade {
        if filter_column == column {
            continue;
        }
        if let Some(value) = value {
            if !value.is_empty() {
                sql.push_str(&format!(" AND {filter_column} = ?"));
                binds.push(rusqlite::types::Value::Text(value.clone()));
            }
        }
    }
    sql.push_str(&format!(" ORDER BY {column}"));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(binds), |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Most recent shot per group plus group aggregates.
pub fn auto_favorites(
    conn: &Connection,
    group_by: FavoriteGroupBy,
    max_items: i64,
) -> Result<Vec<AutoFavorite>, HistoryError> {
    let sql = query::build_favorites_query(group_by, max_items);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(AutoFavorite {
            shot_id: row.get(0)?,
            profile_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            bean_brand: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            bean_type: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            grinder_model: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            grinder_setting: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            dose_weight: row.get::<_, Option<f64>>(6)?.unwrap_or_default(),
            final_weight: row.get::<_, Option<f64>>(7)?.unwrap_or_default(),
            last_used_timestamp: row.get(8)?,
            shot_count: row.get(9)?,
            avg_enjoyment: row.get::<_, Option<f64>>(10)?.unwrap_or_default(),
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Aggregates for one favorite group: averages plus all non-empty notes,
/// newest first.
pub fn favorite_group_details(
    conn: &Connection,
    group_by: FavoriteGroupBy,
    key: &FavoriteGroupKey,
) -> Result<FavoriteGroupDetails, HistoryError> {
    let (where_clause, binds) = query::build_favorite_group_where(group_by, key);

    let stats_sql = format!(
        "SELECT \
         AVG(CASE WHEN drink_tds > 0 THEN drink_tds ELSE NULL END), \
         AVG(CASE WHEN drink_ey > 0 THEN drink_ey ELSE NULL END), \
         AVG(CASE WHEN duration_seconds > 0 THEN duration_seconds ELSE NULL END), \
         AVG(CASE WHEN dose_weight > 0 THEN dose_weight ELSE NULL END), \
         AVG(CASE WHEN final_weight > 0 THEN final_weight ELSE NULL END), \
         AVG(CASE WHEN temperature_override > 0 THEN temperature_override ELSE NULL END) \
         FROM shots{where_clause}"
    );
    let mut details = conn.query_row(
        &stats_sql,
        params_from_iter(binds.clone()),
        |row| {
            Ok(FavoriteGroupDetails {
                avg_tds: row.get::<_, Option<f64>>(0)?.unwrap_or_default(),
                avg_ey: row.get::<_, Option<f64>>(1)?.unwrap_or_default(),
                avg_duration: row.get::<_, Option<f64>>(2)?.unwrap_or_default(),
                avg_dose: row.get::<_, Option<f64>>(3)?.unwrap_or_default(),
                avg_yield: row.get::<_, Option<f64>>(4)?.unwrap_or_default(),
                avg_temperature: row.get::<_, Option<f64>>(5)?.unwrap_or_default(),
                notes: Vec::new(),
            })
        },
    )?;

    let notes_sql = format!(
        "SELECT timestamp, espresso_notes FROM shots{where_clause} \
         AND espresso_notes IS NOT NULL AND espresso_notes != '' \
         ORDER BY timestamp DESC"
    );
    let mut stmt = conn.prepare(&notes_sql)?;
    let rows = stmt.query_map(params_from_iter(binds), |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    details.notes = rows.collect::<Result<_, _>>()?;

    Ok(details)
}

/// Import shots from another database file.
///
/// With `merge = false` all existing shot data is deleted first; with
/// `merge = true` shots whose UUID already exists are skipped. Source
/// phase queries tolerate a missing `transition_reason` column (older
/// databases). Returns `(imported, skipped)`.
pub fn import_database(
    dest: &mut Connection,
    source_path: &Path,
    merge: bool,
) -> Result<(usize, usize), HistoryError> {
    let src = Connection::open_with_flags(
        source_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .map_err(|e| HistoryError::Import(format!("failed to open import database: {e}")))?;

    let source_count: i64 = src
        .query_row("SELECT COUNT(*) FROM shots", [], |row| row.get(0))
        .map_err(|_| {
            HistoryError::Import("import file is not a valid shots database".to_string())
        })?;
    if source_count == 0 {
        return Err(HistoryError::Import("import file contains no shots".to_string()));
    }

    let src_has_reason = schema::has_column(&src, "shot_phases", "transition_reason")?;

    let tx = dest.transaction()?;

    if !merge {
        tx.execute("DELETE FROM shot_phases", [])?;
        tx.execute("DELETE FROM shot_samples", [])?;
        tx.execute("DELETE FROM shots", [])?;
    }

    let existing_uuids: HashSet<String> = if merge {
        let mut stmt = tx.prepare("SELECT uuid FROM shots")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<_, _>>()?
    } else {
        HashSet::new()
    };

    let columns = [
        "uuid", "timestamp", "profile_name", "profile_json", "beverage_type",
        "duration_seconds", "final_weight", "dose_weight",
        "bean_brand", "bean_type", "roast_date", "roast_level",
        "grinder_model", "grinder_setting", "drink_tds", "drink_ey",
        "enjoyment", "espresso_notes", "bean_notes", "barista",
        "profile_notes", "visualizer_id", "visualizer_url", "debug_log",
        "temperature_override", "yield_override",
    ];
    // Source databases may predate some columns; select what exists
    let src_columns: Vec<&str> = {
        let mut present = Vec::new();
        for column in columns {
            if schema::has_column(&src, "shots", column)? {
                present.push(column);
            }
        }
        present
    };

    let select_sql =
        format!("SELECT id, {} FROM shots", src_columns.join(", "));
    let insert_sql = format!(
        "INSERT INTO shots ({}) VALUES ({})",
        src_columns.join(", "),
        src_columns.iter().enumerate().map(|(i, _)| format!("?{}", i + 1)).collect::<Vec<_>>().join(", ")
    );

    let mut imported = 0usize;
    let mut skipped = 0usize;

    let mut select = src.prepare(&select_sql)?;
    let mut insert = tx.prepare(&insert_sql)?;
    let uuid_index = src_columns.iter().position(|c| *c == "uuid").unwrap_or(0) + 1;

    let mut rows = select.query([])?;
    while let Some(row) = rows.next()? {
        let old_id: i64 = row.get(0)?;
        let uuid: String = row.get(uuid_index)?;

        if merge && existing_uuids.contains(&uuid) {
            skipped += 1;
            continue;
        }

        let values: Vec<rusqlite::types::Value> = (1..=src_columns.len())
            .map(|i| row.get_ref(i).map(|v| v.into()))
            .collect::<Result<_, _>>()?;
        if let Err(e) = insert.execute(params_from_iter(values)) {
            tracing::warn!(uuid, error = %e, "failed to import shot, skipping");
            continue;
        }
        let new_id = tx.last_insert_rowid();

        // Samples
        let sample: Option<(i64, Vec<u8>)> = src
            .query_row(
                "SELECT sample_count, data_blob FROM shot_samples WHERE shot_id = ?1",
                [old_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((count, blob)) = sample {
            tx.execute(
                "INSERT INTO shot_samples (shot_id, sample_count, data_blob) VALUES (?1, ?2, ?3)",
                params![new_id, count, blob],
            )?;
        }

        // Phases, tolerating the missing column
        let phase_sql = if src_has_reason {
            "SELECT time_offset, label, frame_number, is_flow_mode, transition_reason
             FROM shot_phases WHERE shot_id = ?1"
        } else {
            "SELECT time_offset, label, frame_number, is_flow_mode, '' AS transition_reason
             FROM shot_phases WHERE shot_id = ?1"
        };
        let mut phase_stmt = src.prepare(phase_sql)?;
        let mut phase_rows = phase_stmt.query([old_id])?;
        while let Some(phase) = phase_rows.next()? {
            tx.execute(
                "INSERT INTO shot_phases (shot_id, time_offset, label, frame_number, is_flow_mode, transition_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new_id,
                    phase.get::<_, f64>(0)?,
                    phase.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    phase.get::<_, Option<i64>>(2)?.unwrap_or_default(),
                    phase.get::<_, Option<i64>>(3)?.unwrap_or_default(),
                    phase.get::<_, Option<String>>(4)?.unwrap_or_default(),
                ],
            )?;
        }

        imported += 1;
    }
    drop(rows);
    drop(insert);

    tx.commit()?;

    schema::backfill_beverage_type(dest)?;
    tracing::info!(imported, skipped, "database import complete");
    Ok((imported, skipped))
}

/// Snapshot the database to a destination file.
///
/// Opens a dedicated connection, checkpoints FULL then TRUNCATE so the
/// main file is complete and the WAL is empty, then file-copies it.
pub fn snapshot_to(db_path: &Path, dest_path: &Path) -> Result<(), HistoryError> {
    {
        let conn = schema::open_worker(db_path)?;
        checkpoint(&conn, CheckpointMode::Full)?;
        checkpoint(&conn, CheckpointMode::Truncate)?;
    }
    std::fs::copy(db_path, dest_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::{Channel, SampleSet};

    fn test_conn() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = schema::open(&dir.path().join("shots.db")).expect("open");
        (dir, conn)
    }

    fn save_data(uuid: &str, enjoyment: i64, bean: &str) -> ShotSaveData {
        let mut set = SampleSet::new();
        set.insert(
            "pressure".to_string(),
            Channel::from_points(&[(0.0, 0.0), (1.0, 9.0), (2.0, 9.1)]),
        );
        set.insert("flow".to_string(), Channel::from_points(&[(0.0, 0.0), (1.0, 2.0), (2.0, 2.1)]));
        set.insert(
            "temperature".to_string(),
            Channel::from_points(&[(0.0, 90.0), (1.0, 92.5), (2.0, 93.0)]),
        );
        ShotSaveData {
            uuid: uuid.to_string(),
            timestamp: 1_700_000_000 + enjoyment,
            profile_name: "D-Flow".to_string(),
            profile_json: r#"{"title":"D-Flow","beverage_type":"espresso"}"#.to_string(),
            beverage_type: "espresso".to_string(),
            duration: 28.0,
            final_weight: 36.0,
            dose_weight: 18.0,
            bean_brand: bean.to_string(),
            bean_type: "Red Brick".to_string(),
            grinder_model: "Niche Zero".to_string(),
            grinder_setting: "14".to_string(),
            enjoyment,
            espresso_notes: "fruity, sweet finish".to_string(),
            compressed_samples: samples::compress(&set).expect("compress"),
            sample_count: 3,
            phase_markers: vec![
                PhaseMarker {
                    time: 0.0,
                    label: "preinfusion".to_string(),
                    frame_number: 0,
                    is_flow_mode: false,
                    transition_reason: String::new(),
                },
                PhaseMarker {
                    time: 8.0,
                    label: "pour".to_string(),
                    frame_number: 1,
                    is_flow_mode: true,
                    transition_reason: "pressure".to_string(),
                },
            ],
            ..ShotSaveData::default()
        }
    }

    #[test]
    fn save_then_load_round_trip() {
        let (_dir, mut conn) = test_conn();
        let id = save_shot(&mut conn, &save_data("u1", 80, "Square Mile")).expect("save");
        assert!(id > 0);

        let record = load_shot(&conn, id).expect("load").expect("present");
        assert_eq!(record.summary.uuid, "u1");
        assert_eq!(record.summary.profile_name, "D-Flow");
        assert!((record.summary.dose_weight - 18.0).abs() < f64::EPSILON);
        assert!((record.summary.final_weight - 36.0).abs() < f64::EPSILON);

        // Decompressed channels match what was stored, equal lengths
        for name in ["pressure", "flow", "temperature"] {
            let channel = record.samples.get(name).expect(name);
            assert_eq!(channel.t.len(), 3);
            assert_eq!(channel.t.len(), channel.v.len());
        }

        // Phases sorted by time
        assert_eq!(record.phases.len(), 2);
        assert_eq!(record.phases[0].label, "preinfusion");
        assert_eq!(record.phases[1].transition_reason, "pressure");
    }

    #[test]
    fn filter_by_enjoyment_sorts_descending() {
        let (_dir, mut conn) = test_conn();
        save_shot(&mut conn, &save_data("u1", 40, "Square Mile")).expect("save");
        save_shot(&mut conn, &save_data("u2", 80, "Square Mile")).expect("save");
        save_shot(&mut conn, &save_data("u3", 90, "Square Mile")).expect("save");

        let filter = ShotFilter {
            min_enjoyment: Some(50),
            sort_field: Some("enjoyment".to_string()),
            sort_direction: Some("DESC".to_string()),
            ..ShotFilter::default()
        };
        let shots = list_filtered(&conn, &filter, 0, 10).expect("list");
        assert_eq!(shots.len(), 2);
        assert_eq!(shots[0].enjoyment, 90);
        assert_eq!(shots[1].enjoyment, 80);
        assert_eq!(count_filtered(&conn, &filter).expect("count"), 2);
    }

    #[test]
    fn fts_search_matches_notes_and_profile() {
        let (_dir, mut conn) = test_conn();
        save_shot(&mut conn, &save_data("u1", 80, "Square Mile")).expect("save");

        for needle in ["fruity", "D-Flow", "Square"] {
            let filter =
                ShotFilter { search_text: Some(needle.to_string()), ..ShotFilter::default() };
            let shots = list_filtered(&conn, &filter, 0, 10).expect("list");
            assert_eq!(shots.len(), 1, "search: {needle}");
        }

        let filter =
            ShotFilter { search_text: Some("nonexistent".to_string()), ..ShotFilter::default() };
        assert!(list_filtered(&conn, &filter, 0, 10).expect("list").is_empty());
    }

    #[test]
    fn ratio_sort_puts_zero_dose_last() {
        let (_dir, mut conn) = test_conn();
        let mut zero_dose = save_data("u1", 50, "A");
        zero_dose.dose_weight = 0.0;
        save_shot(&mut conn, &zero_dose).expect("save");
        save_shot(&mut conn, &save_data("u2", 60, "B")).expect("save");

        let filter = ShotFilter {
            sort_field: Some("ratio".to_string()),
            sort_direction: Some("DESC".to_string()),
            ..ShotFilter::default()
        };
        let shots = list_filtered(&conn, &filter, 0, 10).expect("list");
        assert_eq!(shots.len(), 2);
        assert_eq!(shots[0].uuid, "u2");
        assert_eq!(shots[1].uuid, "u1", "zero dose sorts last in DESC");
    }

    #[test]
    fn delete_cascades_to_samples_and_phases() {
        let (_dir, mut conn) = test_conn();
        let id = save_shot(&mut conn, &save_data("u1", 80, "A")).expect("save");
        assert!(delete_shot(&conn, id).expect("delete"));

        let samples: i64 = conn
            .query_row("SELECT COUNT(*) FROM shot_samples", [], |row| row.get(0))
            .expect("count");
        let phases: i64 = conn
            .query_row("SELECT COUNT(*) FROM shot_phases", [], |row| row.get(0))
            .expect("count");
        assert_eq!(samples, 0);
        assert_eq!(phases, 0);
        assert!(!delete_shot(&conn, id).expect("idempotent"));
    }

    #[test]
    fn distinct_values_whitelist_and_content() {
        let (_dir, mut conn) = test_conn();
        save_shot(&mut conn, &save_data("u1", 80, "Square Mile")).expect("save");
        save_shot(&mut conn, &save_data("u2", 70, "La Cabra")).expect("save");

        let brands = distinct_values(&conn, "bean_brand").expect("distinct");
        assert_eq!(brands, vec!["La Cabra".to_string(), "Square Mile".to_string()]);

        assert!(distinct_values(&conn, "debug_log").expect("rejected").is_empty());
    }

    #[test]
    fn auto_favorites_groups_and_aggregates() {
        let (_dir, mut conn) = test_conn();
        save_shot(&mut conn, &save_data("u1", 60, "Square Mile")).expect("save");
        save_shot(&mut conn, &save_data("u2", 80, "Square Mile")).expect("save");
        save_shot(&mut conn, &save_data("u3", 90, "La Cabra")).expect("save");

        let favorites =
            auto_favorites(&conn, FavoriteGroupBy::Bean, 10).expect("favorites");
        assert_eq!(favorites.len(), 2);

        let square = favorites
            .iter()
            .find(|f| f.bean_brand == "Square Mile")
            .expect("group present");
        assert_eq!(square.shot_count, 2);
        assert!((square.avg_enjoyment - 70.0).abs() < f64::EPSILON);

        let details = favorite_group_details(
            &conn,
            FavoriteGroupBy::Bean,
            &FavoriteGroupKey {
                bean_brand: "Square Mile".to_string(),
                bean_type: "Red Brick".to_string(),
                ..FavoriteGroupKey::default()
            },
        )
        .expect("details");
        assert_eq!(details.notes.len(), 2);
        assert!((details.avg_dose - 18.0).abs() < f64::EPSILON);
    }

    #[test]
    fn import_merge_skips_existing_uuids() {
        let src_dir = tempfile::tempdir().expect("tempdir");
        let src_path = src_dir.path().join("src.db");
        {
            let mut src = schema::open(&src_path).expect("open src");
            save_shot(&mut src, &save_data("shared", 50, "A")).expect("save");
            save_shot(&mut src, &save_data("unique", 60, "B")).expect("save");
        }

        let (_dir, mut dest) = test_conn();
        save_shot(&mut dest, &save_data("shared", 50, "A")).expect("save");

        let (imported, skipped) = import_database(&mut dest, &src_path, true).expect("import");
        assert_eq!(imported, 1);
        assert_eq!(skipped, 1);
        assert_eq!(shot_count(&dest).expect("count"), 2);
    }

    #[test]
    fn import_replace_clears_destination() {
        let src_dir = tempfile::tempdir().expect("tempdir");
        let src_path = src_dir.path().join("src.db");
        {
            let mut src = schema::open(&src_path).expect("open src");
            save_shot(&mut src, &save_data("s1", 50, "A")).expect("save");
        }

        let (_dir, mut dest) = test_conn();
        save_shot(&mut dest, &save_data("old1", 50, "X")).expect("save");
        save_shot(&mut dest, &save_data("old2", 60, "Y")).expect("save");

        import_database(&mut dest, &src_path, false).expect("import");
        assert_eq!(shot_count(&dest).expect("count"), 1);
        let shots = list_filtered(&dest, &ShotFilter::default(), 0, 10).expect("list");
        assert_eq!(shots[0].uuid, "s1");
    }

    #[test]
    fn import_rejects_non_database() {
        let src_dir = tempfile::tempdir().expect("tempdir");
        let src_path = src_dir.path().join("garbage.db");
        std::fs::write(&src_path, b"not a database at all").expect("write");

        let (_dir, mut dest) = test_conn();
        assert!(matches!(
            import_database(&mut dest, &src_path, true),
            Err(HistoryError::Import(_))
        ));
    }

    #[test]
    fn snapshot_produces_openable_copy() {
        let (_dir, mut conn) = test_conn();
        save_shot(&mut conn, &save_data("u1", 80, "A")).expect("save");
        let db_path = conn.path().map(std::path::PathBuf::from).expect("path");

        let dest_dir = tempfile::tempdir().expect("tempdir");
        let dest = dest_dir.path().join("snapshot.db");
        snapshot_to(&db_path, &dest).expect("snapshot");

        let copy = schema::open_worker(&dest).expect("open copy");
        assert_eq!(shot_count(&copy).expect("count"), 1);
    }

    #[test]
    fn update_metadata_touches_only_given_fields() {
        let (_dir, mut conn) = test_conn();
        let id = save_shot(&mut conn, &save_data("u1", 80, "A")).expect("save");

        let update = ShotMetadataUpdate {
            enjoyment: Some(95),
            espresso_notes: Some("even better".to_string()),
            ..ShotMetadataUpdate::default()
        };
        assert!(update_metadata(&conn, id, &update).expect("update"));

        let record = load_shot(&conn, id).expect("load").expect("present");
        assert_eq!(record.summary.enjoyment, 95);
        assert_eq!(record.espresso_notes, "even better");
        assert_eq!(record.summary.bean_brand, "A", "untouched field");
    }

    #[test]
    fn visualizer_fields_set_together() {
        let (_dir, mut conn) = test_conn();
        let id = save_shot(&mut conn, &save_data("u1", 80, "A")).expect("save");
        assert!(update_visualizer(&conn, id, "viz123", "https://v.example/123").expect("update"));

        let record = load_shot(&conn, id).expect("load").expect("present");
        assert!(record.summary.has_visualizer_upload);
        assert_eq!(record.visualizer_id, "viz123");
        assert_eq!(record.visualizer_url, "https://v.example/123");
    }
}
