//! Pure SQL builders: filter WHERE clauses, the FTS5 query formatter, and
//! the sort-column whitelist.
//!
//! Everything here is string-and-parameter assembly with no database
//! access, so the exact SQL shape is asserted in unit tests. User input
//! reaches SQL in exactly two ways: as bound parameters, or through
//! [`format_fts_query`] whose output is fully quoted and escaped (the
//! SQLite driver cannot bind parameters inside a `MATCH` expression).

use rusqlite::types::Value as SqlValue;

use crate::model::{FavoriteGroupBy, FavoriteGroupKey, ShotFilter};

/// The summary columns selected by every list query, in column order.
pub const SUMMARY_COLUMNS: &str = "id, uuid, timestamp, profile_name, duration_seconds, \
     final_weight, dose_weight, bean_brand, bean_type, \
     enjoyment, visualizer_id, grinder_setting, \
     temperature_override, yield_override, beverage_type, \
     drink_tds, drink_ey";

/// Map a user-facing sort key to its SQL expression.
///
/// A closed whitelist: anything outside it sorts by `timestamp`. `ratio`
/// computes yield/dose with zero-dose rows pinned to 0 so they sort last
/// in the default descending order.
#[must_use]
pub fn sort_expression(sort_field: &str) -> &'static str {
    match sort_field {
        "profile_name" => "LOWER(profile_name)",
        "bean_brand" => "LOWER(bean_brand)",
        "bean_type" => "LOWER(bean_type)",
        "enjoyment" => "enjoyment",
        "ratio" => "CASE WHEN dose_weight > 0 THEN CAST(final_weight AS REAL) / dose_weight ELSE 0 END",
        "duration_seconds" => "duration_seconds",
        "dose_weight" => "dose_weight",
        "final_weight" => "final_weight",
        _ => "timestamp",
    }
}

/// Build `ORDER BY` from the filter's sort settings.
#[must_use]
pub fn order_by_clause(filter: &ShotFilter) -> String {
    let expr = sort_expression(filter.sort_field.as_deref().unwrap_or("timestamp"));
    let dir = match filter.sort_direction.as_deref() {
        Some("ASC") => "ASC",
        _ => "DESC",
    };
    format!("ORDER BY {expr} {dir}")
}

/// Build the WHERE clause (with leading ` WHERE `) and its bound values.
///
/// Returns an empty string when nothing constrains. The FTS search text is
/// NOT part of this clause; see [`fts_subquery_clause`].
#[must_use]
pub fn build_filter_where(filter: &ShotFilter) -> (String, Vec<SqlValue>) {
    let mut conditions: Vec<&'static str> = Vec::new();
    let mut binds: Vec<SqlValue> = Vec::new();

    let mut text = |conditions: &mut Vec<&'static str>,
                    binds: &mut Vec<SqlValue>,
                    condition: &'static str,
                    value: &Option<String>| {
        if let Some(value) = value {
            if !value.is_empty() {
                conditions.push(condition);
                binds.push(SqlValue::Text(value.clone()));
            }
        }
    };

    text(&mut conditions, &mut binds, "profile_name = ?", &filter.profile_name);
    text(&mut conditions, &mut binds, "bean_brand = ?", &filter.bean_brand);
    text(&mut conditions, &mut binds, "bean_type = ?", &filter.bean_type);
    text(&mut conditions, &mut binds, "grinder_model = ?", &filter.grinder_model);
    text(&mut conditions, &mut binds, "grinder_setting = ?", &filter.grinder_setting);
    text(&mut conditions, &mut binds, "roast_level = ?", &filter.roast_level);

    if let Some(v) = filter.min_enjoyment {
        conditions.push("enjoyment >= ?");
        binds.push(SqlValue::Integer(v));
    }
    if let Some(v) = filter.max_enjoyment {
        conditions.push("enjoyment <= ?");
        binds.push(SqlValue::Integer(v));
    }

    let mut real = |conditions: &mut Vec<&'static str>,
                    binds: &mut Vec<SqlValue>,
                    condition: &'static str,
                    value: Option<f64>| {
        if let Some(v) = value {
            conditions.push(condition);
            binds.push(SqlValue::Real(v));
        }
    };
    real(&mut conditions, &mut binds, "dose_weight >= ?", filter.min_dose);
    real(&mut conditions, &mut binds, "dose_weight <= ?", filter.max_dose);
    real(&mut conditions, &mut binds, "final_weight >= ?", filter.min_yield);
    real(&mut conditions, &mut binds, "final_weight <= ?", filter.max_yield);
    real(&mut conditions, &mut binds, "duration_seconds >= ?", filter.min_duration);
    real(&mut conditions, &mut binds, "duration_seconds <= ?", filter.max_duration);
    real(&mut conditions, &mut binds, "drink_tds >= ?", filter.min_tds);
    real(&mut conditions, &mut binds, "drink_tds <= ?", filter.max_tds);
    real(&mut conditions, &mut binds, "drink_ey >= ?", filter.min_ey);
    real(&mut conditions, &mut binds, "drink_ey <= ?", filter.max_ey);

    if let Some(v) = filter.date_from {
        if v > 0 {
            conditions.push("timestamp >= ?");
            binds.push(SqlValue::Integer(v));
        }
    }
    if let Some(v) = filter.date_to {
        if v > 0 {
            conditions.push("timestamp <= ?");
            binds.push(SqlValue::Integer(v));
        }
    }
    if filter.only_with_visualizer {
        conditions.push("visualizer_id IS NOT NULL");
    }

    if conditions.is_empty() {
        (String::new(), binds)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), binds)
    }
}

/// Format user search text for FTS5 MATCH.
///
/// FTS5 tokenizes on punctuation, so hyphens, slashes, and dots are
/// replaced with spaces to split the input the same way the index was
/// tokenized. Each token is escaped (embedded quotes doubled), wrapped in
/// double quotes, and suffixed with `*` for prefix matching; tokens join
/// with spaces (FTS5 implicit AND). Empty or whitespace input yields an
/// empty string, meaning "no FTS constraint".
#[must_use]
pub fn format_fts_query(user_input: &str) -> String {
    let normalized: String = user_input
        .chars()
        .map(|c| if matches!(c, '-' | '/' | '.') { ' ' } else { c })
        .collect();

    normalized
        .split_whitespace()
        .map(|word| {
            let escaped = word.replace('"', "\"\"").replace('\'', "''");
            format!("\"{escaped}\"*")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// The FTS membership condition, with the formatted query embedded.
///
/// The embedded string comes from [`format_fts_query`] only: every token
/// is double-quoted with internal quotes doubled, so the expression cannot
/// escape its string literal.
#[must_use]
pub fn fts_subquery_clause(fts_query: &str) -> String {
    format!("id IN (SELECT rowid FROM shots_fts WHERE shots_fts MATCH '{fts_query}')")
}

/// Build the paged list query for a filter.
///
/// Returns the SQL plus bound values; `LIMIT ?` / `OFFSET ?` are the last
/// two binds.
#[must_use]
pub fn build_list_query(filter: &ShotFilter, offset: i64, limit: i64) -> (String, Vec<SqlValue>) {
    let (where_clause, mut binds) = build_filter_where(filter);
    let order_by = order_by_clause(filter);

    let fts = filter.search_text.as_deref().map(format_fts_query).unwrap_or_default();

    let sql = if fts.is_empty() {
        format!("SELECT {SUMMARY_COLUMNS} FROM shots{where_clause} {order_by} LIMIT ? OFFSET ?")
    } else {
        // The filter conditions attach with AND behind the FTS condition
        let extra = if where_clause.is_empty() {
            String::new()
        } else {
            where_clause.replacen(" WHERE", " AND", 1)
        };
        format!(
            "SELECT {SUMMARY_COLUMNS} FROM shots WHERE {}{extra} {order_by} LIMIT ? OFFSET ?",
            fts_subquery_clause(&fts)
        )
    };

    binds.push(SqlValue::Integer(limit));
    binds.push(SqlValue::Integer(offset));
    (sql, binds)
}

/// Build the matching COUNT query for a filter.
#[must_use]
pub fn build_count_query(filter: &ShotFilter) -> (String, Vec<SqlValue>) {
    let (where_clause, binds) = build_filter_where(filter);
    let fts = filter.search_text.as_deref().map(format_fts_query).unwrap_or_default();

    let sql = if fts.is_empty() {
        format!("SELECT COUNT(*) FROM shots{where_clause}")
    } else {
        let extra = if where_clause.is_empty() {
            String::new()
        } else {
            where_clause.replacen(" WHERE", " AND", 1)
        };
        format!("SELECT COUNT(*) FROM shots WHERE {}{extra}", fts_subquery_clause(&fts))
    };
    (sql, binds)
}

/// Columns allowed for distinct-value queries.
pub const DISTINCT_COLUMNS: &[&str] = &[
    "profile_name",
    "bean_brand",
    "bean_type",
    "grinder_model",
    "grinder_setting",
    "barista",
    "roast_level",
];

/// Whether `column` may be used in a distinct-value query.
#[must_use]
pub fn is_distinct_column(column: &str) -> bool {
    DISTINCT_COLUMNS.contains(&column)
}

/// The grouping columns for an auto-favorites mode.
#[must_use]
pub fn favorite_group_columns(group_by: FavoriteGroupBy) -> &'static [&'static str] {
    match group_by {
        FavoriteGroupBy::Bean => &["bean_brand", "bean_type"],
        FavoriteGroupBy::Profile => &["profile_name"],
        FavoriteGroupBy::BeanProfile => &["bean_brand", "bean_type", "profile_name"],
        FavoriteGroupBy::BeanProfileGrinder => {
            &["bean_brand", "bean_type", "profile_name", "grinder_model", "grinder_setting"]
        },
    }
}

/// Build the auto-favorites query: most recent shot per group plus group
/// shot count and average enjoyment.
#[must_use]
pub fn build_favorites_query(group_by: FavoriteGroupBy, max_items: i64) -> String {
    let columns = favorite_group_columns(group_by);

    let select_columns: Vec<String> =
        columns.iter().map(|c| format!("COALESCE({c}, '') AS gb_{c}")).collect();
    let group_columns: Vec<String> = columns.iter().map(|c| format!("COALESCE({c}, '')")).collect();
    let join_conditions: Vec<String> =
        columns.iter().map(|c| format!("COALESCE(s.{c}, '') = g.gb_{c}")).collect();

    format!(
        "SELECT s.id, s.profile_name, s.bean_brand, s.bean_type, \
         s.grinder_model, s.grinder_setting, s.dose_weight, s.final_weight, \
         s.timestamp, g.shot_count, g.avg_enjoyment \
         FROM shots s \
         INNER JOIN ( \
           SELECT {}, MAX(timestamp) AS max_ts, \
           COUNT(*) AS shot_count, \
           AVG(CASE WHEN enjoyment > 0 THEN enjoyment ELSE NULL END) AS avg_enjoyment \
           FROM shots \
           WHERE (bean_brand IS NOT NULL AND bean_brand != '') \
              OR (profile_name IS NOT NULL AND profile_name != '') \
           GROUP BY {} \
         ) g ON s.timestamp = g.max_ts AND {} \
         ORDER BY s.timestamp DESC \
         LIMIT {max_items}",
        select_columns.join(", "),
        group_columns.join(", "),
        join_conditions.join(" AND "),
    )
}

/// Build the WHERE clause matching one favorite group, COALESCE-style.
#[must_use]
pub fn build_favorite_group_where(
    group_by: FavoriteGroupBy,
    key: &FavoriteGroupKey,
) -> (String, Vec<SqlValue>) {
    let columns = favorite_group_columns(group_by);
    let mut conditions = Vec::new();
    let mut binds = Vec::new();
    for column in columns {
        conditions.push(format!("COALESCE({column}, '') = ?"));
        let value = match *column {
            "bean_brand" => &key.bean_brand,
            "bean_type" => &key.bean_type,
            "profile_name" => &key.profile_name,
            "grinder_model" => &key.grinder_model,
            _ => &key.grinder_setting,
        };
        binds.push(SqlValue::Text(value.clone()));
    }
    (format!(" WHERE {}", conditions.join(" AND ")), binds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_formatter_examples() {
        assert_eq!(format_fts_query("D-Flow / Q"), "\"D\"* \"Flow\"* \"Q\"*");
        assert_eq!(format_fts_query("fruity's"), "\"fruity''s\"*");
        assert_eq!(format_fts_query(""), "");
        assert_eq!(format_fts_query("   "), "");
        assert_eq!(format_fts_query("a.b"), "\"a\"* \"b\"*");
        assert_eq!(format_fts_query("say \"hi\""), "\"say\"* \"\"\"hi\"\"\"*");
    }

    #[test]
    fn sort_whitelist_falls_back_to_timestamp() {
        assert_eq!(sort_expression("enjoyment"), "enjoyment");
        assert_eq!(sort_expression("timestamp"), "timestamp");
        assert_eq!(sort_expression("ratio"),
            "CASE WHEN dose_weight > 0 THEN CAST(final_weight AS REAL) / dose_weight ELSE 0 END");
        assert_eq!(sort_expression("; DROP TABLE shots"), "timestamp");
        assert_eq!(sort_expression(""), "timestamp");
    }

    #[test]
    fn empty_filter_builds_bare_query() {
        let (sql, binds) = build_list_query(&ShotFilter::default(), 0, 50);
        assert!(sql.starts_with("SELECT id, uuid"));
        assert!(!sql.contains("WHERE"));
        assert!(sql.contains("ORDER BY timestamp DESC"));
        assert_eq!(binds.len(), 2, "limit and offset only");
    }

    #[test]
    fn filter_conditions_bind_in_order() {
        let filter = ShotFilter {
            bean_brand: Some("Square Mile".to_string()),
            min_enjoyment: Some(50),
            sort_field: Some("enjoyment".to_string()),
            ..ShotFilter::default()
        };
        let (sql, binds) = build_list_query(&filter, 10, 25);
        assert!(sql.contains(" WHERE bean_brand = ? AND enjoyment >= ?"));
        assert!(sql.contains("ORDER BY enjoyment DESC"));
        assert_eq!(binds.len(), 4);
        assert_eq!(binds[0], SqlValue::Text("Square Mile".to_string()));
        assert_eq!(binds[1], SqlValue::Integer(50));
        assert_eq!(binds[2], SqlValue::Integer(25), "limit binds before offset");
        assert_eq!(binds[3], SqlValue::Integer(10));
    }

    #[test]
    fn fts_search_wraps_conditions_with_and() {
        let filter = ShotFilter {
            search_text: Some("fruity".to_string()),
            min_enjoyment: Some(50),
            ..ShotFilter::default()
        };
        let (sql, _) = build_list_query(&filter, 0, 50);
        assert!(sql.contains("WHERE id IN (SELECT rowid FROM shots_fts WHERE shots_fts MATCH '\"fruity\"*')"));
        assert!(sql.contains(" AND enjoyment >= ?"));

        let (count_sql, _) = build_count_query(&filter);
        assert!(count_sql.starts_with("SELECT COUNT(*)"));
        assert!(count_sql.contains("shots_fts MATCH"));
    }

    #[test]
    fn distinct_whitelist() {
        assert!(is_distinct_column("bean_brand"));
        assert!(is_distinct_column("roast_level"));
        assert!(!is_distinct_column("debug_log"));
        assert!(!is_distinct_column("shots; DROP TABLE shots"));
    }

    #[test]
    fn favorites_query_group_modes() {
        let sql = build_favorites_query(FavoriteGroupBy::Bean, 10);
        assert!(sql.contains("GROUP BY COALESCE(bean_brand, ''), COALESCE(bean_type, '')"));
        assert!(!sql.contains("gb_profile_name"));

        let sql = build_favorites_query(FavoriteGroupBy::BeanProfileGrinder, 5);
        assert!(sql.contains("gb_grinder_setting"));
        assert!(sql.ends_with("LIMIT 5"));
    }
}
