//! Daily backup schedule.
//!
//! An hourly tick asks [`should_backup_now`]; the decision is pure so the
//! once-per-day and hour-gate rules are testable without a clock.

use chrono::{NaiveDate, NaiveDateTime, Timelike};

/// Interval between schedule checks.
pub const CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Whether a scheduled backup should run now.
///
/// - `backup_hour` of -1 (or any negative) disables the schedule.
/// - At most one backup per local calendar day.
/// - The backup fires on the first check at or after the configured hour.
#[must_use]
pub fn should_backup_now(
    backup_hour: i64,
    last_backup: Option<NaiveDate>,
    now: NaiveDateTime,
) -> bool {
    if backup_hour < 0 {
        return false;
    }
    if last_backup == Some(now.date()) {
        return false;
    }
    i64::from(now.hour()) >= backup_hour
}
