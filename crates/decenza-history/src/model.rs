//! Shot record types and filter criteria.

use serde::{Deserialize, Serialize};

use crate::samples::SampleSet;

/// Lightweight shot summary for list display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShotSummary {
    /// Row id.
    pub id: i64,
    /// Stable shot UUID.
    pub uuid: String,
    /// Unix seconds.
    pub timestamp: i64,
    /// Profile name at save time.
    pub profile_name: String,
    /// Extraction duration in seconds.
    pub duration: f64,
    /// Final beverage weight in grams.
    pub final_weight: f64,
    /// Dose weight in grams.
    pub dose_weight: f64,
    /// Bean brand.
    pub bean_brand: String,
    /// Bean type.
    pub bean_type: String,
    /// Enjoyment score 0..100.
    pub enjoyment: i64,
    /// Whether a visualizer upload exists.
    pub has_visualizer_upload: bool,
    /// Grinder setting.
    pub grinder_setting: String,
    /// Temperature override, 0 when unset.
    pub temperature_override: f64,
    /// Yield override, 0 when unset.
    pub yield_override: f64,
    /// Beverage kind (espresso/filter/pourover).
    pub beverage_type: String,
    /// Total dissolved solids percentage.
    pub drink_tds: f64,
    /// Extraction yield percentage.
    pub drink_ey: f64,
}

/// One phase marker: where a profile frame transition happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseMarker {
    /// Seconds from shot start.
    pub time: f64,
    /// Display label.
    pub label: String,
    /// Profile frame number.
    pub frame_number: i64,
    /// Whether the frame was flow-controlled.
    pub is_flow_mode: bool,
    /// Why the frame exited: `"weight"`, `"pressure"`, `"flow"`, `"time"`,
    /// or empty for unknown/old data.
    pub transition_reason: String,
}

/// Full shot record for the detail view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShotRecord {
    /// Summary fields.
    #[serde(flatten)]
    pub summary: ShotSummary,

    /// Roast date as entered.
    pub roast_date: String,
    /// Roast level.
    pub roast_level: String,
    /// Grinder model.
    pub grinder_model: String,
    /// Tasting notes.
    pub espresso_notes: String,
    /// Bean notes.
    pub bean_notes: String,
    /// Barista name.
    pub barista: String,
    /// Profile notes.
    pub profile_notes: String,
    /// Visualizer shot id when uploaded.
    pub visualizer_id: String,
    /// Visualizer URL when uploaded.
    pub visualizer_url: String,

    /// Decompressed time-series channels.
    pub samples: SampleSet,
    /// Ordered phase markers.
    pub phases: Vec<PhaseMarker>,
    /// Captured debug log, may be large.
    pub debug_log: String,
    /// Profile JSON snapshot frozen at save time.
    pub profile_json: String,
}

/// Data extracted on the caller's side for an async save.
///
/// Plain values only: the worker that persists this never touches live
/// model state. Samples are compressed before the worker starts because
/// compression reads the model.
#[derive(Debug, Clone, Default)]
pub struct ShotSaveData {
    /// Stable shot UUID.
    pub uuid: String,
    /// Unix seconds.
    pub timestamp: i64,
    /// Profile name.
    pub profile_name: String,
    /// Profile JSON snapshot.
    pub profile_json: String,
    /// Beverage kind.
    pub beverage_type: String,
    /// Duration in seconds.
    pub duration: f64,
    /// Final weight in grams.
    pub final_weight: f64,
    /// Dose weight in grams.
    pub dose_weight: f64,
    /// Temperature override, 0 when unset.
    pub temperature_override: f64,
    /// Yield override, 0 when unset.
    pub yield_override: f64,
    /// Bean brand.
    pub bean_brand: String,
    /// Bean type.
    pub bean_type: String,
    /// Roast date.
    pub roast_date: String,
    /// Roast level.
    pub roast_level: String,
    /// Grinder model.
    pub grinder_model: String,
    /// Grinder setting.
    pub grinder_setting: String,
    /// TDS percentage.
    pub drink_tds: f64,
    /// EY percentage.
    pub drink_ey: f64,
    /// Enjoyment 0..100.
    pub enjoyment: i64,
    /// Tasting notes.
    pub espresso_notes: String,
    /// Barista name.
    pub barista: String,
    /// Profile notes.
    pub profile_notes: String,
    /// Captured debug log.
    pub debug_log: String,
    /// Pre-compressed sample blob.
    pub compressed_samples: Vec<u8>,
    /// Sample count of the longest channel.
    pub sample_count: i64,
    /// Phase markers, sorted by time.
    pub phase_markers: Vec<PhaseMarker>,
}

/// Metadata fields that can be edited after a shot is saved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShotMetadataUpdate {
    /// Bean brand.
    pub bean_brand: Option<String>,
    /// Bean type.
    pub bean_type: Option<String>,
    /// Roast date.
    pub roast_date: Option<String>,
    /// Roast level.
    pub roast_level: Option<String>,
    /// Grinder model.
    pub grinder_model: Option<String>,
    /// Grinder setting.
    pub grinder_setting: Option<String>,
    /// TDS percentage.
    pub drink_tds: Option<f64>,
    /// EY percentage.
    pub drink_ey: Option<f64>,
    /// Enjoyment 0..100.
    pub enjoyment: Option<i64>,
    /// Tasting notes.
    pub espresso_notes: Option<String>,
    /// Bean notes.
    pub bean_notes: Option<String>,
    /// Barista name.
    pub barista: Option<String>,
}

/// Filter criteria for shot queries.
///
/// Field names mirror the HTTP query surface. Absent fields do not
/// constrain; `sort_field` values outside the whitelist fall back to
/// `timestamp`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShotFilter {
    /// Exact profile name.
    pub profile_name: Option<String>,
    /// Exact bean brand.
    pub bean_brand: Option<String>,
    /// Exact bean type.
    pub bean_type: Option<String>,
    /// Exact grinder model.
    pub grinder_model: Option<String>,
    /// Exact grinder setting.
    pub grinder_setting: Option<String>,
    /// Exact roast level.
    pub roast_level: Option<String>,
    /// Minimum enjoyment.
    pub min_enjoyment: Option<i64>,
    /// Maximum enjoyment.
    pub max_enjoyment: Option<i64>,
    /// Minimum dose in grams.
    pub min_dose: Option<f64>,
    /// Maximum dose in grams.
    pub max_dose: Option<f64>,
    /// Minimum yield in grams.
    pub min_yield: Option<f64>,
    /// Maximum yield in grams.
    pub max_yield: Option<f64>,
    /// Minimum duration in seconds.
    pub min_duration: Option<f64>,
    /// Maximum duration in seconds.
    pub max_duration: Option<f64>,
    /// Minimum TDS.
    pub min_tds: Option<f64>,
    /// Maximum TDS.
    pub max_tds: Option<f64>,
    /// Minimum EY.
    pub min_ey: Option<f64>,
    /// Maximum EY.
    pub max_ey: Option<f64>,
    /// Earliest timestamp (Unix seconds, inclusive).
    pub date_from: Option<i64>,
    /// Latest timestamp (Unix seconds, inclusive).
    pub date_to: Option<i64>,
    /// Full-text search over notes, beans, profile, grinder.
    pub search_text: Option<String>,
    /// Only shots with a visualizer upload.
    pub only_with_visualizer: bool,
    /// Sort key (whitelisted, see [`crate::query::sort_expression`]).
    pub sort_field: Option<String>,
    /// `"ASC"` or `"DESC"` (default).
    pub sort_direction: Option<String>,
}

/// Auto-favorite grouping modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FavoriteGroupBy {
    /// Group by bean brand + type.
    Bean,
    /// Group by profile name.
    Profile,
    /// Group by bean + profile.
    BeanProfile,
    /// Group by bean + profile + grinder model + setting.
    BeanProfileGrinder,
}

impl FavoriteGroupBy {
    /// Parse the user-facing mode key; unknown keys get the default
    /// bean+profile grouping.
    #[must_use]
    pub fn from_key(key: &str) -> Self {
        match key {
            "bean" => Self::Bean,
            "profile" => Self::Profile,
            "bean_profile_grinder" => Self::BeanProfileGrinder,
            _ => Self::BeanProfile,
        }
    }
}

/// One auto-favorite entry: the most recent shot of a group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoFavorite {
    /// Most recent shot id in the group.
    pub shot_id: i64,
    /// Profile name.
    pub profile_name: String,
    /// Bean brand.
    pub bean_brand: String,
    /// Bean type.
    pub bean_type: String,
    /// Grinder model.
    pub grinder_model: String,
    /// Grinder setting.
    pub grinder_setting: String,
    /// Dose of the most recent shot.
    pub dose_weight: f64,
    /// Yield of the most recent shot.
    pub final_weight: f64,
    /// Timestamp of the most recent shot.
    pub last_used_timestamp: i64,
    /// Shots in the group.
    pub shot_count: i64,
    /// Average enjoyment over scored shots.
    pub avg_enjoyment: f64,
}

/// Aggregates for one auto-favorite group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteGroupDetails {
    /// Average TDS over shots with TDS recorded.
    pub avg_tds: f64,
    /// Average EY.
    pub avg_ey: f64,
    /// Average duration.
    pub avg_duration: f64,
    /// Average dose.
    pub avg_dose: f64,
    /// Average yield.
    pub avg_yield: f64,
    /// Average temperature override.
    pub avg_temperature: f64,
    /// Non-empty notes, newest first, with their timestamps.
    pub notes: Vec<(i64, String)>,
}

/// Identity of one auto-favorite group for the details query.
#[derive(Debug, Clone, Default)]
pub struct FavoriteGroupKey {
    /// Bean brand (empty matches NULL).
    pub bean_brand: String,
    /// Bean type.
    pub bean_type: String,
    /// Profile name.
    pub profile_name: String,
    /// Grinder model.
    pub grinder_model: String,
    /// Grinder setting.
    pub grinder_setting: String,
}
