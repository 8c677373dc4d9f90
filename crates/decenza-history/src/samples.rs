//! Sample blob codec and smoothing.
//!
//! The time-series for a shot is a JSON object mapping channel names to
//! `{"t": [...], "v": [...]}` arrays, compressed with zlib at level 9 and
//! stored as one BLOB per shot. Channels carry pressure, flow, head/mix
//! temperature, the three goals, resistance, water dispensed, cumulative
//! weight, and the raw/smoothed weight flow rate.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::HistoryError;

/// Channel name for the weight flow rate, the target of smoothing.
pub const WEIGHT_FLOW_RATE: &str = "weightFlowRate";

/// Half-window of the centered moving average (11-point window).
pub const SMOOTHING_HALF_WINDOW: usize = 5;

/// One channel: paired time and value arrays of equal length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Seconds from shot start.
    pub t: Vec<f64>,
    /// Values at those times.
    pub v: Vec<f64>,
}

impl Channel {
    /// Build from (time, value) pairs.
    #[must_use]
    pub fn from_points(points: &[(f64, f64)]) -> Self {
        Self {
            t: points.iter().map(|p| p.0).collect(),
            v: points.iter().map(|p| p.1).collect(),
        }
    }

    /// Number of samples (the shorter of the two arrays if they diverge).
    #[must_use]
    pub fn len(&self) -> usize {
        self.t.len().min(self.v.len())
    }

    /// Whether the channel has no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A full sample set: channel name to channel data.
pub type SampleSet = BTreeMap<String, Channel>;

/// Compress a sample set to the stored blob form (zlib level 9).
pub fn compress(samples: &SampleSet) -> Result<Vec<u8>, HistoryError> {
    let json = serde_json::to_vec(samples).map_err(|e| HistoryError::Blob(e.to_string()))?;
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::best());
    encoder.write_all(&json).map_err(|e| HistoryError::Blob(e.to_string()))?;
    encoder.finish().map_err(|e| HistoryError::Blob(e.to_string()))
}

/// Decompress a stored blob back into a sample set.
///
/// An empty blob yields an empty set; a corrupt blob is an error.
pub fn decompress(blob: &[u8]) -> Result<SampleSet, HistoryError> {
    if blob.is_empty() {
        return Ok(SampleSet::new());
    }
    let mut decoder = flate2::read::ZlibDecoder::new(blob);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json).map_err(|e| HistoryError::Blob(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| HistoryError::Blob(e.to_string()))
}

/// Centered moving average with [`SMOOTHING_HALF_WINDOW`] on each side.
///
/// Windows are clamped at the array edges, so the output has the same
/// length as the input. Used live for scale flow rates and by migration
/// v7 to repair the staircase artifacts of 0.1 g scale quantization in
/// historical shots.
#[must_use]
pub fn smooth_centered(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut smoothed = Vec::with_capacity(n);
    for i in 0..n {
        let lo = i.saturating_sub(SMOOTHING_HALF_WINDOW);
        let hi = (i + SMOOTHING_HALF_WINDOW).min(n - 1);
        let sum: f64 = values[lo..=hi].iter().sum();
        smoothed.push(sum / (hi - lo + 1) as f64);
    }
    smoothed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> SampleSet {
        let mut set = SampleSet::new();
        set.insert(
            "pressure".to_string(),
            Channel::from_points(&[(0.0, 0.0), (0.5, 4.5), (1.0, 9.0)]),
        );
        set.insert(
            "flow".to_string(),
            Channel::from_points(&[(0.0, 0.0), (0.5, 1.0), (1.0, 2.0)]),
        );
        set
    }

    #[test]
    fn blob_round_trip() {
        let set = sample_set();
        let blob = compress(&set).expect("compress");
        let back = decompress(&blob).expect("decompress");
        assert_eq!(back, set);
        for channel in back.values() {
            assert_eq!(channel.t.len(), channel.v.len());
        }
    }

    #[test]
    fn empty_blob_is_empty_set() {
        assert!(decompress(&[]).expect("empty").is_empty());
    }

    #[test]
    fn corrupt_blob_is_error() {
        assert!(decompress(&[0xDE, 0xAD, 0xBE, 0xEF]).is_err());
    }

    #[test]
    fn smoothing_preserves_length_and_flattens_stairs() {
        // Staircase: 0.1 g quantization artifacts
        let stairs = [1.0, 1.0, 3.0, 1.0, 1.0, 3.0, 1.0, 1.0, 3.0, 1.0, 1.0, 3.0, 1.0];
        let smoothed = smooth_centered(&stairs);
        assert_eq!(smoothed.len(), stairs.len());

        // The interior settles near the mean
        let mid = smoothed[6];
        assert!((mid - 5.0 / 3.0).abs() < 0.25, "mid = {mid}");

        // Constant input is unchanged
        let flat = smooth_centered(&[2.0; 20]);
        assert!(flat.iter().all(|&v| (v - 2.0).abs() < 1e-12));
    }

    #[test]
    fn smoothing_handles_short_input() {
        assert!(smooth_centered(&[]).is_empty());
        assert_eq!(smooth_centered(&[5.0]), vec![5.0]);
    }
}
