//! Profile model and upload-protocol packing.
//!
//! A profile is an ordered list of frames plus header metadata. On the wire
//! it becomes: a 5-byte header, one 8-byte frame per step, an optional 8-byte
//! extension frame per step carrying the flow/pressure limiter, and a
//! mandatory 8-byte tail frame carrying the max-total-volume limit.
//!
//! The JSON shape mirrors the persisted profile files, so a stored snapshot
//! can be packed for upload without translation. Unknown keys are ignored on
//! input and absent keys take documented defaults.

use serde::{Deserialize, Serialize};

use crate::fixed;

/// Frame flag bitfield for the 8-byte shot frame.
///
/// Bit assignments match the firmware's `ShotDescriptor`:
///
/// | Bit | Name        | Meaning                                   |
/// |-----|-------------|-------------------------------------------|
/// | 0   | DoCompare   | enable exit comparison                    |
/// | 1   | DC_GT       | compare is greater-than (else less-than)  |
/// | 2   | DC_CompF    | compare flow (else pressure)              |
/// | 3   | TMixTemp    | control mix temperature (else basket)     |
/// | 4   | Interpolate | smooth/ramped transition                  |
/// | 5   | IgnoreLimit | do not clamp against the limiter          |
/// | 6   | CtrlF       | flow control (else pressure control)      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Enable exit comparison.
    pub const DO_COMPARE: u8 = 1 << 0;
    /// Comparison is greater-than (else less-than).
    pub const DC_GT: u8 = 1 << 1;
    /// Comparison is against flow (else pressure).
    pub const DC_COMP_F: u8 = 1 << 2;
    /// Control mix temperature (else basket temperature).
    pub const T_MIX_TEMP: u8 = 1 << 3;
    /// Smooth/ramped transition into this frame.
    pub const INTERPOLATE: u8 = 1 << 4;
    /// Always set: do not clamp the set value against the limiter.
    pub const IGNORE_LIMIT: u8 = 1 << 5;
    /// Flow control (else pressure control).
    pub const CTRL_F: u8 = 1 << 6;

    /// Construct from a raw byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// The raw wire byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        self.0
    }

    /// Whether the given bit mask is set.
    #[must_use]
    pub fn contains(self, mask: u8) -> bool {
        self.0 & mask != 0
    }
}

fn default_temperature() -> f64 {
    93.0
}
fn default_sensor() -> String {
    "coffee".to_string()
}
fn default_pump() -> String {
    "pressure".to_string()
}
fn default_transition() -> String {
    "fast".to_string()
}
fn default_pressure() -> f64 {
    9.0
}
fn default_flow() -> f64 {
    2.0
}
fn default_seconds() -> f64 {
    30.0
}
fn default_limiter_range() -> f64 {
    0.6
}

/// One step of a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFrame {
    /// Display name of the step.
    #[serde(default)]
    pub name: String,
    /// Target temperature in Celsius.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Temperature sensor: `"coffee"` (basket) or `"water"` (mix).
    #[serde(default = "default_sensor")]
    pub sensor: String,
    /// Pump mode: `"pressure"` or `"flow"`.
    #[serde(default = "default_pump")]
    pub pump: String,
    /// Transition into this frame: `"fast"` or `"smooth"`.
    #[serde(default = "default_transition")]
    pub transition: String,
    /// Target pressure in bar (pressure mode).
    #[serde(default = "default_pressure")]
    pub pressure: f64,
    /// Target flow in mL/s (flow mode).
    #[serde(default = "default_flow")]
    pub flow: f64,
    /// Frame duration in seconds.
    #[serde(default = "default_seconds")]
    pub seconds: f64,
    /// Per-frame volume limit in mL (0 = no limit).
    #[serde(default)]
    pub volume: f64,
    /// Whether this frame has an exit condition.
    #[serde(default)]
    pub exit_if: bool,
    /// Exit condition kind: `"pressure_over"`, `"pressure_under"`,
    /// `"flow_over"`, `"flow_under"`.
    #[serde(default)]
    pub exit_type: String,
    /// Exit threshold for `pressure_over`.
    #[serde(default)]
    pub exit_pressure_over: f64,
    /// Exit threshold for `pressure_under`.
    #[serde(default)]
    pub exit_pressure_under: f64,
    /// Exit threshold for `flow_over`.
    #[serde(default)]
    pub exit_flow_over: f64,
    /// Exit threshold for `flow_under`.
    #[serde(default)]
    pub exit_flow_under: f64,
    /// Limiter value (0 = no extension frame emitted).
    #[serde(default)]
    pub max_flow_or_pressure: f64,
    /// Limiter reaction range.
    #[serde(default = "default_limiter_range")]
    pub max_flow_or_pressure_range: f64,
}

impl Default for ProfileFrame {
    fn default() -> Self {
        Self {
            name: String::new(),
            temperature: default_temperature(),
            sensor: default_sensor(),
            pump: default_pump(),
            transition: default_transition(),
            pressure: default_pressure(),
            flow: default_flow(),
            seconds: default_seconds(),
            volume: 0.0,
            exit_if: false,
            exit_type: String::new(),
            exit_pressure_over: 0.0,
            exit_pressure_under: 0.0,
            exit_flow_over: 0.0,
            exit_flow_under: 0.0,
            max_flow_or_pressure: 0.0,
            max_flow_or_pressure_range: default_limiter_range(),
        }
    }
}

impl ProfileFrame {
    /// Compute the wire flag byte for this frame.
    ///
    /// `IgnoreLimit` is always set; the limiter is expressed through the
    /// extension frame instead of clamping.
    #[must_use]
    pub fn compute_flags(&self) -> FrameFlags {
        let mut flags = FrameFlags::IGNORE_LIMIT;

        if self.pump == "flow" {
            flags |= FrameFlags::CTRL_F;
        }
        if self.sensor == "water" {
            flags |= FrameFlags::T_MIX_TEMP;
        }
        if self.transition == "smooth" {
            flags |= FrameFlags::INTERPOLATE;
        }

        if self.exit_if {
            match self.exit_type.as_str() {
                "pressure_under" => flags |= FrameFlags::DO_COMPARE,
                "pressure_over" => flags |= FrameFlags::DO_COMPARE | FrameFlags::DC_GT,
                "flow_under" => flags |= FrameFlags::DO_COMPARE | FrameFlags::DC_COMP_F,
                "flow_over" => {
                    flags |= FrameFlags::DO_COMPARE | FrameFlags::DC_GT | FrameFlags::DC_COMP_F;
                },
                _ => {},
            }
        }

        FrameFlags::from_byte(flags)
    }

    /// The set value for the frame: flow in flow mode, else pressure.
    #[must_use]
    pub fn set_val(&self) -> f64 {
        if self.pump == "flow" { self.flow } else { self.pressure }
    }

    /// The exit-comparison trigger value, 0 when no exit condition is set.
    #[must_use]
    pub fn trigger_val(&self) -> f64 {
        if !self.exit_if {
            return 0.0;
        }
        match self.exit_type.as_str() {
            "pressure_under" => self.exit_pressure_under,
            "pressure_over" => self.exit_pressure_over,
            "flow_under" => self.exit_flow_under,
            "flow_over" => self.exit_flow_over,
            _ => 0.0,
        }
    }
}

fn default_title() -> String {
    "Default".to_string()
}
fn default_beverage() -> String {
    "espresso".to_string()
}
fn default_target() -> f64 {
    36.0
}
fn default_maximum_flow() -> f64 {
    6.0
}

/// A complete profile: header metadata plus ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Display title.
    #[serde(default = "default_title")]
    pub title: String,
    /// Author attribution.
    #[serde(default)]
    pub author: String,
    /// Free-form notes.
    #[serde(default)]
    pub notes: String,
    /// Beverage kind: `"espresso"`, `"filter"`, or `"pourover"`.
    #[serde(default = "default_beverage")]
    pub beverage_type: String,
    /// Stop-at-weight target in grams.
    #[serde(default = "default_target")]
    pub target_weight: f64,
    /// Stop-at-volume target in mL.
    #[serde(default = "default_target")]
    pub target_volume: f64,
    /// How many leading frames count as preinfusion.
    #[serde(default)]
    pub preinfuse_frame_count: u8,
    /// Header minimum-pressure limit (U8P4, 0 = none).
    #[serde(default)]
    pub minimum_pressure: f64,
    /// Header maximum-flow limit (U8P4).
    #[serde(default = "default_maximum_flow")]
    pub maximum_flow: f64,
    /// The ordered steps.
    #[serde(default)]
    pub steps: Vec<ProfileFrame>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            title: default_title(),
            author: String::new(),
            notes: String::new(),
            beverage_type: default_beverage(),
            target_weight: default_target(),
            target_volume: default_target(),
            preinfuse_frame_count: 0,
            minimum_pressure: 0.0,
            maximum_flow: default_maximum_flow(),
            steps: Vec::new(),
        }
    }
}

/// Extension frame index offset: `frame_index | 0x20`.
const EXTENSION_FRAME_BIT: u8 = 0x20;

impl Profile {
    /// Parse a profile from its JSON text. Unknown keys are ignored.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize to indented JSON, the on-disk profile file format.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Pack the 5-byte upload header.
    ///
    /// Layout: version (always 1), frame count, preinfuse frame count,
    /// minimum pressure (U8P4), maximum flow (U8P4).
    #[must_use]
    pub fn header_bytes(&self) -> [u8; 5] {
        [
            1,
            self.steps.len() as u8,
            self.preinfuse_frame_count,
            fixed::encode_u8p4(self.minimum_pressure),
            fixed::encode_u8p4(self.maximum_flow),
        ]
    }

    /// Pack the frame writes in upload order.
    ///
    /// Regular frames first, then one extension frame per step with a
    /// non-zero limiter, then the mandatory tail frame whose index equals
    /// the frame count.
    #[must_use]
    pub fn frame_bytes(&self) -> Vec<[u8; 8]> {
        let mut frames = Vec::with_capacity(self.steps.len() + 1);

        for (i, step) in self.steps.iter().enumerate() {
            let max_vol = fixed::encode_u10p0(step.volume);
            frames.push([
                i as u8,
                step.compute_flags().to_byte(),
                fixed::encode_u8p4(step.set_val()),
                fixed::encode_u8p1(step.temperature),
                fixed::encode_f8_1_7(step.seconds),
                fixed::encode_u8p4(step.trigger_val()),
                (max_vol >> 8) as u8,
                max_vol as u8,
            ]);
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.max_flow_or_pressure > 0.0 {
                frames.push([
                    i as u8 | EXTENSION_FRAME_BIT,
                    fixed::encode_u8p4(step.max_flow_or_pressure),
                    fixed::encode_u8p4(step.max_flow_or_pressure_range),
                    0,
                    0,
                    0,
                    0,
                    0,
                ]);
            }
        }

        let max_total = fixed::encode_u10p0(0.0);
        frames.push([
            self.steps.len() as u8,
            (max_total >> 8) as u8,
            max_total as u8,
            0,
            0,
            0,
            0,
            0,
        ]);

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_pressure_frame() -> Profile {
        Profile {
            steps: vec![ProfileFrame {
                pressure: 9.0,
                temperature: 93.0,
                seconds: 30.0,
                ..ProfileFrame::default()
            }],
            ..Profile::default()
        }
    }

    #[test]
    fn header_for_single_frame() {
        let profile = single_pressure_frame();
        assert_eq!(profile.header_bytes(), [1, 1, 0, 0, 96]);
    }

    #[test]
    fn frame_packing_for_single_frame() {
        let profile = single_pressure_frame();
        let frames = profile.frame_bytes();
        assert_eq!(frames.len(), 2);

        let frame = frames[0];
        assert_eq!(frame[0], 0);
        assert_eq!(frame[1], FrameFlags::IGNORE_LIMIT);
        assert_eq!(frame[2], 144);
        assert_eq!(frame[3], 186);
        assert_eq!(frame[4], 0x9E);
        assert_eq!(frame[5], 0);

        // Tail frame index equals frame count
        let tail = frames[1];
        assert_eq!(tail[0], 1);
    }

    #[test]
    fn extension_frame_emitted_for_limiter() {
        let mut profile = single_pressure_frame();
        profile.steps[0].max_flow_or_pressure = 8.5;
        let frames = profile.frame_bytes();
        assert_eq!(frames.len(), 3);

        let ext = frames[1];
        assert_eq!(ext[0], 0x20);
        assert_eq!(ext[1], fixed::encode_u8p4(8.5));
        assert_eq!(ext[2], fixed::encode_u8p4(0.6));
        assert_eq!(&ext[3..], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn exit_condition_flags() {
        let frame = ProfileFrame {
            exit_if: true,
            exit_type: "flow_over".to_string(),
            exit_flow_over: 2.5,
            ..ProfileFrame::default()
        };
        let flags = frame.compute_flags();
        assert!(flags.contains(FrameFlags::DO_COMPARE));
        assert!(flags.contains(FrameFlags::DC_GT));
        assert!(flags.contains(FrameFlags::DC_COMP_F));
        assert!((frame.trigger_val() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn flow_mode_uses_flow_set_val() {
        let frame = ProfileFrame {
            pump: "flow".to_string(),
            flow: 2.2,
            pressure: 9.0,
            ..ProfileFrame::default()
        };
        assert!((frame.set_val() - 2.2).abs() < f64::EPSILON);
        assert!(frame.compute_flags().contains(FrameFlags::CTRL_F));
    }

    #[test]
    fn json_tolerates_unknown_keys() {
        let parsed =
            Profile::from_json(r#"{"title":"Test","unknown_key":42,"steps":[{"pressure":6.0}]}"#)
                .expect("parse");
        assert_eq!(parsed.title, "Test");
        assert_eq!(parsed.steps.len(), 1);
        assert!((parsed.steps[0].pressure - 6.0).abs() < f64::EPSILON);
    }
}
