//! Endpoint identities and the serial letter mapping.
//!
//! Every DE1 feature is addressed by a 128-bit UUID built from the standard
//! Bluetooth base UUID with a 16-bit short code in the `0xA0xx` range. The
//! serial wire replaces the UUID with a single ASCII letter:
//! `letter = 'A' + (short - 0xA001)` for short codes `0xA001..=0xA012`.

use uuid::Uuid;

/// The DE1 primary service short code.
pub const SERVICE_SHORT: u16 = 0xA000;

/// First endpoint short code that maps to a serial letter.
const LETTER_BASE: u16 = 0xA001;
/// Last endpoint short code that maps to a serial letter (`'R'`).
const LETTER_END: u16 = 0xA012;

/// A 128-bit endpoint identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(Uuid);

impl EndpointId {
    /// Build an endpoint from its 16-bit short code on the Bluetooth base
    /// UUID (`0000xxxx-0000-1000-8000-00805F9B34FB`).
    #[must_use]
    pub const fn from_short(short: u16) -> Self {
        Self(Uuid::from_fields(
            short as u32,
            0x0000,
            0x1000,
            &[0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB],
        ))
    }

    /// Wrap a full UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.0
    }

    /// The low 16 bits of the UUID's leading field.
    #[must_use]
    pub fn short(&self) -> u16 {
        (self.0.as_fields().0 & 0xFFFF) as u16
    }

    /// The serial wire letter, if this endpoint has one.
    #[must_use]
    pub fn letter(&self) -> Option<char> {
        let short = self.short();
        if (LETTER_BASE..=LETTER_END).contains(&short) {
            Some((b'A' + (short - LETTER_BASE) as u8) as char)
        } else {
            None
        }
    }

    /// The endpoint for a serial wire letter, if in range `'A'..='R'`.
    #[must_use]
    pub fn from_letter(letter: char) -> Option<Self> {
        let offset = (letter as u32).checked_sub('A' as u32)?;
        let short = LETTER_BASE.checked_add(offset as u16)?;
        if short <= LETTER_END { Some(Self::from_short(short)) } else { None }
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}", self.short())
    }
}

/// The DE1 primary service UUID.
pub const SERVICE: EndpointId = EndpointId::from_short(SERVICE_SHORT);

/// Endpoint catalog used by the device core.
pub mod endpoints {
    use super::EndpointId;

    /// Firmware version read.
    pub const VERSION: EndpointId = EndpointId::from_short(0xA001);
    /// Write to request a machine state.
    pub const REQUESTED_STATE: EndpointId = EndpointId::from_short(0xA002);
    /// Request a memory-mapped register read.
    pub const READ_FROM_MMR: EndpointId = EndpointId::from_short(0xA005);
    /// Profile frame write.
    pub const FRAME_WRITE: EndpointId = EndpointId::from_short(0xA00A);
    /// Profile header write.
    pub const HEADER_WRITE: EndpointId = EndpointId::from_short(0xA00B);
    /// Temperature notification.
    pub const TEMPERATURES: EndpointId = EndpointId::from_short(0xA00C);
    /// State/substate notification.
    pub const STATE_INFO: EndpointId = EndpointId::from_short(0xA00D);
    /// 14-byte shot sample notification.
    pub const SHOT_SAMPLE: EndpointId = EndpointId::from_short(0xA00E);
    /// Shot defaults (steam/hot-water/group settings).
    pub const SHOT_SETTINGS: EndpointId = EndpointId::from_short(0xA00F);
    /// Water level notification.
    pub const WATER_LEVELS: EndpointId = EndpointId::from_short(0xA011);

    /// Endpoints subscribed by `subscribe_all`.
    pub const NOTIFICATION_SET: [EndpointId; 5] =
        [STATE_INFO, SHOT_SAMPLE, WATER_LEVELS, READ_FROM_MMR, TEMPERATURES];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_mapping_follows_formula() {
        assert_eq!(endpoints::VERSION.letter(), Some('A'));
        assert_eq!(endpoints::REQUESTED_STATE.letter(), Some('B'));
        assert_eq!(endpoints::SHOT_SAMPLE.letter(), Some('N'));
        assert_eq!(EndpointId::from_short(0xA012).letter(), Some('R'));
        assert_eq!(SERVICE.letter(), None);
        assert_eq!(EndpointId::from_short(0xA013).letter(), None);
    }

    #[test]
    fn letter_round_trip() {
        for short in 0xA001..=0xA012u16 {
            let endpoint = EndpointId::from_short(short);
            let letter = endpoint.letter().expect("in range");
            assert_eq!(EndpointId::from_letter(letter), Some(endpoint));
        }
        assert_eq!(EndpointId::from_letter('S'), None);
        assert_eq!(EndpointId::from_letter('@'), None);
    }

    #[test]
    fn uuid_uses_bluetooth_base() {
        let uuid = endpoints::SHOT_SAMPLE.uuid().to_string();
        assert_eq!(uuid, "0000a00e-0000-1000-8000-00805f9b34fb");
    }
}
