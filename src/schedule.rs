//! Weekly on-device schedules
//!
//! A schedule has one value per quarter hour for a week, 672 in total:
//! `-1` keeps the relay on, `0` switches it off and a positive value is a
//! standby-killer threshold in watts. Devices store thresholds as raw pulse
//! counts, so the encoded form depends on the Circle's calibration.
//!
//! The encoded form and its checksum are only ever rebuilt together, by
//! [`Schedule::define`] and [`Schedule::dst_shift`].

use log::info;

use crate::codec::checksum;
use crate::error::{PlugwiseError, PlugwiseResult};
use crate::power::Calibration;

/// Quarter hours in a week
pub const SCHEDULE_SLOTS: usize = 7 * 96;

/// Values per staged group
pub const CHUNK_VALUES: usize = 8;

/// Groups staged in the Stick per upload
pub const STAGED_CHUNKS: usize = SCHEDULE_SLOTS / CHUNK_VALUES;

/// Commit requests per upload; each commits two staged groups
pub const COMMIT_CHUNKS: u8 = 42;

/// Checksum of a schedule that keeps the relay on all week
pub const ALWAYS_ON_CRC: u16 = 17786;

/// Slots shifted by a daylight-saving change (one hour)
const DST_SLOTS: usize = 4;

/// A named schedule bound to one Circle's calibration
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    name: String,
    watts: Vec<i32>,
    pulses: Vec<i16>,
    crc: u16,
    dst: bool,
}

impl Schedule {
    /// Encode a 672-value watt schedule and rotate it for `dst`
    pub fn define(
        name: &str,
        watts: &[i32],
        calibration: &Calibration,
        dst: bool,
    ) -> PlugwiseResult<Self> {
        if watts.len() != SCHEDULE_SLOTS {
            return Err(PlugwiseError::value(format!(
                "schedule '{}' has {} values, expected {}",
                name,
                watts.len(),
                SCHEDULE_SLOTS
            )));
        }
        let pulses = encode_watts(watts, calibration)?;
        let mut schedule = Self {
            name: name.to_string(),
            watts: watts.to_vec(),
            crc: schedule_checksum(&pulses),
            pulses,
            dst: false,
        };
        schedule.dst_shift(dst);
        Ok(schedule)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source values as defined, never rotated
    pub fn watts(&self) -> &[i32] {
        &self.watts
    }

    /// Device encoding with the current daylight-saving rotation applied
    pub fn pulses(&self) -> &[i16] {
        &self.pulses
    }

    pub fn crc(&self) -> u16 {
        self.crc
    }

    pub fn dst(&self) -> bool {
        self.dst
    }

    /// Rotate the encoded schedule to match a daylight-saving flag
    ///
    /// Entering DST rotates left by one hour, leaving it rotates right.
    pub fn dst_shift(&mut self, dst: bool) {
        match (self.dst, dst) {
            (false, true) => {
                info!("schedule '{}': rotate left, start of DST", self.name);
                self.pulses.rotate_left(DST_SLOTS);
            }
            (true, false) => {
                info!("schedule '{}': rotate right, end of DST", self.name);
                self.pulses.rotate_right(DST_SLOTS);
            }
            _ => return,
        }
        self.crc = schedule_checksum(&self.pulses);
        self.dst = dst;
    }

    /// The encoded schedule split into staging groups
    pub fn chunks(&self) -> impl Iterator<Item = (u8, [i16; CHUNK_VALUES])> + '_ {
        self.pulses.chunks_exact(CHUNK_VALUES).enumerate().map(|(idx, chunk)| {
            let mut values = [0i16; CHUNK_VALUES];
            values.copy_from_slice(chunk);
            (idx as u8, values)
        })
    }
}

/// Convert one watt value to its on-device encoding
///
/// Positive thresholds never encode below one pulse, so they cannot turn
/// into "off".
pub fn encode_watt(watt: i32, calibration: &Calibration) -> PlugwiseResult<i16> {
    if watt <= 0 {
        return Ok(watt.max(i16::MIN as i32) as i16);
    }
    let pulses = calibration.watt_to_pulses(watt as f64, 1.0)?.trunc();
    Ok(pulses.clamp(1.0, i16::MAX as f64) as i16)
}

/// Convert a full watt schedule to its on-device encoding
pub fn encode_watts(watts: &[i32], calibration: &Calibration) -> PlugwiseResult<Vec<i16>> {
    watts.iter().map(|w| encode_watt(*w, calibration)).collect()
}

/// CRC over the encoded values as big-endian 16-bit words
pub fn schedule_checksum(pulses: &[i16]) -> u16 {
    let bytes: Vec<u8> = pulses.iter().flat_map(|p| p.to_be_bytes()).collect();
    checksum(&bytes)
}
