//! Measurement frame codec.
//!
//! Every field travels as 7 data bits per byte, low byte first. Bit 7 is a
//! boundary tag: set on the byte carrying a field's lowest 7 bits, clear on
//! the rest of the field. Tags confirm alignment of a candidate frame; a
//! malformed candidate is rejected as a whole, never realigned.

use crate::constants::{CHANNEL_BLOCK_LEN, MEASURE_FRAME_MIN_LEN};
use crate::error::ResistEsError;

/// Accumulate 7-bit groups, low byte first, ignoring tag bits.
fn decode_group(bytes: &[u8]) -> u32 {
    debug_assert!(bytes.len() <= 4);
    bytes
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, b)| acc | (u32::from(b & 0x7F) << (7 * i)))
}

/// Decode an unsigned 14-bit field (2 bytes).
pub fn decode_u14(bytes: &[u8]) -> u16 {
    decode_group(&bytes[..2]) as u16
}

/// Decode a signed 28-bit field (4 bytes, two's complement).
pub fn decode_i28(bytes: &[u8]) -> i32 {
    let raw = i64::from(decode_group(&bytes[..4]));
    if raw >= 1 << 27 {
        (raw - (1 << 28)) as i32
    } else {
        raw as i32
    }
}

/// Encode an unsigned 14-bit field with measurement tag bits.
pub fn encode_u14(value: u16) -> [u8; 2] {
    [0x80 | (value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8]
}

/// Encode a signed 28-bit field with measurement tag bits.
pub fn encode_i28(value: i32) -> [u8; 4] {
    let raw = (i64::from(value) & 0x0FFF_FFFF) as u32;
    [
        0x80 | (raw & 0x7F) as u8,
        ((raw >> 7) & 0x7F) as u8,
        ((raw >> 14) & 0x7F) as u8,
        ((raw >> 21) & 0x7F) as u8,
    ]
}

/// Wire length of a measurement frame for the given channel count.
pub fn required_frame_len(channel_count: u8) -> usize {
    MEASURE_FRAME_MIN_LEN + usize::from(channel_count) * CHANNEL_BLOCK_LEN
}

/// Field spans of the fixed frame head: measure count, two battery codes,
/// phase and quadrature injection current.
const HEAD_FIELDS: [(usize, usize); 5] = [(0, 2), (2, 2), (4, 2), (6, 4), (10, 4)];

fn check_field_tags(frame: &[u8], offset: usize, len: usize) -> Result<(), ResistEsError> {
    let field = &frame[offset..offset + len];
    if field[0] & 0x80 == 0 {
        return Err(ResistEsError::InvalidFrame {
            reason: format!("tag bit missing at offset {offset}"),
        });
    }
    for (i, b) in field.iter().enumerate().skip(1) {
        if b & 0x80 != 0 {
            return Err(ResistEsError::InvalidFrame {
                reason: format!("unexpected tag bit at offset {}", offset + i),
            });
        }
    }
    Ok(())
}

/// Check a candidate frame: exact length for the channel count, then the tag
/// bit of every field byte. Length failures are reported before tag failures.
pub fn validate_frame(frame: &[u8], channel_count: u8) -> Result<(), ResistEsError> {
    let required = required_frame_len(channel_count);
    if frame.len() != required {
        return Err(ResistEsError::InvalidFrame {
            reason: format!(
                "length {} does not match {} required for {} channels",
                frame.len(),
                required,
                channel_count
            ),
        });
    }
    for (offset, len) in HEAD_FIELDS {
        check_field_tags(frame, offset, len)?;
    }
    for channel in 0..usize::from(channel_count) {
        let base = MEASURE_FRAME_MIN_LEN + channel * CHANNEL_BLOCK_LEN;
        check_field_tags(frame, base, 4)?;
        check_field_tags(frame, base + 4, 4)?;
    }
    Ok(())
}

/// One channel's potential codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawChannel {
    pub phase_potential_code: i32,
    pub quad_potential_code: i32,
}

/// Integer fields of one measurement frame, before unit conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawMeasurement {
    /// Rolling measurement counter (14 bits)
    pub count: u16,
    /// Receiver battery code (14 bits)
    pub rec_battery_code: u16,
    /// Emitter battery code (14 bits)
    pub em_battery_code: u16,
    /// In-phase injection current code (28 bits, signed)
    pub phase_current_code: i32,
    /// Quadrature injection current code (28 bits, signed)
    pub quad_current_code: i32,
    pub channels: Vec<RawChannel>,
}

impl RawMeasurement {
    /// Validate and extract a frame for the given channel count.
    pub fn parse(frame: &[u8], channel_count: u8) -> Result<Self, ResistEsError> {
        validate_frame(frame, channel_count)?;
        let channels = (0..usize::from(channel_count))
            .map(|channel| {
                let base = MEASURE_FRAME_MIN_LEN + channel * CHANNEL_BLOCK_LEN;
                RawChannel {
                    phase_potential_code: decode_i28(&frame[base..base + 4]),
                    quad_potential_code: decode_i28(&frame[base + 4..base + 8]),
                }
            })
            .collect();
        Ok(RawMeasurement {
            count: decode_u14(&frame[0..2]),
            rec_battery_code: decode_u14(&frame[2..4]),
            em_battery_code: decode_u14(&frame[4..6]),
            phase_current_code: decode_i28(&frame[6..10]),
            quad_current_code: decode_i28(&frame[10..14]),
            channels,
        })
    }
}
