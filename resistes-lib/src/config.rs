//! Configuration frames and their acknowledgements.
//!
//! A configuration travels as a fixed 10-byte command. Unlike measurement
//! traffic it uses byte 0 as a start marker (bit 0 set, bit 7 set), with the
//! voltage code folded around it. The device answers by echoing the command
//! followed by a status byte.

use std::fmt;

use modular_bitfield::prelude::*;

use crate::constants::{
    ACK_FRAME_LEN, CHANNEL_COUNT_MAX, CODE_FULL_SCALE, CONFIG_FRAME_LEN, FREQUENCY_CODE_MAX,
    FREQUENCY_SCALE_DIVISOR, IMPULSE_COUNT_MAX, INJECTION_FREQUENCY_MAX, INJECTION_FREQUENCY_MIN,
    INJECTION_VOLTAGE_MAX, INJECTION_VOLTAGE_MIN, INTEGRATION_COUNT_MAX, VOLTAGE_CODE_MAX,
};
use crate::error::ResistEsError;

/// Injection parameters for one acquisition session.
///
/// A session keeps the last acknowledged value and reads the channel count
/// from it when sizing measurement frames.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InjectionConfig {
    /// Injection voltage (V)
    pub voltage: f64,
    /// Injection frequency (kHz)
    pub frequency: f64,
    /// Impulses per measurement cycle
    pub impulse_count: u8,
    /// Potential channels reported per frame
    pub channel_count: u8,
    /// Integrations averaged per reported measurement
    pub integration_count: u16,
}

fn config_param(reason: String) -> ResistEsError {
    ResistEsError::ConfigParam { reason }
}

/// Quantize an injection voltage to its 8-bit wire code.
pub fn voltage_code(voltage: f64) -> Result<u8, ResistEsError> {
    if !(INJECTION_VOLTAGE_MIN..=INJECTION_VOLTAGE_MAX).contains(&voltage) {
        return Err(config_param(format!(
            "voltage {voltage} V outside [{INJECTION_VOLTAGE_MIN}, {INJECTION_VOLTAGE_MAX}]"
        )));
    }
    let code = (256.0 * ((900.0 / voltage) - 0.08 - 4.5) / 50.0).round();
    if !(0.0..=VOLTAGE_CODE_MAX as f64).contains(&code) {
        return Err(config_param(format!(
            "voltage {voltage} V quantizes to code {code}, outside the 8-bit range"
        )));
    }
    Ok(code as u8)
}

/// Quantize an injection frequency to its 25-bit synthesizer code.
pub fn frequency_code(frequency: f64) -> Result<u32, ResistEsError> {
    if !(INJECTION_FREQUENCY_MIN..=INJECTION_FREQUENCY_MAX).contains(&frequency) {
        return Err(config_param(format!(
            "frequency {frequency} outside [{INJECTION_FREQUENCY_MIN}, {INJECTION_FREQUENCY_MAX}]"
        )));
    }
    let code = (frequency * CODE_FULL_SCALE / FREQUENCY_SCALE_DIVISOR).round();
    if !(0.0..=FREQUENCY_CODE_MAX as f64).contains(&code) {
        return Err(config_param(format!(
            "frequency {frequency} quantizes to code {code}, outside the 25-bit range"
        )));
    }
    Ok(code as u32)
}

/// Injection voltage the device reconstructs from a wire code (V).
pub fn voltage_from_code(code: u8) -> f64 {
    900.0 / ((50.0 * f64::from(code) / 256.0) + 0.08 + 4.5)
}

/// Injection frequency the device reconstructs from a wire code (kHz).
pub fn frequency_from_code(code: u32) -> f64 {
    f64::from(code) * FREQUENCY_SCALE_DIVISOR / CODE_FULL_SCALE
}

/// Encoded 10-byte configuration command, immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigFrame {
    bytes: [u8; CONFIG_FRAME_LEN],
}

impl ConfigFrame {
    /// Validate the parameters and lay out the command bytes.
    pub fn encode(config: &InjectionConfig) -> Result<Self, ResistEsError> {
        let ux = voltage_code(config.voltage)?;
        let fx = frequency_code(config.frequency)?;
        if config.impulse_count > IMPULSE_COUNT_MAX {
            return Err(config_param(format!(
                "impulse count {} above {IMPULSE_COUNT_MAX}",
                config.impulse_count
            )));
        }
        if config.channel_count > CHANNEL_COUNT_MAX {
            return Err(config_param(format!(
                "channel count {} above {CHANNEL_COUNT_MAX}",
                config.channel_count
            )));
        }
        if config.integration_count > INTEGRATION_COUNT_MAX {
            return Err(config_param(format!(
                "integration count {} above {INTEGRATION_COUNT_MAX}",
                config.integration_count
            )));
        }
        let tx = config.integration_count;
        Ok(ConfigFrame {
            bytes: [
                // start marker in bits 0 and 7, voltage bits 0-5 between them
                0x81 | ((ux & 0x3F) << 1),
                (ux & 0xC0) >> 6,
                (fx & 0x7F) as u8,
                ((fx >> 7) & 0x7F) as u8,
                ((fx >> 14) & 0x7F) as u8,
                ((fx >> 21) & 0x7F) as u8,
                config.impulse_count & 0x7F,
                config.channel_count & 0x7F,
                (tx & 0x7F) as u8,
                ((tx >> 7) & 0x7F) as u8,
            ],
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for ConfigFrame {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for ConfigFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.bytes))
    }
}

/// Status byte trailing a configuration acknowledgement.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AckStatus {
    pub run: bool,
    pub board_id: B6,
    #[skip]
    unused: bool,
}

/// Check an acknowledgement against the configuration that was sent.
///
/// The device echoes the 10 command bytes followed by one status byte. Any
/// length or echo difference is a mismatch with no partial result.
pub fn verify_ack(ack: &[u8], sent: &ConfigFrame) -> Result<AckStatus, ResistEsError> {
    if ack.len() != ACK_FRAME_LEN || ack[..CONFIG_FRAME_LEN] != sent.bytes {
        return Err(ResistEsError::AckMismatch {
            sent: sent.to_string(),
            received: hex::encode(ack),
        });
    }
    Ok(AckStatus::from_bytes([ack[CONFIG_FRAME_LEN]]))
}
