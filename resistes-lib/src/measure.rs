//! Conversion of raw measurement codes into physical values.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::constants::{
    BATTERY_CODE_FULL_SCALE, BATTERY_SCALE_V, CODE_FULL_SCALE, CURRENT_SCALE_MA, CURRENT_SENSE_OHM,
    POTENTIAL_SCALE_MV,
};
use crate::frame::RawMeasurement;

/// Convert a potential code to millivolts.
pub fn potential_mv(code: i32) -> f64 {
    f64::from(code) * POTENTIAL_SCALE_MV / CODE_FULL_SCALE
}

/// Convert an injection current code to milliamps.
pub fn current_ma(code: i32) -> f64 {
    f64::from(code) * CURRENT_SCALE_MA / (CURRENT_SENSE_OHM * CODE_FULL_SCALE)
}

/// Convert a battery code to volts. Full scale reads 18.3 V.
pub fn battery_v(code: u16) -> f64 {
    f64::from(code) * BATTERY_SCALE_V / BATTERY_CODE_FULL_SCALE
}

/// Scalar magnitude of a phase/quadrature pair.
pub fn magnitude(phase: f64, quad: f64) -> f64 {
    (phase * phase + quad * quad).sqrt()
}

/// Apparent resistivity pair for one channel (Ohm.m).
///
/// The ratio is undefined when both current components are zero; both values
/// come back as NaN in that case.
pub fn resistivity_pair(
    phase_potential_mv: f64,
    quad_potential_mv: f64,
    phase_current_ma: f64,
    quad_current_ma: f64,
) -> (f64, f64) {
    let denom = phase_current_ma * phase_current_ma + quad_current_ma * quad_current_ma;
    if denom == 0.0 {
        return (f64::NAN, f64::NAN);
    }
    let phase =
        1000.0 * (phase_potential_mv * phase_current_ma + quad_potential_mv * quad_current_ma)
            / denom;
    let quad =
        1000.0 * (quad_potential_mv * phase_current_ma - phase_potential_mv * quad_current_ma)
            / denom;
    (phase, quad)
}

/// One channel of a converted measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelReal {
    pub phase_potential_mv: f64,
    pub quad_potential_mv: f64,
    pub phase_resistivity_ohm_m: f64,
    pub quad_resistivity_ohm_m: f64,
}

/// Measurement frame converted to physical values.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RealMeasurement {
    pub count: u16,
    pub rec_battery_v: f64,
    pub em_battery_v: f64,
    pub phase_current_ma: f64,
    pub quad_current_ma: f64,
    pub channels: Vec<ChannelReal>,
}

impl From<&RawMeasurement> for RealMeasurement {
    fn from(raw: &RawMeasurement) -> Self {
        let phase_current_ma = current_ma(raw.phase_current_code);
        let quad_current_ma = current_ma(raw.quad_current_code);
        let channels = raw
            .channels
            .iter()
            .map(|ch| {
                let phase_potential_mv = potential_mv(ch.phase_potential_code);
                let quad_potential_mv = potential_mv(ch.quad_potential_code);
                let (phase_resistivity_ohm_m, quad_resistivity_ohm_m) = resistivity_pair(
                    phase_potential_mv,
                    quad_potential_mv,
                    phase_current_ma,
                    quad_current_ma,
                );
                ChannelReal {
                    phase_potential_mv,
                    quad_potential_mv,
                    phase_resistivity_ohm_m,
                    quad_resistivity_ohm_m,
                }
            })
            .collect();
        RealMeasurement {
            count: raw.count,
            rec_battery_v: battery_v(raw.rec_battery_code),
            em_battery_v: battery_v(raw.em_battery_code),
            phase_current_ma,
            quad_current_ma,
            channels,
        }
    }
}

impl RealMeasurement {
    /// Magnitude of the injection current (mA).
    pub fn current_magnitude_ma(&self) -> f64 {
        magnitude(self.phase_current_ma, self.quad_current_ma)
    }

    /// Magnitude of one channel's potential (mV).
    pub fn potential_magnitude_mv(&self, channel: usize) -> Option<f64> {
        let ch = self.channels.get(channel)?;
        Some(magnitude(ch.phase_potential_mv, ch.quad_potential_mv))
    }
}

impl fmt::Display for RealMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{}: rec {:.1} V, em {:.1} V, I ({:.3}, {:.3}) mA, {} channel(s)",
            self.count,
            self.rec_battery_v,
            self.em_battery_v,
            self.phase_current_ma,
            self.quad_current_ma,
            self.channels.len()
        )
    }
}

/// Column names for an acquisition, expanded for the channel count.
pub fn field_names(channel_count: u8, timestamps: bool) -> Vec<String> {
    let mut fields = Vec::new();
    if timestamps {
        fields.push("date".to_string());
    }
    for common in [
        "count",
        "rec. batt. voltage(V)",
        "em. batt. voltage(V)",
        "phase current(mA)",
        "quad. current(mA)",
    ] {
        fields.push(common.to_string());
    }
    for ch in 0..channel_count {
        fields.push(format!("phase potential(mV) (ch{ch})"));
        fields.push(format!("quad. potential(mV) (ch{ch})"));
        fields.push(format!("phase resistivity(Ohm.m) (ch{ch})"));
        fields.push(format!("quad. resistivity(Ohm.m) (ch{ch})"));
    }
    fields
}

/// Render one measurement as column values matching [`field_names`].
pub fn format_row(measure: &RealMeasurement, timestamp: Option<DateTime<Utc>>) -> Vec<String> {
    let mut row = Vec::new();
    if let Some(ts) = timestamp {
        row.push(ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string());
    }
    row.push(format!("{}", measure.count));
    row.push(format!("{:.1}", measure.rec_battery_v));
    row.push(format!("{:.1}", measure.em_battery_v));
    row.push(format!("{:.6}", measure.phase_current_ma));
    row.push(format!("{:.6}", measure.quad_current_ma));
    for ch in &measure.channels {
        row.push(format!("{:.6}", ch.phase_potential_mv));
        row.push(format!("{:.6}", ch.quad_potential_mv));
        row.push(format!("{:.6}", ch.phase_resistivity_ohm_m));
        row.push(format!("{:.6}", ch.quad_resistivity_ohm_m));
    }
    row
}
