//! Common test utilities and shared fixtures

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use resistes_lib::config::{frequency_code, frequency_from_code, voltage_code, voltage_from_code};
#[allow(unused_imports)]
pub use resistes_lib::error::ResistEsError;
#[allow(unused_imports)]
pub use resistes_lib::frame::{encode_i28, encode_u14, required_frame_len, validate_frame};
#[allow(unused_imports)]
pub use resistes_lib::measure::{battery_v, current_ma, field_names, format_row, potential_mv};
#[allow(unused_imports)]
pub use resistes_lib::{
    AckStatus, ConfigFrame, InjectionConfig, MeasurementSink, RawMeasurement, RealMeasurement,
    verify_ack,
};

/// Log to stderr when RUST_LOG asks for it, e.g. under --nocapture.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Configuration matching the instrument's power-on defaults.
#[allow(dead_code)]
pub fn default_config() -> InjectionConfig {
    InjectionConfig {
        voltage: 16.55,
        frequency: 976.5625,
        impulse_count: 1,
        channel_count: 1,
        integration_count: 1,
    }
}

/// Expected wire bytes for [`default_config`].
#[allow(dead_code)]
pub const DEFAULT_CONFIG_HEX: &str = "ff030000200001010100";

/// Build a well-formed measurement frame from field values.
#[allow(dead_code)]
pub fn build_frame(
    count: u16,
    rec_battery: u16,
    em_battery: u16,
    phase_current: i32,
    quad_current: i32,
    channels: &[(i32, i32)],
) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&encode_u14(count));
    frame.extend_from_slice(&encode_u14(rec_battery));
    frame.extend_from_slice(&encode_u14(em_battery));
    frame.extend_from_slice(&encode_i28(phase_current));
    frame.extend_from_slice(&encode_i28(quad_current));
    for &(phase, quad) in channels {
        frame.extend_from_slice(&encode_i28(phase));
        frame.extend_from_slice(&encode_i28(quad));
    }
    frame
}

/// Sink that records everything written to it.
#[allow(dead_code)]
#[derive(Default)]
pub struct VecSink {
    pub headers: Vec<Vec<String>>,
    pub rows: Vec<Vec<String>>,
}

impl MeasurementSink for VecSink {
    fn write_header(&mut self, fields: &[String]) -> Result<(), ResistEsError> {
        self.headers.push(fields.to_vec());
        Ok(())
    }

    fn write_row(&mut self, values: &[String]) -> Result<(), ResistEsError> {
        self.rows.push(values.to_vec());
        Ok(())
    }
}
