// Protocol constants for the ResistES resistivimeter

use std::time::Duration;

/// Size of a configuration frame (10 bytes)
pub const CONFIG_FRAME_LEN: usize = 10;

/// Size of a configuration acknowledgement (config echo + status byte)
pub const ACK_FRAME_LEN: usize = CONFIG_FRAME_LEN + 1;

/// Size of a measurement frame with zero channels (14 bytes)
pub const MEASURE_FRAME_MIN_LEN: usize = 14;

/// Bytes added to a measurement frame per configured channel
pub const CHANNEL_BLOCK_LEN: usize = 8;

/// One-byte command requesting an immediate measurement
pub const REQUEST_MEASURE_CMD: u8 = 0x80;

/// Lowest accepted injection voltage (V)
pub const INJECTION_VOLTAGE_MIN: f64 = 16.55;

/// Highest accepted injection voltage (V)
pub const INJECTION_VOLTAGE_MAX: f64 = 196.51;

/// Lowest accepted injection frequency (kHz)
pub const INJECTION_FREQUENCY_MIN: f64 = 0.0;

/// Highest accepted injection frequency (kHz)
pub const INJECTION_FREQUENCY_MAX: f64 = 62499.0;

/// Largest voltage code representable in the configuration frame
pub const VOLTAGE_CODE_MAX: u32 = 255;

/// Largest frequency code representable in the configuration frame (25 bits)
pub const FREQUENCY_CODE_MAX: u32 = 33_554_431;

/// Reference divisor of the frequency synthesizer
pub const FREQUENCY_SCALE_DIVISOR: f64 = 500_000.0;

/// Largest accepted impulse count (7 bits on the wire)
pub const IMPULSE_COUNT_MAX: u8 = 127;

/// Largest accepted reception channel count (7 bits on the wire)
pub const CHANNEL_COUNT_MAX: u8 = 127;

/// Largest accepted integration count (14 bits on the wire)
pub const INTEGRATION_COUNT_MAX: u16 = 16_383;

/// Full scale of a signed 28-bit measurement code
pub const CODE_FULL_SCALE: f64 = (1u32 << 28) as f64;

/// Millivolts at full scale for potential channels
pub const POTENTIAL_SCALE_MV: f64 = 5_000.0;

/// Scale numerator converting injection current codes to mA
pub const CURRENT_SCALE_MA: f64 = 5_000_000.0;

/// Current sense resistance scaling raw injection current codes (Ohm)
pub const CURRENT_SENSE_OHM: f64 = 110.0;

/// Volts reported when a battery code reads full scale
pub const BATTERY_SCALE_V: f64 = 18.3;

/// Full scale of an unsigned 14-bit battery code
pub const BATTERY_CODE_FULL_SCALE: f64 = 16_383.0;

/// Floor for the reception buffer cap, in bytes
pub const RX_BUFFER_FLOOR: usize = 1_000;

/// Attempts made when sending a frame before giving up
pub const SEND_RETRY_ATTEMPTS: u32 = 3;

/// Delay between send attempts
pub const SEND_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Settle time between sending a configuration and reading its acknowledgement
pub const CONFIG_SETTLE: Duration = Duration::from_secs(1);

/// Poll interval used while draining or waiting for measurement bytes
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Default bound on draining stale bytes before a configuration
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for link reads
pub const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_secs(10);
