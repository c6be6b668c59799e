pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod frame;
pub mod link;
pub mod measure;
pub mod sink;

// Re-export the session types and protocol entry points for easy access
pub use config::{AckStatus, ConfigFrame, InjectionConfig, verify_ack};
pub use device::{AcquireOptions, AcquireSignal, AcquireStats, ResistEs, SessionOptions};
pub use error::ResistEsError;
pub use frame::RawMeasurement;
pub use link::{Link, LinkUrl, SerialLink, SerialMode, TcpLink, link_from_url};
pub use measure::RealMeasurement;
pub use sink::{CsvSink, MeasurementSink};
