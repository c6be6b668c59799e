use std::io;
use thiserror::Error;

/// The primary error type for the `resistes-rs` library.
#[derive(Error, Debug)]
pub enum ResistEsError {
    #[error("Invalid configuration parameter: {reason}")]
    ConfigParam { reason: String },

    #[error("Acknowledgement mismatch: sent {sent}, received {received}")]
    AckMismatch { sent: String, received: String },

    #[error("Reception buffer still draining after {0:?}")]
    FlushTimeout(std::time::Duration),

    #[error("No configuration has been acknowledged yet")]
    NotConfigured,

    #[error("Invalid measurement frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("Link is not connected")]
    NotConnected,

    #[error("Link closed by peer")]
    LinkClosed,

    #[error("Link error: {0}")]
    Link(String),

    #[error("Invalid link url `{url}`: {reason}")]
    LinkUrl { url: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Sink error: {0}")]
    Sink(String),
}

impl From<csv::Error> for ResistEsError {
    fn from(e: csv::Error) -> Self {
        ResistEsError::Sink(e.to_string())
    }
}

impl From<tokio_serial::Error> for ResistEsError {
    fn from(e: tokio_serial::Error) -> Self {
        ResistEsError::Link(e.to_string())
    }
}
