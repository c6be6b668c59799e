//! Measurement output sinks.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::error::ResistEsError;

/// Receives acquisition output: one header, then one row per measurement.
pub trait MeasurementSink {
    fn write_header(&mut self, fields: &[String]) -> Result<(), ResistEsError>;
    fn write_row(&mut self, values: &[String]) -> Result<(), ResistEsError>;
}

impl<S: MeasurementSink + ?Sized> MeasurementSink for Box<S> {
    fn write_header(&mut self, fields: &[String]) -> Result<(), ResistEsError> {
        (**self).write_header(fields)
    }

    fn write_row(&mut self, values: &[String]) -> Result<(), ResistEsError> {
        (**self).write_row(values)
    }
}

/// CSV sink with a configurable delimiter. Rows are flushed as they are
/// written so a live acquisition file can be tailed.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvSink<File> {
    /// Create or truncate a CSV file at `path`.
    pub fn from_path<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Self, ResistEsError> {
        let writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(path)?;
        Ok(CsvSink { writer })
    }
}

impl CsvSink<io::Stdout> {
    /// Write rows to standard output.
    pub fn stdout(delimiter: u8) -> Self {
        CsvSink::from_writer(io::stdout(), delimiter)
    }
}

impl<W: Write> CsvSink<W> {
    pub fn from_writer(writer: W, delimiter: u8) -> Self {
        CsvSink {
            writer: csv::WriterBuilder::new()
                .delimiter(delimiter)
                .from_writer(writer),
        }
    }

    fn write_record(&mut self, values: &[String]) -> Result<(), ResistEsError> {
        self.writer.write_record(values)?;
        self.writer
            .flush()
            .map_err(|e| ResistEsError::Sink(e.to_string()))
    }
}

impl<W: Write> MeasurementSink for CsvSink<W> {
    fn write_header(&mut self, fields: &[String]) -> Result<(), ResistEsError> {
        self.write_record(fields)
    }

    fn write_row(&mut self, values: &[String]) -> Result<(), ResistEsError> {
        self.write_record(values)
    }
}
