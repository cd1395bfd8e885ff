// src/core/telemetry/sink.rs

//! Destinations for delivered log lines.

use crate::config::{LogConfig, LogSinkKind};
use crate::core::DaemonError;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};

/// A line-oriented log destination. Only the drain worker writes to it.
pub trait LogSink: Send {
    fn write_line(&mut self, line: &str) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Writes lines to the process's standard error.
#[derive(Debug, Default)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut stderr = io::stderr().lock();
        stderr.write_all(line.as_bytes())?;
        stderr.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// Appends lines to a file.
#[derive(Debug)]
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn open(path: &str) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl LogSink for FileSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Builds the sink named by the configuration.
pub fn sink_from_config(config: &LogConfig) -> Result<Box<dyn LogSink>, DaemonError> {
    match config.sink {
        LogSinkKind::Stderr => Ok(Box::new(StderrSink)),
        LogSinkKind::File => {
            let path = config.file_path.as_deref().ok_or_else(|| {
                DaemonError::Config("log.file_path is required for the file sink".into())
            })?;
            Ok(Box::new(FileSink::open(path)?))
        }
    }
}
