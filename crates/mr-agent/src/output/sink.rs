//! Sinks: the downstream destinations a running output writes batches to.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use mr_common::{Metric, OutputConfig};
use thiserror::Error;

/// Errors reported by a sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Connecting failed. `retry` marks transient failures; `partial` means
    /// the sink can already accept writes while it keeps reconnecting.
    #[error("startup error: {reason}")]
    Startup {
        reason: String,
        retry: bool,
        partial: bool,
    },

    #[error("not connected")]
    NotConnected,

    #[error("size limit reached")]
    SizeLimitReached,

    #[error("write failed: {0}")]
    Write(String),

    /// Some positions of the batch were resolved. Positions in neither list
    /// stay buffered for a later attempt.
    #[error("partial write: {source}")]
    Partial {
        accepted: Vec<usize>,
        rejected: Vec<usize>,
        source: Box<SinkError>,
    },

    #[error("unsupported output: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] mr_common::Error),
}

impl SinkError {
    /// Partial failure with an underlying cause.
    pub fn partial(accepted: Vec<usize>, rejected: Vec<usize>, source: SinkError) -> Self {
        SinkError::Partial {
            accepted,
            rejected,
            source: Box::new(source),
        }
    }

    /// The error itself, or the cause of a partial write.
    pub fn root(&self) -> &SinkError {
        match self {
            SinkError::Partial { source, .. } => source.root(),
            other => other,
        }
    }
}

/// A destination for metric batches.
///
/// `write` must return `Ok` only if every metric in the batch was delivered.
pub trait Sink: Send {
    fn name(&self) -> &str;

    fn connect(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn write(&mut self, metrics: &[Metric]) -> Result<(), SinkError>;

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes one line per metric to any `Write` implementation.
pub struct WriterSink<W: Write + Send> {
    name: String,
    writer: W,
}

impl WriterSink<io::Stdout> {
    pub fn stdout() -> Self {
        WriterSink {
            name: "stdout".to_string(),
            writer: io::stdout(),
        }
    }
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(name: impl Into<String>, writer: W) -> Self {
        WriterSink {
            name: name.into(),
            writer,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Sink for WriterSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, metrics: &[Metric]) -> Result<(), SinkError> {
        for metric in metrics {
            writeln!(self.writer, "{}", metric)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Appends metrics as JSON lines to a file.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSink {
            path: path.into(),
            writer: None,
        }
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn connect(&mut self) -> Result<(), SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SinkError::Startup {
                reason: format!("cannot open {}: {}", self.path.display(), e),
                retry: e.kind() != io::ErrorKind::PermissionDenied,
                partial: false,
            })?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn write(&mut self, metrics: &[Metric]) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::NotConnected)?;
        for metric in metrics {
            writer.write_all(&metric.to_bytes()?)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Accepts and forgets every metric.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl Sink for DiscardSink {
    fn name(&self) -> &str {
        "discard"
    }

    fn write(&mut self, _metrics: &[Metric]) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Build the sink named by an output's configuration.
pub fn build_sink(config: &OutputConfig) -> Result<Box<dyn Sink>, SinkError> {
    match config.name.as_str() {
        "stdout" => Ok(Box::new(WriterSink::stdout())),
        "discard" => Ok(Box::new(DiscardSink)),
        "file" => {
            let path = config.path.clone().ok_or_else(|| {
                SinkError::Unsupported(format!("{} requires a path", config.log_name()))
            })?;
            Ok(Box::new(FileSink::new(path)))
        }
        other => Err(SinkError::Unsupported(other.to_string())),
    }
}
