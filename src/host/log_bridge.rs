//! Forwarding of the engine's diagnostic log to the host.
//!
//! The engine writes its log into a private temporary file. Around every
//! round trip the host truncates the file, then copies whatever the engine
//! wrote to a sink, so log output lines up with the calls that caused it.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// A temp-file log and the sink its contents are copied to.
pub struct LogBridge {
    file: NamedTempFile,
    sink: Box<dyn Write + Send>,
}

impl LogBridge {
    /// Create a bridge that copies to the host's stderr.
    pub fn new() -> io::Result<Self> {
        Self::with_sink(Box::new(io::stderr()))
    }

    pub fn with_sink(sink: Box<dyn Write + Send>) -> io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("meshbridge-")
            .suffix(".log")
            .tempfile()?;
        tracing::debug!("Bridging engine log through {}", file.path().display());
        Ok(Self { file, sink })
    }

    pub fn set_sink(&mut self, sink: Box<dyn Write + Send>) {
        self.sink = sink;
    }

    /// Path handed to the engine.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn before_call(&mut self) -> io::Result<()> {
        self.file.as_file().set_len(0)
    }

    pub fn after_call(&mut self) -> io::Result<()> {
        let output = fs::read(self.file.path())?;
        if output.is_empty() {
            return Ok(());
        }
        self.sink.write_all(&output)?;
        self.sink.flush()
    }
}
