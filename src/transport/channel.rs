//! JSON messages over a Content-Length framed byte stream.

use std::io::{BufRead, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::framing::{read_message, write_message};
use crate::protocol::{Request, Response};

use super::Transport;

/// Framed JSON channel over any reader/writer pair.
///
/// The client binary runs one over stdin/stdout; the process and in-process
/// transports wrap one around their pipes.
pub struct FramedChannel<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> FramedChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Serialize `message` and write it as one frame.
    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let body = serde_json::to_string(message)?;
        tracing::trace!(len = body.len(), "-> {}", body);
        write_message(&mut self.writer, &body)?;
        Ok(())
    }

    /// Read the next frame without decoding it.
    pub fn receive_text(&mut self) -> Result<String> {
        let body = read_message(&mut self.reader)?;
        tracing::trace!(len = body.len(), "<- {}", body);
        Ok(body)
    }

    /// Read the next frame and decode it as `T`.
    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<T> {
        let body = self.receive_text()?;
        Ok(serde_json::from_str(&body)?)
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl<R, W> Transport for FramedChannel<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn send(&mut self, request: &Request) -> Result<()> {
        FramedChannel::send(self, request)
    }

    fn receive(&mut self) -> Result<Response> {
        FramedChannel::receive(self)
    }

    fn supports_log_bridge(&self) -> bool {
        false
    }

    fn shutdown(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
