//! Transports carrying framed messages between host and client.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐      stdin/stdout pipes       ┌──────────────────────┐
//! │   Host          │  ◄──────────────────────────► │ meshbridge-client    │
//! │   (Connection)  │    JSON + Content-Length      │ (dispatch + engine)  │
//! └─────────────────┘                               └──────────────────────┘
//! ```
//!
//! The pipes can be a local child process, an `ssh` session running the
//! client on another machine, or a worker thread in the host's own process.
//! Every transport carries exactly one request at a time.

mod channel;
mod in_process;
mod process;

pub use channel::FramedChannel;
pub use in_process::InProcessTransport;
pub use process::ProcessTransport;

use crate::error::Result;
use crate::protocol::{Request, Response};

/// A bidirectional channel from the host to a serving client.
pub trait Transport: Send {
    /// Send one request frame.
    fn send(&mut self, request: &Request) -> Result<()>;

    /// Block until the next response frame arrives.
    fn receive(&mut self) -> Result<Response>;

    /// Run once after the transport is built and before the handshake.
    fn bootstrap(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether a log file created by the host is visible to the client.
    fn supports_log_bridge(&self) -> bool;

    /// Close the channel and reap whatever serves the other end.
    fn shutdown(&mut self) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, request: &Request) -> Result<()> {
        (**self).send(request)
    }

    fn receive(&mut self) -> Result<Response> {
        (**self).receive()
    }

    fn bootstrap(&mut self) -> Result<()> {
        (**self).bootstrap()
    }

    fn supports_log_bridge(&self) -> bool {
        (**self).supports_log_bridge()
    }

    fn shutdown(&mut self) -> Result<()> {
        (**self).shutdown()
    }
}
