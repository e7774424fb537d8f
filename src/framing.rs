//! Content-Length message framing for the bridge channel.
//!
//! This module implements HTTP-style Content-Length framing, the same protocol
//! used by the Language Server Protocol (LSP). It gives reliable message
//! boundaries over stream-oriented pipes (child stdin/stdout, ssh tunnels).
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! The header parsing is case-insensitive and handles both CRLF and LF line endings.
//! All I/O is blocking: the bridge keeps exactly one message in flight.

use std::io::{BufRead, Write};

use thiserror::Error;

/// Maximum message size (100MB) to prevent OOM from a malicious/buggy peer.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Framing-level failures.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream before a header arrived.
    #[error("Connection closed by peer")]
    Closed,

    #[error("Missing Content-Length header")]
    MissingContentLength,

    #[error("Invalid Content-Length value: {0}")]
    InvalidContentLength(String),

    #[error("Message size {size} exceeds maximum {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message body is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Read a Content-Length framed message from the stream.
///
/// # Protocol
///
/// 1. Read headers until an empty line (handles both CRLF and LF)
/// 2. Extract Content-Length header (case-insensitive)
/// 3. Read exactly that many bytes for the body
///
/// # Errors
///
/// - `FrameError::Closed` if the stream ends before any header byte
/// - `FrameError::MissingContentLength` if the header block has no length
/// - `FrameError::TooLarge` if the length exceeds `MAX_MESSAGE_SIZE`
/// - `FrameError::Io` if the body cannot be read completely
/// - `FrameError::Utf8` if the body is not valid UTF-8
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<String, FrameError> {
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line)?;

        if bytes_read == 0 {
            if saw_header {
                return Err(FrameError::MissingContentLength);
            }
            return Err(FrameError::Closed);
        }

        let trimmed = line.trim();

        // Empty line signals end of headers
        if trimmed.is_empty() {
            break;
        }
        saw_header = true;

        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(
                    value
                        .parse()
                        .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?,
                );
            }
            // Ignore other headers (e.g., Content-Type)
        }
    }

    let size = content_length.ok_or(FrameError::MissingContentLength)?;

    if size > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body)?;

    Ok(String::from_utf8(body)?)
}

/// Write a Content-Length framed message to the stream and flush it.
///
/// The header and body go out in a single `write_all` so a half-written
/// frame is never observed by a reader that only sees whole writes.
pub fn write_message<W: Write>(writer: &mut W, body: &str) -> Result<(), FrameError> {
    let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
    writer.write_all(frame.as_bytes())?;
    writer.flush()?;
    Ok(())
}
