//! The host half of the bridge.
//!
//! - `connection` - session lifecycle and the request/response round trip
//! - `proxy` - reference-counted stand-ins for remote engine objects
//! - `value` - host-side values and handle decoding
//! - `log_bridge` - forwards the engine's diagnostic log to the host

mod connection;
mod log_bridge;
mod proxy;
mod value;

pub use connection::Connection;
pub use log_bridge::LogBridge;
pub use proxy::{Attribute, BoundMethod, Proxy};
pub use value::Value;
