//! meshbridge - remote-object proxy bridge to a geometry engine.
//!
//! A host process drives a geometry/meshing engine that lives in a separate
//! client process. Engine objects never leave the client; the host holds
//! reference-counted proxies and every operation on them is a synchronous
//! request over a framed pipe.
//!
//! - `host` - `Connection`, `Proxy` and `Value`, the API meshing scripts use
//! - `client` - the dispatch loop that owns the engine and its object registry
//! - `engine` - the `Engine` trait plus the sandbox and Python bindings
//! - `transport` - local process, `ssh` and in-process transports
//! - `protocol` / `framing` - the wire messages and their Content-Length framing
//! - `config` - connection configuration and path resolution
//!
//! # Usage
//!
//! ```ignore
//! use meshbridge::{BridgeConfig, Connection, GeometryKind, Value};
//!
//! let conn = Connection::open(&BridgeConfig::from_default_location()?)?;
//! let root = conn.root();
//! let volume = root.invoke("makeBox", vec![1.into(), 1.into(), 1.into()])?;
//! let volume = volume.as_proxy().expect("makeBox returns a volume");
//! assert!(volume.is_instance(GeometryKind::Volume)?);
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod framing;
pub mod host;
pub mod protocol;
pub mod transport;

pub use config::{BridgeConfig, TransportConfig};
pub use error::{BridgeError, ProtocolError, Result};
pub use host::{Attribute, BoundMethod, Connection, Proxy, Value};
pub use protocol::{GeometryKind, Handle, HandleId};
