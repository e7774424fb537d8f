//! The host side of a bridge session.
//!
//! A `Connection` owns the transport, runs the startup handshake and hands
//! out the root proxy. Every proxy created from it shares one session behind
//! a mutex, so at most one request is ever in flight.
//!
//! # Lifecycle
//!
//! - `open()` / `open_with()` - parameters + init handshake
//! - `call()` / `try_call()` - one request, one response
//! - `close()` - terminate the client; also run on drop

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::config::{BridgeConfig, TransportConfig, CLIENT_PROGRAM};
use crate::engine::log_path_from_args;
use crate::error::{BridgeError, ProtocolError, Result};
use crate::protocol::{
    AttributeInfo, BaseValue, GeometryKind, Handle, HandleId, Parameters, Request, Response,
    WireValue,
};
use crate::transport::{ProcessTransport, Transport};

use super::log_bridge::LogBridge;
use super::proxy::{Proxy, ProxyInner};
use super::value::{self, Value};

pub(crate) type SessionRef = Arc<Mutex<Session>>;

/// Lock a session, recovering from a poisoned mutex.
pub(crate) fn lock(session: &SessionRef) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Session {
    transport: Box<dyn Transport>,
    log: Option<LogBridge>,
    alive: bool,
    closed: bool,
    proxies: HashMap<HandleId, Weak<ProxyInner>>,
}

impl Session {
    fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            log: None,
            alive: true,
            closed: false,
            proxies: HashMap::new(),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive
    }

    /// Send one request and wait for its response.
    ///
    /// Error replies become errors; a dead transport marks the session dead.
    fn round_trip(&mut self, request: &Request) -> Result<Response> {
        if !self.alive {
            return Err(BridgeError::TransportClosed);
        }
        tracing::debug!(command = request.command(), "request");

        if let Some(log) = &mut self.log {
            if let Err(e) = log.before_call() {
                tracing::warn!("Failed to reset engine log: {}", e);
            }
        }

        let result = self
            .transport
            .send(request)
            .and_then(|()| self.transport.receive());

        if let Some(log) = &mut self.log {
            if let Err(e) = log.after_call() {
                tracing::warn!("Failed to forward engine log: {}", e);
            }
        }

        match result {
            Ok(Response::Error(remote)) => {
                tracing::debug!("error reply: {}", remote.message);
                Err(remote.into())
            }
            Ok(response) => {
                tracing::debug!(reply = response.kind_name(), "response");
                Ok(response)
            }
            Err(e) if e.is_transport_closed() => {
                self.alive = false;
                Err(e)
            }
            Err(BridgeError::Json(e)) => Err(BridgeError::TypeMismatch(format!(
                "undecodable response: {}",
                e
            ))),
            Err(e) => Err(e),
        }
    }

    fn delete(&mut self, id: HandleId) {
        if !self.alive {
            return;
        }
        match self.round_trip(&Request::Delete { id }) {
            Ok(Response::Ack) => {}
            Ok(other) => tracing::warn!("Unexpected {} reply to delete of {}", other.kind_name(), id),
            Err(e) => tracing::warn!("Failed to delete {}: {}", id, e),
        }
    }

    /// Forget a proxy whose last clone is gone, unless a newer proxy for the
    /// same id is already live.
    pub(crate) fn release(&mut self, id: HandleId) {
        if let Some(weak) = self.proxies.get(&id) {
            if weak.strong_count() > 0 {
                return;
            }
        }
        self.proxies.remove(&id);
        self.delete(id);
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = match self.round_trip(&Request::Terminate) {
            Ok(Response::Eof) => Ok(()),
            Ok(other) => Err(unexpected("eof", &other)),
            Err(e) if e.is_transport_closed() => Ok(()),
            Err(e) => Err(e),
        };
        self.alive = false;
        self.log = None;

        let shutdown = self.transport.shutdown();
        tracing::info!("Bridge session closed");
        result.and(shutdown)
    }
}

fn unexpected(expected: &'static str, got: &Response) -> BridgeError {
    ProtocolError::UnexpectedResponse {
        expected,
        got: got.kind_name().to_string(),
    }
    .into()
}

/// Call `method` on object `id`.
///
/// With `strict == false` a transport that is closed, or closes during the
/// call, yields `Value::None` and a warning instead of an error.
pub(crate) fn call(
    session: &SessionRef,
    id: HandleId,
    method: &str,
    args: &[Value],
    strict: bool,
) -> Result<Value> {
    let args = args
        .iter()
        .map(|arg| arg.to_wire(session))
        .collect::<Result<Vec<_>>>()?;
    let request = Request::Call {
        id,
        method: method.to_string(),
        args,
    };

    let mut guard = lock(session);
    match guard.round_trip(&request) {
        Ok(Response::Value(wire)) => Ok(value::decode(session, &mut guard.proxies, wire)),
        Ok(other) => Err(unexpected("value", &other)),
        Err(BridgeError::TransportClosed) if !strict => {
            tracing::warn!("Transport closed; call to {} on {} returned nothing", method, id);
            Ok(Value::None)
        }
        Err(e) => Err(e),
    }
}

pub(crate) fn is_instance(session: &SessionRef, id: HandleId, kind: GeometryKind) -> Result<bool> {
    let request = Request::IsInstance {
        id,
        kind: kind.as_str().to_string(),
    };
    match lock(session).round_trip(&request)? {
        Response::Value(WireValue::Base(BaseValue::Bool(result))) => Ok(result),
        other => Err(unexpected("boolean value", &other)),
    }
}

pub(crate) fn list_attributes(session: &SessionRef, id: HandleId) -> Result<Vec<AttributeInfo>> {
    match lock(session).round_trip(&Request::GetSelfDir { id })? {
        Response::Attributes(attributes) => Ok(attributes),
        other => Err(unexpected("attributes", &other)),
    }
}

/// A live session with a client process.
pub struct Connection {
    session: SessionRef,
    root: Proxy,
    parameters: Parameters,
}

impl Connection {
    /// Start a client as configured and run the handshake.
    pub fn open(config: &BridgeConfig) -> Result<Self> {
        let library_path = config.resolve_library_path()?;

        let (transport, file): (Box<dyn Transport>, String) = match &config.transport {
            TransportConfig::Local { .. } => {
                let program = config.resolve_client_program()?;
                let transport: Box<dyn Transport> =
                    Box::new(ProcessTransport::spawn_local(&program, &config.engine)?);
                (transport, program.display().to_string())
            }
            TransportConfig::Ssh {
                destination,
                program,
                library_dirs,
                ssh_program,
            } => {
                let transport: Box<dyn Transport> = Box::new(ProcessTransport::spawn_ssh(
                    ssh_program,
                    destination,
                    program,
                    library_dirs,
                    &config.engine,
                )?);
                (transport, program.clone())
            }
        };

        let parameters = Parameters {
            file,
            library_path: library_path.display().to_string(),
            log_path: config.log_path.as_ref().map(|p| p.display().to_string()),
        };
        let mut args = vec![CLIENT_PROGRAM.to_string()];
        args.extend(config.engine_args());

        Self::open_with(transport, parameters, args)
    }

    /// Run the handshake over an already-built transport.
    ///
    /// When neither `parameters` nor `args` name a log and the transport
    /// allows it, the engine log is bridged to stderr.
    pub fn open_with(
        transport: impl Transport + 'static,
        mut parameters: Parameters,
        args: Vec<String>,
    ) -> Result<Self> {
        let mut transport: Box<dyn Transport> = Box::new(transport);
        transport.bootstrap()?;

        if parameters.log_path.is_none() {
            parameters.log_path = log_path_from_args(&args);
        }
        let log = if parameters.log_path.is_none() && transport.supports_log_bridge() {
            let bridge = LogBridge::new()?;
            parameters.log_path = Some(bridge.path().display().to_string());
            Some(bridge)
        } else {
            None
        };

        let mut session = Session::new(transport);
        session.log = log;

        match session.round_trip(&Request::Parameters(parameters.clone()))? {
            Response::Ack => {}
            other => return Err(unexpected("ack", &other)),
        }

        let root = match session.round_trip(&Request::Init { args: args.clone() })? {
            Response::Value(WireValue::Handle(handle)) => handle,
            other => return Err(unexpected("root handle", &other)),
        };
        tracing::info!(root = %root.id, "Connected to engine with {:?}", args);

        let session = Arc::new(Mutex::new(session));
        let root = Self::root_proxy(&session, root);

        Ok(Self {
            session,
            root,
            parameters,
        })
    }

    fn root_proxy(session: &SessionRef, handle: Handle) -> Proxy {
        let id = handle.id;
        let root = Proxy::new(Arc::clone(session), handle, true);
        lock(session).proxies.insert(id, root.downgrade());
        root
    }

    /// The engine's root object.
    pub fn root(&self) -> Proxy {
        self.root.clone()
    }

    /// Parameters sent during the handshake, including the negotiated log.
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.session).is_alive()
    }

    /// Replace the sink the bridged engine log is copied to.
    ///
    /// Returns `false` if the log is not bridged for this session.
    pub fn set_log_sink(&self, sink: Box<dyn Write + Send>) -> bool {
        match &mut lock(&self.session).log {
            Some(log) => {
                log.set_sink(sink);
                true
            }
            None => false,
        }
    }

    /// Call `method` on `handle`. A closed transport yields `Value::None`.
    pub fn call(&self, handle: &Handle, method: &str, args: Vec<Value>) -> Result<Value> {
        call(&self.session, handle.id, method, &args, false)
    }

    /// Call `method` on `handle`; a closed transport is an error.
    pub fn try_call(&self, handle: &Handle, method: &str, args: Vec<Value>) -> Result<Value> {
        call(&self.session, handle.id, method, &args, true)
    }

    pub fn is_instance(&self, handle: &Handle, kind: GeometryKind) -> Result<bool> {
        is_instance(&self.session, handle.id, kind)
    }

    pub fn list_attributes(&self, handle: &Handle) -> Result<Vec<AttributeInfo>> {
        list_attributes(&self.session, handle.id)
    }

    /// Tell the client to forget `handle`. Failures are logged and ignored.
    pub fn delete(&self, handle: &Handle) {
        lock(&self.session).delete(handle.id);
    }

    /// Terminate the client and shut the transport down. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        lock(&self.session).close()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Error while closing bridge session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SandboxEngine;
    use crate::transport::InProcessTransport;
    use pretty_assertions::assert_eq;
    use std::io;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn parameters() -> Parameters {
        Parameters {
            file: "meshbridge-client".to_string(),
            library_path: "/opt/engine/bin".to_string(),
            log_path: None,
        }
    }

    fn connect() -> Connection {
        let transport = InProcessTransport::spawn(SandboxEngine::new()).unwrap();
        Connection::open_with(transport, parameters(), vec!["engine".to_string()]).unwrap()
    }

    fn make_box(conn: &Connection) -> Proxy {
        conn.root()
            .invoke("makeBox", vec![1.into(), 1.into(), 1.into()])
            .unwrap()
            .as_proxy()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_root_handle_and_display() {
        let conn = connect();
        let root = conn.root();
        assert!(root.is_root());
        assert_eq!(root.to_string(), "engine");
        assert!(conn.is_alive());
    }

    #[test]
    fn test_same_object_maps_to_same_proxy() {
        let conn = connect();
        let volume = make_box(&conn);
        let again = conn
            .root()
            .invoke("echo", vec![volume.clone().into()])
            .unwrap()
            .into_list()
            .unwrap()
            .remove(0);
        assert_eq!(again, Value::Object(volume.clone()));
        assert_eq!(again.as_proxy().unwrap().id(), volume.id());
    }

    #[test]
    fn test_delete_then_isinstance_is_protocol_error() {
        let conn = connect();
        let volume = make_box(&conn);
        assert!(volume.is_instance(GeometryKind::Volume).unwrap());

        conn.delete(volume.handle());
        let err = volume.is_instance(GeometryKind::Volume).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::UnknownHandle(id)) if id == volume.id()
        ));
        // The session stays usable.
        assert!(conn.is_alive());
        assert!(conn.root().is_instance(GeometryKind::Volume).is_ok());
    }

    #[test]
    fn test_nested_arguments_keep_structure() {
        let conn = connect();
        let h1 = make_box(&conn);
        let h2 = make_box(&conn);
        let args = vec![
            Value::from(vec![h1.clone(), h2.clone()]),
            Value::from(3.5),
            Value::from("label"),
        ];
        let echoed = conn.root().invoke("echo", args.clone()).unwrap();
        assert_eq!(echoed, Value::List(args));
    }

    #[test]
    fn test_non_finite_argument_is_rejected_before_sending() {
        let conn = connect();
        let root = conn.root();

        for arg in [
            Value::Float(f64::NAN),
            Value::from(vec![Value::Int(1), Value::Float(f64::INFINITY)]),
        ] {
            let err = root.invoke("echo", vec![arg]).unwrap_err();
            assert!(matches!(err, BridgeError::TypeMismatch(_)), "got {:?}", err);
        }
        let err = root
            .invoke("makeBox", vec![f64::INFINITY.into(), 1.into(), 1.into()])
            .unwrap_err();
        assert!(matches!(err, BridgeError::TypeMismatch(_)));

        assert!(conn.is_alive());
        assert_eq!(
            root.invoke("get_volume_count", Vec::new()).unwrap(),
            Value::Int(0)
        );
    }

    #[test]
    fn test_engine_failure_closes_session_softly() {
        let conn = connect();
        let volume = make_box(&conn);

        let result = conn.root().invoke("fail", vec!["boom".into()]).unwrap();
        assert!(result.is_none());
        assert!(!conn.is_alive());
        assert!(!volume.connection_alive());

        let err = conn
            .try_call(conn.root().handle(), "get_volume_count", Vec::new())
            .unwrap_err();
        assert!(err.is_transport_closed());

        // Releasing after the client died is silent.
        volume.release();
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut conn = connect();
        let volume = make_box(&conn);
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(!conn.is_alive());
        assert!(volume.invoke("volume", Vec::new()).unwrap().is_none());
    }

    #[test]
    fn test_log_bridge_follows_call_order() {
        let conn = connect();
        let sink = SharedBuffer::default();
        assert!(conn.set_log_sink(Box::new(sink.clone())));

        conn.root().invoke("cmd", vec!["create sphere".into()]).unwrap();
        make_box(&conn);
        conn.root().invoke("cmd", vec!["mesh volume all".into()]).unwrap();

        let text = sink.text();
        let first = text.find("create sphere").unwrap();
        let created = text.find("Created volume 1").unwrap();
        let last = text.find("mesh volume all").unwrap();
        assert!(first < created && created < last, "log out of order: {}", text);
    }

    #[test]
    fn test_user_log_disables_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("engine.log");
        let transport = InProcessTransport::spawn(SandboxEngine::new()).unwrap();
        let args = vec![
            "engine".to_string(),
            "-log".to_string(),
            log.display().to_string(),
        ];
        let conn = Connection::open_with(transport, parameters(), args).unwrap();
        assert!(!conn.set_log_sink(Box::new(io::sink())));
        assert_eq!(conn.parameters().log_path, Some(log.display().to_string()));

        conn.root().invoke("cmd", vec!["reset".into()]).unwrap();
        let written = std::fs::read_to_string(&log).unwrap();
        assert!(written.contains("reset"));
    }
}
