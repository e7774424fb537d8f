//! The client-side dispatch loop.
//!
//! A single-threaded state machine that owns the engine and its registry:
//!
//! ```text
//! AwaitingParameters --parameters--> AwaitingInit --init--> Serving --terminate--> Terminated
//! ```
//!
//! Protocol violations and values that cannot cross the wire are answered
//! in `Serving` with an error reply and the loop keeps going. An exception raised by the engine is not masked: it ends
//! the loop without a reply, and the host sees the channel close.

use std::io::{BufRead, Write};

use crate::engine::{Engine, EngineError};
use crate::error::{BridgeError, ProtocolError, RemoteError, Result};
use crate::protocol::{BaseValue, GeometryKind, HandleId, Request, Response, WireValue};
use crate::transport::FramedChannel;

use super::codec::{decode_args, encode_result};
use super::registry::Registry;

/// Where the dispatch loop is in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    AwaitingParameters,
    AwaitingInit,
    Serving,
    Terminated,
}

/// Services requests against one engine instance.
pub struct Dispatcher<E: Engine> {
    engine: E,
    registry: Registry<E::Object>,
    state: DispatchState,
}

impl<E: Engine> Dispatcher<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            registry: Registry::new(),
            state: DispatchState::AwaitingParameters,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn registry(&self) -> &Registry<E::Object> {
        &self.registry
    }

    /// Handle one request and produce its reply.
    ///
    /// Returns `Err` only for failures that end the session: engine load or
    /// init failures, engine exceptions, and requests that arrive before the
    /// session is set up.
    pub fn handle(&mut self, request: Request) -> Result<Response> {
        tracing::debug!(state = ?self.state, command = request.command(), "dispatch");

        if let Request::Terminate = request {
            self.state = DispatchState::Terminated;
            return Ok(Response::Eof);
        }

        match self.state {
            DispatchState::AwaitingParameters => self.handle_parameters(request),
            DispatchState::AwaitingInit => self.handle_init(request),
            DispatchState::Serving => match self.serve_request(request) {
                Ok(response) => Ok(response),
                Err(BridgeError::Protocol(err)) => {
                    tracing::warn!("Rejecting request: {}", err);
                    Ok(Response::Error(RemoteError::protocol(&err)))
                }
                Err(err) => Err(err),
            },
            DispatchState::Terminated => Err(ProtocolError::OutOfOrder(format!(
                "{} after terminate",
                request.command()
            ))
            .into()),
        }
    }

    fn handle_parameters(&mut self, request: Request) -> Result<Response> {
        let Request::Parameters(params) = request else {
            return Err(ProtocolError::OutOfOrder(format!(
                "expected parameters, got {}",
                request.command()
            ))
            .into());
        };

        tracing::info!(
            library_path = %params.library_path,
            log_path = ?params.log_path,
            "Loading engine"
        );
        self.engine
            .load(&params)
            .map_err(|e| BridgeError::Configuration(e.to_string()))?;
        self.state = DispatchState::AwaitingInit;
        Ok(Response::Ack)
    }

    fn handle_init(&mut self, request: Request) -> Result<Response> {
        let Request::Init { args } = request else {
            return Err(ProtocolError::OutOfOrder(format!(
                "expected init, got {}",
                request.command()
            ))
            .into());
        };

        let root = self.engine.init(&args).map_err(remote)?;
        let identity = self.engine.identity(&root);
        let display = self.engine.describe(&root);
        let handle = self.registry.register_root(root, identity, move || display);

        tracing::info!(root = %handle.id, "Engine initialized with {:?}", args);
        self.state = DispatchState::Serving;
        Ok(Response::Value(WireValue::Handle(handle)))
    }

    fn serve_request(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::IsInstance { id, kind } => {
                let kind: GeometryKind = kind.parse()?;
                let object = self.registry.get(id)?;
                let result = self.engine.is_kind(object, kind);
                Ok(Response::Value(WireValue::Base(BaseValue::Bool(result))))
            }
            Request::GetSelfDir { id } => {
                let object = self.registry.get(id)?;
                match self.engine.attributes(object) {
                    Ok(attributes) => Ok(Response::Attributes(attributes)),
                    Err(EngineError::UnsupportedType(what)) => Ok(type_mismatch(id, "dir", &what)),
                    Err(e) => Err(remote(e)),
                }
            }
            Request::Delete { id } => {
                let removed = self.registry.remove(id);
                tracing::debug!(%id, removed, "delete");
                Ok(Response::Ack)
            }
            Request::Call { id, method, args } => self.call(id, &method, args),
            Request::Parameters(_) | Request::Init { .. } => Err(ProtocolError::OutOfOrder(
                format!("{} while serving", request.command()),
            )
            .into()),
            Request::Terminate => Ok(Response::Eof),
        }
    }

    fn call(&mut self, id: HandleId, method: &str, args: Vec<WireValue>) -> Result<Response> {
        let target = self.registry.get(id)?.clone();
        let args = decode_args::<E>(&self.registry, args)?;

        let encoded = self
            .engine
            .invoke(&target, method, args)
            .and_then(|result| encode_result(&self.engine, &mut self.registry, result));

        match encoded {
            Ok(value) => Ok(Response::Value(value)),
            Err(EngineError::UnsupportedType(what)) => Ok(type_mismatch(id, method, &what)),
            Err(e) => {
                tracing::error!(object = %id, method, "Engine raised: {}", e);
                Err(remote(e))
            }
        }
    }
}

fn remote(err: EngineError) -> BridgeError {
    BridgeError::RemoteExecution(err.to_string())
}

fn type_mismatch(id: HandleId, member: &str, what: &str) -> Response {
    tracing::warn!(object = %id, member, "Result cannot cross the bridge: {}", what);
    Response::Error(RemoteError::type_mismatch(format!(
        "{} on {} returned {}",
        member, id, what
    )))
}

/// Run the dispatch loop over a framed channel until the host terminates the
/// session, the channel closes, or the engine fails.
///
/// Requests that cannot be decoded are answered with a protocol error reply.
pub fn serve<E, R, W>(engine: E, channel: &mut FramedChannel<R, W>) -> Result<()>
where
    E: Engine,
    R: BufRead,
    W: Write,
{
    let mut dispatcher = Dispatcher::new(engine);

    loop {
        let raw = channel.receive_text()?;

        let response = match serde_json::from_str::<Request>(&raw) {
            Ok(request) => dispatcher.handle(request)?,
            Err(e) if dispatcher.state() == DispatchState::Serving => {
                let err = ProtocolError::UnknownCommand(e.to_string());
                tracing::warn!("Rejecting undecodable request: {}", err);
                Response::Error(RemoteError::protocol(&err))
            }
            Err(e) => return Err(ProtocolError::UnknownCommand(e.to_string()).into()),
        };

        channel.send(&response)?;

        if dispatcher.state() == DispatchState::Terminated {
            tracing::info!("Host terminated the session");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineValue, SandboxEngine};
    use crate::protocol::{AttributeInfo, Handle, Parameters};
    use pretty_assertions::assert_eq;

    fn params() -> Parameters {
        Parameters {
            file: "meshbridge-client".to_string(),
            library_path: "/opt/engine/bin".to_string(),
            log_path: None,
        }
    }

    fn serving() -> (Dispatcher<SandboxEngine>, Handle) {
        let mut dispatcher = Dispatcher::new(SandboxEngine::new());
        assert_eq!(
            dispatcher.handle(Request::Parameters(params())).unwrap(),
            Response::Ack
        );
        let root = match dispatcher
            .handle(Request::Init {
                args: vec!["engine".to_string(), "-quiet".to_string()],
            })
            .unwrap()
        {
            Response::Value(WireValue::Handle(h)) => h,
            other => panic!("Expected root handle, got {:?}", other),
        };
        assert_eq!(dispatcher.state(), DispatchState::Serving);
        (dispatcher, root)
    }

    fn call(
        d: &mut Dispatcher<SandboxEngine>,
        id: HandleId,
        method: &str,
        args: Vec<WireValue>,
    ) -> Response {
        d.handle(Request::Call {
            id,
            method: method.to_string(),
            args,
        })
        .unwrap()
    }

    fn int(v: i64) -> WireValue {
        WireValue::Base(BaseValue::Int(v))
    }

    fn make_box(d: &mut Dispatcher<SandboxEngine>, root: &Handle) -> Handle {
        match call(d, root.id, "makeBox", vec![int(1), int(1), int(1)]) {
            Response::Value(WireValue::Handle(h)) => h,
            other => panic!("Expected handle, got {:?}", other),
        }
    }

    #[test]
    fn test_lifecycle_states() {
        let (mut dispatcher, root) = serving();
        assert_eq!(root.id, HandleId(1));
        assert_eq!(root.display, "engine");
        assert_eq!(dispatcher.handle(Request::Terminate).unwrap(), Response::Eof);
        assert_eq!(dispatcher.state(), DispatchState::Terminated);
    }

    #[test]
    fn test_call_before_init_is_fatal() {
        let mut dispatcher = Dispatcher::new(SandboxEngine::new());
        let err = dispatcher
            .handle(Request::GetSelfDir { id: HandleId(1) })
            .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(ProtocolError::OutOfOrder(_))));
    }

    #[test]
    fn test_isinstance_then_delete_then_unknown_id() {
        let (mut d, root) = serving();
        let volume = make_box(&mut d, &root);

        let check = Request::IsInstance {
            id: volume.id,
            kind: "volume".to_string(),
        };
        assert_eq!(
            d.handle(check.clone()).unwrap(),
            Response::Value(WireValue::Base(BaseValue::Bool(true)))
        );

        assert_eq!(d.handle(Request::Delete { id: volume.id }).unwrap(), Response::Ack);
        match d.handle(check).unwrap() {
            Response::Error(err) => assert_eq!(err.id, Some(volume.id)),
            other => panic!("Expected protocol error reply, got {:?}", other),
        }
        // Session survives the protocol error.
        assert_eq!(d.state(), DispatchState::Serving);
    }

    #[test]
    fn test_double_delete_and_root_delete() {
        let (mut d, root) = serving();
        let volume = make_box(&mut d, &root);
        assert_eq!(d.handle(Request::Delete { id: volume.id }).unwrap(), Response::Ack);
        assert_eq!(d.handle(Request::Delete { id: volume.id }).unwrap(), Response::Ack);
        assert_eq!(d.handle(Request::Delete { id: root.id }).unwrap(), Response::Ack);
        assert!(d.registry().contains(root.id));
        assert_eq!(d.registry().len(), 1);
    }

    #[test]
    fn test_unknown_geometry_kind_is_rejected() {
        let (mut d, root) = serving();
        let reply = d
            .handle(Request::IsInstance {
                id: root.id,
                kind: "blob".to_string(),
            })
            .unwrap();
        assert!(matches!(reply, Response::Error(_)));
    }

    #[test]
    fn test_nested_arguments_round_trip_through_echo() {
        let (mut d, root) = serving();
        let h1 = make_box(&mut d, &root);
        let h2 = make_box(&mut d, &root);

        let args = vec![
            WireValue::List(vec![WireValue::Handle(h1.clone()), WireValue::Handle(h2.clone())]),
            WireValue::Base(BaseValue::Float(3.5)),
            WireValue::Base(BaseValue::Str("label".to_string())),
        ];
        let reply = call(&mut d, root.id, "echo", args.clone());
        assert_eq!(reply, Response::Value(WireValue::List(args)));
    }

    #[test]
    fn test_engine_failure_ends_session() {
        let (mut d, root) = serving();
        let err = d
            .handle(Request::Call {
                id: root.id,
                method: "fail".to_string(),
                args: vec![WireValue::Base(BaseValue::Str("boom".to_string()))],
            })
            .unwrap_err();
        match err {
            BridgeError::RemoteExecution(msg) => assert_eq!(msg, "boom"),
            other => panic!("Expected RemoteExecution, got {:?}", other),
        }
    }

    #[test]
    fn test_get_self_dir() {
        let (mut d, root) = serving();
        let volume = make_box(&mut d, &root);
        match d.handle(Request::GetSelfDir { id: volume.id }).unwrap() {
            Response::Attributes(attrs) => {
                assert!(attrs.contains(&AttributeInfo::method("surfaces")));
                assert!(attrs.contains(&AttributeInfo::value("name")));
            }
            other => panic!("Expected attributes, got {:?}", other),
        }
    }

    /// Engine whose results exercise the values that cannot cross the wire.
    struct StubEngine;

    impl Engine for StubEngine {
        type Object = u32;

        fn load(&mut self, _params: &Parameters) -> std::result::Result<(), EngineError> {
            Ok(())
        }

        fn init(&mut self, _args: &[String]) -> std::result::Result<u32, EngineError> {
            Ok(0)
        }

        fn identity(&self, obj: &u32) -> u64 {
            u64::from(*obj)
        }

        fn describe(&self, _obj: &u32) -> String {
            "stub".to_string()
        }

        fn attributes(&self, _obj: &u32) -> std::result::Result<Vec<AttributeInfo>, EngineError> {
            Err(EngineError::UnsupportedType("dict".to_string()))
        }

        fn invoke(
            &mut self,
            _obj: &u32,
            name: &str,
            _args: Vec<EngineValue<u32>>,
        ) -> std::result::Result<EngineValue<u32>, EngineError> {
            match name {
                "mapping" => Err(EngineError::UnsupportedType("dict".to_string())),
                "overflow" => Ok(EngineValue::List(vec![
                    EngineValue::Object(7),
                    EngineValue::float(f64::INFINITY),
                ])),
                "count" => Ok(EngineValue::int(0)),
                other => Err(EngineError::Raised(format!("no member {}", other))),
            }
        }

        fn is_kind(&self, _obj: &u32, _kind: GeometryKind) -> bool {
            false
        }
    }

    fn assert_type_mismatch(response: Response) {
        match response {
            Response::Error(err) => {
                assert_eq!(err.kind, crate::error::RemoteErrorKind::TypeMismatch);
                assert_eq!(err.id, None);
            }
            other => panic!("Expected type mismatch reply, got {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_results_are_answered_and_session_survives() {
        let mut d = Dispatcher::new(StubEngine);
        d.handle(Request::Parameters(params())).unwrap();
        d.handle(Request::Init { args: Vec::new() }).unwrap();
        let root = HandleId(1);

        assert_type_mismatch(
            d.handle(Request::Call {
                id: root,
                method: "mapping".to_string(),
                args: Vec::new(),
            })
            .unwrap(),
        );
        assert_type_mismatch(
            d.handle(Request::Call {
                id: root,
                method: "overflow".to_string(),
                args: Vec::new(),
            })
            .unwrap(),
        );
        assert_type_mismatch(d.handle(Request::GetSelfDir { id: root }).unwrap());

        // The rejected result registered nothing.
        assert_eq!(d.registry().len(), 1);
        assert_eq!(d.state(), DispatchState::Serving);
        assert_eq!(
            d.handle(Request::Call {
                id: root,
                method: "count".to_string(),
                args: Vec::new(),
            })
            .unwrap(),
            Response::Value(WireValue::Base(BaseValue::Int(0)))
        );
    }

    #[test]
    fn test_serve_answers_undecodable_request_and_keeps_going() {
        use crate::framing::{read_message, write_message};
        use std::io::Cursor;

        let mut input = Vec::new();
        let frames = [
            serde_json::to_string(&Request::Parameters(params())).unwrap(),
            serde_json::to_string(&Request::Init {
                args: vec!["engine".to_string()],
            })
            .unwrap(),
            r#"{"cmd":"explode"}"#.to_string(),
            serde_json::to_string(&Request::Call {
                id: HandleId(1),
                method: "get_volume_count".to_string(),
                args: Vec::new(),
            })
            .unwrap(),
            serde_json::to_string(&Request::Terminate).unwrap(),
        ];
        for frame in &frames {
            write_message(&mut input, frame).unwrap();
        }

        let mut channel = FramedChannel::new(Cursor::new(input), Vec::new());
        serve(SandboxEngine::new(), &mut channel).unwrap();

        let (_, output) = channel.into_inner();
        let mut output = Cursor::new(output);
        let replies: Vec<Response> = (0..frames.len())
            .map(|_| serde_json::from_str(&read_message(&mut output).unwrap()).unwrap())
            .collect();

        assert_eq!(replies[0], Response::Ack);
        assert!(matches!(replies[1], Response::Value(WireValue::Handle(_))));
        match &replies[2] {
            Response::Error(err) => {
                assert_eq!(err.kind, crate::error::RemoteErrorKind::Protocol);
                assert!(err.message.contains("explode"), "message was: {}", err.message);
            }
            other => panic!("Expected protocol error reply, got {:?}", other),
        }
        assert_eq!(replies[3], Response::Value(WireValue::Base(BaseValue::Int(0))));
        assert_eq!(replies[4], Response::Eof);
    }
}
