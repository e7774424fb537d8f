//! Wire protocol types for the host <-> client bridge.
//!
//! Every message is a single JSON value carried in one Content-Length frame
//! (see `framing`). Requests are internally tagged by `cmd`, responses are
//! adjacently tagged by `reply`/`data`:
//!
//! ```text
//! host -> client   {"cmd":"call","id":"mbx:1","method":"makeBox","args":[1,1,1]}
//! client -> host   {"reply":"value","data":{"$handle":["mbx:2","volume 1"]}}
//! ```
//!
//! Handles travel inside a tagged `{"$handle": [id, display]}` envelope, so a
//! plain string result can never be mistaken for an object reference.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, RemoteError};

/// Prefix that every wire id string carries.
pub const HANDLE_PREFIX: &str = "mbx:";

/// Registry key of one live engine object.
///
/// Allocated from a monotonically increasing counter by the client, so an id
/// is never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", HANDLE_PREFIX, self.0)
    }
}

impl FromStr for HandleId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix(HANDLE_PREFIX)
            .and_then(|n| n.parse::<u64>().ok())
            .map(HandleId)
            .ok_or_else(|| ProtocolError::MalformedHandle(s.to_string()))
    }
}

impl Serialize for HandleId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HandleId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Wire-safe reference to a live engine object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub id: HandleId,
    /// Human-readable text authored by the client when the object was registered.
    pub display: String,
}

impl Handle {
    pub fn new(id: HandleId, display: impl Into<String>) -> Self {
        Self {
            id,
            display: display.into(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct HandleEnvelope {
    #[serde(rename = "$handle")]
    handle: (HandleId, String),
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        HandleEnvelope {
            handle: (self.id, self.display.clone()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let HandleEnvelope {
            handle: (id, display),
        } = HandleEnvelope::deserialize(deserializer)?;
        Ok(Handle { id, display })
    }
}

/// Values that cross the boundary by copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BaseValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Anything that can appear as an argument or a result on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Handle(Handle),
    List(Vec<WireValue>),
    Base(BaseValue),
}

impl WireValue {
    pub fn none() -> Self {
        WireValue::Base(BaseValue::None)
    }

    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            WireValue::Handle(_) => "handle",
            WireValue::List(_) => "list",
            WireValue::Base(BaseValue::None) => "none",
            WireValue::Base(BaseValue::Bool(_)) => "bool",
            WireValue::Base(BaseValue::Int(_)) => "int",
            WireValue::Base(BaseValue::Float(_)) => "float",
            WireValue::Base(BaseValue::Str(_)) => "str",
        }
    }
}

/// The four geometry kinds an object can be tested against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Vertex,
    Curve,
    Surface,
    Volume,
}

impl GeometryKind {
    /// All kinds, in the order used when probing an object's kind.
    pub const ALL: [GeometryKind; 4] = [
        GeometryKind::Vertex,
        GeometryKind::Curve,
        GeometryKind::Surface,
        GeometryKind::Volume,
    ];

    /// Canonical code sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryKind::Vertex => "vertex",
            GeometryKind::Curve => "curve",
            GeometryKind::Surface => "surface",
            GeometryKind::Volume => "volume",
        }
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeometryKind {
    type Err = ProtocolError;

    /// Accepts the canonical codes and the legacy `cubitpy_` prefixed ones.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.strip_prefix("cubitpy_").unwrap_or(s);
        GeometryKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(code))
            .ok_or_else(|| ProtocolError::UnknownGeometryKind(s.to_string()))
    }
}

/// One entry of an attribute listing: `[name, isCallable]` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, bool)", into = "(String, bool)")]
pub struct AttributeInfo {
    pub name: String,
    pub callable: bool,
}

impl AttributeInfo {
    pub fn method(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            callable: true,
        }
    }

    pub fn value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            callable: false,
        }
    }
}

impl From<(String, bool)> for AttributeInfo {
    fn from((name, callable): (String, bool)) -> Self {
        Self { name, callable }
    }
}

impl From<AttributeInfo> for (String, bool) {
    fn from(info: AttributeInfo) -> Self {
        (info.name, info.callable)
    }
}

/// Startup parameters, sent exactly once before `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    /// Path of the client program as seen by the host.
    #[serde(rename = "__file__")]
    pub file: String,
    /// Directory that makes the engine loadable in the client process.
    pub library_path: String,
    /// Diagnostic log the engine should write to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

/// Host -> client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Parameters(Parameters),
    Init {
        args: Vec<String>,
    },
    Call {
        id: HandleId,
        method: String,
        #[serde(default)]
        args: Vec<WireValue>,
    },
    #[serde(rename = "isinstance")]
    IsInstance {
        id: HandleId,
        /// Kept as text so an unknown kind is reported, not rejected at decode.
        kind: String,
    },
    GetSelfDir {
        id: HandleId,
    },
    Delete {
        id: HandleId,
    },
    Terminate,
}

impl Request {
    /// Command tag, for logging.
    pub fn command(&self) -> &'static str {
        match self {
            Request::Parameters(_) => "parameters",
            Request::Init { .. } => "init",
            Request::Call { .. } => "call",
            Request::IsInstance { .. } => "isinstance",
            Request::GetSelfDir { .. } => "get_self_dir",
            Request::Delete { .. } => "delete",
            Request::Terminate => "terminate",
        }
    }
}

/// Client -> host messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "data", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Value(WireValue),
    Attributes(Vec<AttributeInfo>),
    Error(RemoteError),
    /// Sentinel sent once the serving loop has exited.
    Eof,
}

impl Response {
    /// Reply tag, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Response::Ack => "ack",
            Response::Value(_) => "value",
            Response::Attributes(_) => "attributes",
            Response::Error(_) => "error",
            Response::Eof => "eof",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_handle_id_wire_format() {
        assert_eq!(HandleId(42).to_string(), "mbx:42");
        assert_eq!("mbx:42".parse::<HandleId>().unwrap(), HandleId(42));
        assert!(matches!(
            "42".parse::<HandleId>(),
            Err(ProtocolError::MalformedHandle(_))
        ));
        assert!("mbx:".parse::<HandleId>().is_err());
    }

    #[test]
    fn test_handle_uses_tagged_envelope() {
        let value = WireValue::Handle(Handle::new(HandleId(3), "volume 1"));
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            json!({"$handle": ["mbx:3", "volume 1"]})
        );
    }

    #[test]
    fn test_prefixed_string_stays_a_string() {
        let value: WireValue = serde_json::from_value(json!("mbx:3")).unwrap();
        assert_eq!(value, WireValue::Base(BaseValue::Str("mbx:3".to_string())));

        let value: WireValue = serde_json::from_value(json!(["mbx:3", "volume 1"])).unwrap();
        assert!(matches!(value, WireValue::List(_)));
    }

    #[test]
    fn test_base_values_keep_their_type() {
        let decoded: Vec<WireValue> =
            serde_json::from_value(json!([null, true, 3, 3.5, "label"])).unwrap();
        assert_eq!(
            decoded,
            vec![
                WireValue::Base(BaseValue::None),
                WireValue::Base(BaseValue::Bool(true)),
                WireValue::Base(BaseValue::Int(3)),
                WireValue::Base(BaseValue::Float(3.5)),
                WireValue::Base(BaseValue::Str("label".to_string())),
            ]
        );

        let text = serde_json::to_string(&WireValue::Base(BaseValue::Float(1.0))).unwrap();
        let back: WireValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back, WireValue::Base(BaseValue::Float(1.0)));
    }

    #[test]
    fn test_unknown_object_shape_is_rejected() {
        let result: Result<WireValue, _> = serde_json::from_value(json!({"x": 1}));
        assert!(result.is_err());

        let result: Result<WireValue, _> =
            serde_json::from_value(json!({"$handle": ["nope", "x"]}));
        assert!(result.is_err());
    }

    #[test]
    fn test_request_shapes() {
        let call = Request::Call {
            id: HandleId(1),
            method: "makeBox".to_string(),
            args: vec![
                WireValue::Base(BaseValue::Int(1)),
                WireValue::List(vec![WireValue::Handle(Handle::new(HandleId(2), "v"))]),
            ],
        };
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({
                "cmd": "call",
                "id": "mbx:1",
                "method": "makeBox",
                "args": [1, [{"$handle": ["mbx:2", "v"]}]]
            })
        );

        let params = Request::Parameters(Parameters {
            file: "/usr/bin/meshbridge-client".to_string(),
            library_path: "/opt/engine/bin".to_string(),
            log_path: None,
        });
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({
                "cmd": "parameters",
                "__file__": "/usr/bin/meshbridge-client",
                "library_path": "/opt/engine/bin"
            })
        );

        let check: Request =
            serde_json::from_value(json!({"cmd": "isinstance", "id": "mbx:4", "kind": "volume"}))
                .unwrap();
        assert_eq!(
            check,
            Request::IsInstance {
                id: HandleId(4),
                kind: "volume".to_string()
            }
        );

        let terminate: Request = serde_json::from_value(json!({"cmd": "terminate"})).unwrap();
        assert_eq!(terminate, Request::Terminate);
    }

    #[test]
    fn test_unknown_command_fails_to_decode() {
        let result: Result<Request, _> = serde_json::from_value(json!({"cmd": "explode"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_response_shapes() {
        assert_eq!(serde_json::to_value(&Response::Ack).unwrap(), json!({"reply": "ack"}));
        assert_eq!(
            serde_json::to_value(&Response::Attributes(vec![
                AttributeInfo::method("mesh"),
                AttributeInfo::value("name"),
            ]))
            .unwrap(),
            json!({"reply": "attributes", "data": [["mesh", true], ["name", false]]})
        );

        let value: Response = serde_json::from_value(
            json!({"reply": "value", "data": ["a", [{"$handle": ["mbx:5", "s"]}], 2]}),
        )
        .unwrap();
        assert_eq!(
            value,
            Response::Value(WireValue::List(vec![
                WireValue::Base(BaseValue::Str("a".to_string())),
                WireValue::List(vec![WireValue::Handle(Handle::new(HandleId(5), "s"))]),
                WireValue::Base(BaseValue::Int(2)),
            ]))
        );
    }

    #[test]
    fn test_geometry_kind_codes() {
        assert_eq!("volume".parse::<GeometryKind>().unwrap(), GeometryKind::Volume);
        assert_eq!(
            "cubitpy_curve".parse::<GeometryKind>().unwrap(),
            GeometryKind::Curve
        );
        assert!(matches!(
            "body".parse::<GeometryKind>(),
            Err(ProtocolError::UnknownGeometryKind(_))
        ));
    }
}
