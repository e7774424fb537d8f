//! The seam between the dispatch loop and a concrete geometry engine.
//!
//! The dispatch loop never interprets engine objects; it only stores them in
//! the registry, asks the engine to invoke members on them, and classifies
//! the results. Two bindings ship with the crate:
//!
//! - `sandbox` - a deterministic in-memory kernel used by tests and demos
//! - `python` (feature `python`) - an engine module living in an embedded
//!   Python interpreter

pub mod sandbox;

#[cfg(feature = "python")]
pub mod python;

use thiserror::Error;

use crate::protocol::{AttributeInfo, BaseValue, GeometryKind, Parameters};

pub use sandbox::SandboxEngine;

#[cfg(feature = "python")]
pub use python::PythonEngine;

/// Failures raised by the engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine library could not be located or loaded.
    #[error("engine could not be loaded: {0}")]
    Load(String),

    /// The engine raised while executing a member.
    #[error("{0}")]
    Raised(String),

    /// The engine produced a value outside the base/object/list grammar.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
}

/// Native value on the client side: a base value, a live engine object, or
/// a (possibly nested) list of those.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineValue<O> {
    Base(BaseValue),
    Object(O),
    List(Vec<EngineValue<O>>),
}

impl<O> EngineValue<O> {
    pub fn none() -> Self {
        EngineValue::Base(BaseValue::None)
    }

    pub fn int(v: i64) -> Self {
        EngineValue::Base(BaseValue::Int(v))
    }

    pub fn float(v: f64) -> Self {
        EngineValue::Base(BaseValue::Float(v))
    }

    pub fn str(v: impl Into<String>) -> Self {
        EngineValue::Base(BaseValue::Str(v.into()))
    }

    pub fn bool(v: bool) -> Self {
        EngineValue::Base(BaseValue::Bool(v))
    }

    /// Numeric view; integers widen to float, booleans count as 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EngineValue::Base(BaseValue::Int(v)) => Some(*v as f64),
            EngineValue::Base(BaseValue::Float(v)) => Some(*v),
            EngineValue::Base(BaseValue::Bool(v)) => Some(f64::from(u8::from(*v))),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EngineValue::Base(BaseValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&O> {
        match self {
            EngineValue::Object(o) => Some(o),
            _ => None,
        }
    }
}

/// A geometry engine that can be served over the bridge.
///
/// Every call happens on the dispatch loop's thread, one at a time.
pub trait Engine {
    /// Live engine object stored in the registry.
    type Object: Clone;

    /// Make the engine library loadable from `params.library_path`.
    fn load(&mut self, params: &Parameters) -> Result<(), EngineError>;

    /// Initialize the engine with argv-like `args` and return its root object.
    fn init(&mut self, args: &[String]) -> Result<Self::Object, EngineError>;

    /// Identity key of `obj`; must stay stable and unique while the object
    /// is registered.
    fn identity(&self, obj: &Self::Object) -> u64;

    /// Display text for the object's handle.
    fn describe(&self, obj: &Self::Object) -> String;

    /// Member names of `obj` and whether each is callable.
    fn attributes(&self, obj: &Self::Object) -> Result<Vec<AttributeInfo>, EngineError>;

    /// Invoke member `name` on `obj`.
    ///
    /// For a non-callable attribute with no arguments this returns the
    /// attribute's value.
    fn invoke(
        &mut self,
        obj: &Self::Object,
        name: &str,
        args: Vec<EngineValue<Self::Object>>,
    ) -> Result<EngineValue<Self::Object>, EngineError>;

    /// Whether `obj` is an entity of the given geometry kind.
    fn is_kind(&self, obj: &Self::Object, kind: GeometryKind) -> bool;
}

/// Extract the value following a `-log` flag (`-log <path>` or `-log=<path>`).
pub fn log_path_from_args(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(path) = arg.strip_prefix("-log=") {
            return Some(path.to_string());
        }
        if arg == "-log" {
            return iter.next().cloned();
        }
    }
    None
}
