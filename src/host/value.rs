//! Host-side values and the host half of the handle codec.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::error::{BridgeError, Result};
use crate::protocol::{BaseValue, GeometryKind, HandleId, WireValue};

use super::connection::SessionRef;
use super::proxy::{Proxy, ProxyInner};

/// A value exchanged with the engine.
///
/// Base values are copies; `Object` is a live proxy for something that stays
/// in the client process.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Object(Proxy),
    List(Vec<Value>),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Value::Object(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float view; integers widen.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Encode for the wire. Proxies must belong to `session`.
    pub(crate) fn to_wire(&self, session: &SessionRef) -> Result<WireValue> {
        Ok(match self {
            Value::None => WireValue::Base(BaseValue::None),
            Value::Bool(v) => WireValue::Base(BaseValue::Bool(*v)),
            Value::Int(v) => WireValue::Base(BaseValue::Int(*v)),
            Value::Float(v) if !v.is_finite() => {
                return Err(BridgeError::TypeMismatch(format!(
                    "non-finite float {} cannot cross the bridge",
                    v
                )));
            }
            Value::Float(v) => WireValue::Base(BaseValue::Float(*v)),
            Value::Str(s) => WireValue::Base(BaseValue::Str(s.clone())),
            Value::Object(proxy) => {
                if !proxy.belongs_to(session) {
                    return Err(BridgeError::TypeMismatch(format!(
                        "{} belongs to another connection",
                        proxy
                    )));
                }
                WireValue::Handle(proxy.handle().clone())
            }
            Value::List(items) => WireValue::List(
                items
                    .iter()
                    .map(|item| item.to_wire(session))
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

/// Turn a wire result into a host value.
///
/// A handle that already has a live proxy maps to that proxy, so every clone
/// shares one client-side entry. Must be called with the session locked;
/// nothing here drops a proxy.
pub(crate) fn decode(
    session: &SessionRef,
    proxies: &mut HashMap<HandleId, Weak<ProxyInner>>,
    wire: WireValue,
) -> Value {
    match wire {
        WireValue::Base(BaseValue::None) => Value::None,
        WireValue::Base(BaseValue::Bool(v)) => Value::Bool(v),
        WireValue::Base(BaseValue::Int(v)) => Value::Int(v),
        WireValue::Base(BaseValue::Float(v)) => Value::Float(v),
        WireValue::Base(BaseValue::Str(s)) => Value::Str(s),
        WireValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| decode(session, proxies, item))
                .collect(),
        ),
        WireValue::Handle(handle) => {
            if let Some(inner) = proxies.get(&handle.id).and_then(Weak::upgrade) {
                return Value::Object(Proxy::from_inner(inner));
            }
            let id = handle.id;
            let proxy = Proxy::new(Arc::clone(session), handle, false);
            proxies.insert(id, proxy.downgrade());
            Value::Object(proxy)
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

macro_rules! value_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::Int(i64::from(v))
                }
            }
        )*
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl TryFrom<u64> for Value {
    type Error = BridgeError;

    fn try_from(v: u64) -> Result<Self> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| BridgeError::TypeMismatch(format!("{} does not fit in a 64-bit signed integer", v)))
    }
}

impl TryFrom<usize> for Value {
    type Error = BridgeError;

    fn try_from(v: usize) -> Result<Self> {
        Value::try_from(v as u64)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<GeometryKind> for Value {
    fn from(kind: GeometryKind) -> Self {
        Value::Str(kind.as_str().to_string())
    }
}

impl From<Proxy> for Value {
    fn from(p: Proxy) -> Self {
        Value::Object(p)
    }
}

impl From<&Proxy> for Value {
    fn from(p: &Proxy) -> Self {
        Value::Object(p.clone())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::None, Into::into)
    }
}
