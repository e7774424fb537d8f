//! Local stand-ins for engine objects living in the client.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use crate::error::{BridgeError, Result};
use crate::protocol::{AttributeInfo, GeometryKind, Handle, HandleId};

use super::connection::{self, SessionRef};
use super::value::Value;

pub(crate) struct ProxyInner {
    session: SessionRef,
    handle: Handle,
    is_root: bool,
    attributes: OnceLock<Vec<AttributeInfo>>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if self.is_root {
            return;
        }
        connection::lock(&self.session).release(self.handle.id);
    }
}

/// A reference-counted proxy for one remote engine object.
///
/// Clones share the remote entry. When the last clone of a non-root proxy
/// goes away the client is told to forget the object; the root proxy never
/// sends that.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

/// Result of looking up a member by name.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    /// A callable member, bound to its receiver.
    Method(BoundMethod),
    /// The current value of a plain attribute.
    Value(Value),
}

impl Attribute {
    /// Call a method, or return the value for a plain attribute if no
    /// arguments are given.
    pub fn call(&self, args: Vec<Value>) -> Result<Value> {
        match self {
            Attribute::Method(method) => method.call(args),
            Attribute::Value(value) if args.is_empty() => Ok(value.clone()),
            Attribute::Value(_) => Err(BridgeError::TypeMismatch(
                "attribute is not callable".to_string(),
            )),
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Attribute::Value(v) => Some(v),
            Attribute::Method(_) => None,
        }
    }
}

/// A method name bound to the proxy it will be called on.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundMethod {
    receiver: Proxy,
    name: String,
}

impl BoundMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn receiver(&self) -> &Proxy {
        &self.receiver
    }

    pub fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.receiver.invoke(&self.name, args)
    }
}

impl Proxy {
    pub(crate) fn new(session: SessionRef, handle: Handle, is_root: bool) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                session,
                handle,
                is_root,
                attributes: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ProxyInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn belongs_to(&self, session: &SessionRef) -> bool {
        Arc::ptr_eq(&self.inner.session, session)
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn id(&self) -> HandleId {
        self.inner.handle.id
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_root
    }

    pub fn connection_alive(&self) -> bool {
        connection::lock(&self.inner.session).is_alive()
    }

    /// Look up a member by name.
    ///
    /// The member listing is fetched once per proxy. Plain attributes are
    /// read immediately; callables come back bound. A name the listing does
    /// not know is still returned as a method and left for the engine to
    /// reject.
    pub fn get(&self, name: &str) -> Result<Attribute> {
        let callable = self
            .attribute_list()?
            .iter()
            .find(|attr| attr.name == name)
            .is_none_or(|attr| attr.callable);

        if callable {
            Ok(Attribute::Method(BoundMethod {
                receiver: self.clone(),
                name: name.to_string(),
            }))
        } else {
            self.attribute_value(name).map(Attribute::Value)
        }
    }

    /// Call method `name` with `args`, skipping introspection.
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        connection::call(&self.inner.session, self.id(), name, &args, false)
    }

    /// Like `invoke`, but a closed transport is an error rather than `None`.
    pub fn try_invoke(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        connection::call(&self.inner.session, self.id(), name, &args, true)
    }

    /// Read plain attribute `name`, skipping introspection.
    pub fn attribute_value(&self, name: &str) -> Result<Value> {
        self.invoke(name, Vec::new())
    }

    pub fn is_instance(&self, kind: GeometryKind) -> Result<bool> {
        connection::is_instance(&self.inner.session, self.id(), kind)
    }

    /// Probe which geometry kind this object is.
    pub fn geometry_kind(&self) -> Result<GeometryKind> {
        for kind in GeometryKind::ALL {
            if self.is_instance(kind)? {
                return Ok(kind);
            }
        }
        Err(BridgeError::TypeMismatch(format!(
            "{} is not a geometry entity",
            self
        )))
    }

    /// Names of callable members.
    pub fn methods(&self) -> Result<Vec<String>> {
        self.names_where(true)
    }

    /// Names of plain attributes.
    pub fn attributes(&self) -> Result<Vec<String>> {
        self.names_where(false)
    }

    /// Release this clone now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }

    fn names_where(&self, callable: bool) -> Result<Vec<String>> {
        Ok(self
            .attribute_list()?
            .iter()
            .filter(|attr| attr.callable == callable)
            .map(|attr| attr.name.clone())
            .collect())
    }

    fn attribute_list(&self) -> Result<&[AttributeInfo]> {
        if let Some(list) = self.inner.attributes.get() {
            return Ok(list);
        }
        let list = connection::list_attributes(&self.inner.session, self.id())?;
        // A concurrent fetch may have won; either listing is the same.
        Ok(self.inner.attributes.get_or_init(|| list))
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.handle.display)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.inner.handle.id)
            .field("display", &self.inner.handle.display)
            .field("is_root", &self.inner.is_root)
            .finish()
    }
}
