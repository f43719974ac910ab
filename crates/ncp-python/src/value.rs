//! Host-side value model exchanged with the interpreter.

use crate::buffer::HostBuffer;
use crate::handles::{Handle, ModuleHandle, ObjectHandle};
use futures::channel::oneshot;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// A value on the host side of the bridge.
///
/// `Undefined` and `Null` are distinct absent states and stay distinct across a
/// round trip. `Tuple` only appears on the return path; host code passes
/// sequences as `Array`.
#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<HostValue>),
    Object(IndexMap<String, HostValue>),
    Tuple(Vec<HostValue>),
    Buffer(HostBuffer),
    /// A host function passed by reference
    Function(HostFunctionRef),
    /// An interpreter object previously issued to the host
    Handle(Handle),
    /// A host value the binding layer could not classify (the name of its type)
    Unsupported(String),
}

impl HostValue {
    /// Short name of the variant, used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Int(_) => "integer",
            HostValue::Float(_) => "float",
            HostValue::String(_) => "string",
            HostValue::Array(_) => "array",
            HostValue::Object(_) => "object",
            HostValue::Tuple(_) => "tuple",
            HostValue::Buffer(_) => "buffer",
            HostValue::Function(_) => "function",
            HostValue::Handle(_) => "handle",
            HostValue::Unsupported(_) => "unsupported",
        }
    }

    /// Build an `Object` from key/value pairs
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, HostValue)>,
    {
        HostValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Int(i) => Some(*i as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Elements of an `Array` or `Tuple`
    pub fn as_slice(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::Array(items) | HostValue::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&HostBuffer> {
        match self {
            HostValue::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        HostValue::Int(i64::from(value))
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        HostValue::Int(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Float(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(value: Vec<HostValue>) -> Self {
        HostValue::Array(value)
    }
}

impl From<HostBuffer> for HostValue {
    fn from(value: HostBuffer) -> Self {
        HostValue::Buffer(value)
    }
}

impl From<HostFunctionRef> for HostValue {
    fn from(value: HostFunctionRef) -> Self {
        HostValue::Function(value)
    }
}

impl From<Handle> for HostValue {
    fn from(value: Handle) -> Self {
        HostValue::Handle(value)
    }
}

impl From<ModuleHandle> for HostValue {
    fn from(value: ModuleHandle) -> Self {
        HostValue::Handle(value.into())
    }
}

impl From<ObjectHandle> for HostValue {
    fn from(value: ObjectHandle) -> Self {
        HostValue::Handle(value.into())
    }
}

/// JSON maps onto the data subset of the host model; `null` is `Null`.
impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => HostValue::Int(i),
                None => HostValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => HostValue::String(s),
            serde_json::Value::Array(items) => {
                HostValue::Array(items.into_iter().map(HostValue::from).collect())
            }
            serde_json::Value::Object(map) => {
                HostValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Outcome of a host callback: a value, or a rejection message
pub type CallbackResult = Result<HostValue, String>;

/// What a host function hands back to the interpreter
pub enum HostReply {
    /// The answer is available now
    Ready(CallbackResult),
    /// The answer settles later; only honoured in promise-bridging mode
    Deferred(Deferred),
}

impl HostReply {
    pub fn value(value: impl Into<HostValue>) -> Self {
        HostReply::Ready(Ok(value.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        HostReply::Ready(Err(message.into()))
    }
}

/// Receiving half of a deferred host value
pub struct Deferred {
    receiver: oneshot::Receiver<CallbackResult>,
}

/// Settling half of a deferred host value
pub struct Resolver {
    sender: oneshot::Sender<CallbackResult>,
}

/// Create a linked resolver/deferred pair
pub fn deferred() -> (Resolver, Deferred) {
    let (sender, receiver) = oneshot::channel();
    (Resolver { sender }, Deferred { receiver })
}

impl Resolver {
    pub fn resolve(self, value: impl Into<HostValue>) {
        let _ = self.sender.send(Ok(value.into()));
    }

    pub fn reject(self, message: impl Into<String>) {
        let _ = self.sender.send(Err(message.into()));
    }
}

impl Deferred {
    /// Block the current thread until the value settles
    pub(crate) fn wait(self) -> CallbackResult {
        futures::executor::block_on(self.receiver)
            .unwrap_or_else(|_| Err("Deferred value was dropped before it settled".to_string()))
    }
}

/// A function living on the host side that interpreter code may call
pub trait HostFunction: Send + Sync {
    fn call(&self, args: Vec<HostValue>) -> HostReply;
}

impl<F> HostFunction for F
where
    F: Fn(Vec<HostValue>) -> HostReply + Send + Sync,
{
    fn call(&self, args: Vec<HostValue>) -> HostReply {
        self(args)
    }
}

/// Shared reference to a host function; equality is identity
#[derive(Clone)]
pub struct HostFunctionRef(Arc<dyn HostFunction>);

impl HostFunctionRef {
    pub fn new(function: impl HostFunction + 'static) -> Self {
        Self(Arc::new(function))
    }

    /// Wrap a plain function that always answers immediately
    pub fn from_fn<F>(function: F) -> Self
    where
        F: Fn(Vec<HostValue>) -> CallbackResult + Send + Sync + 'static,
    {
        Self::new(move |args: Vec<HostValue>| HostReply::Ready(function(args)))
    }

    pub fn call(&self, args: Vec<HostValue>) -> HostReply {
        self.0.call(args)
    }
}

impl PartialEq for HostFunctionRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0).cast::<()>() == Arc::as_ptr(&other.0).cast::<()>()
    }
}

impl fmt::Debug for HostFunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunctionRef({:p})", Arc::as_ptr(&self.0).cast::<()>())
    }
}
