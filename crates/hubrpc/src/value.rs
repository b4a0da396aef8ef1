//! Values carried through RPC calls
//!
//! Arguments and return values are either plain JSON data or live object
//! references. Object references only travel over a connection that has a
//! [`ValueMarshaler`](crate::ValueMarshaler) installed.

use crate::error::{Result, RpcError};
use crate::target::LocalTarget;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// How long a marshaled object stays reachable by the receiver
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MarshalLifetime {
    /// Only valid for the duration of the call it was passed in
    Call,
    /// Valid until either side explicitly releases it
    Explicit,
}

impl MarshalLifetime {
    /// Wire spelling of this lifetime
    pub fn as_str(&self) -> &'static str {
        match self {
            MarshalLifetime::Call => "call",
            MarshalLifetime::Explicit => "explicit",
        }
    }

    /// Parse the wire spelling
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "call" => Some(MarshalLifetime::Call),
            "explicit" => Some(MarshalLifetime::Explicit),
            _ => None,
        }
    }
}

/// A local object passed by reference rather than by value
#[derive(Clone)]
pub struct MarshalableTarget {
    pub target: Arc<LocalTarget>,
    pub lifetime: MarshalLifetime,
    pub optional_interfaces: Vec<i32>,
}

impl MarshalableTarget {
    /// Marshal `target` with an explicit lifetime
    pub fn explicit(target: Arc<LocalTarget>) -> Self {
        Self {
            target,
            lifetime: MarshalLifetime::Explicit,
            optional_interfaces: Vec::new(),
        }
    }

    /// Marshal `target` for a single call
    pub fn call_scoped(target: Arc<LocalTarget>) -> Self {
        Self {
            target,
            lifetime: MarshalLifetime::Call,
            optional_interfaces: Vec::new(),
        }
    }

    /// Advertise optional interface codes the object implements
    pub fn with_optional_interfaces(mut self, codes: Vec<i32>) -> Self {
        self.optional_interfaces = codes;
        self
    }
}

/// A proxy forwarding every member call to a single dispatcher
#[async_trait]
pub trait ObjectProxy: Send + Sync + 'static {
    /// Invoke `method` on the object behind this proxy
    async fn invoke(&self, method: &str, args: Vec<RpcValue>) -> Result<RpcValue>;

    /// Release the proxy; later calls fail with `ObjectDisposed`
    fn dispose(&self);

    /// Whether [`dispose`](ObjectProxy::dispose) has run
    fn is_disposed(&self) -> bool;

    /// Cast to Any for downcasting
    fn as_any(&self) -> &dyn Any;
}

/// Typed convenience calls for any [`ObjectProxy`]
#[async_trait]
pub trait ObjectProxyExt: ObjectProxy {
    /// Invoke with JSON arguments and deserialize the JSON result
    async fn call<T>(&self, method: &str, args: Vec<Value>) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let args = args.into_iter().map(RpcValue::Json).collect();
        self.invoke(method, args).await?.deserialize()
    }
}

impl<P: ObjectProxy + ?Sized> ObjectProxyExt for P {}

/// An argument or return value
#[derive(Clone)]
pub enum RpcValue {
    /// Plain data, serialized by value
    Json(Value),
    /// Local object to be exported by reference
    Target(MarshalableTarget),
    /// Proxy to an object living elsewhere
    Proxy(Arc<dyn ObjectProxy>),
}

impl RpcValue {
    /// The JSON `null` value
    pub fn null() -> Self {
        RpcValue::Json(Value::Null)
    }

    /// Serialize any value into plain data
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(RpcValue::Json(serde_json::to_value(value)?))
    }

    /// Borrow the JSON data, if this is plain data
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            RpcValue::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Take the JSON data, failing for object references
    pub fn into_json(self) -> Result<Value> {
        match self {
            RpcValue::Json(v) => Ok(v),
            other => Err(RpcError::InvalidParams(format!(
                "expected plain data, got {:?}",
                other
            ))),
        }
    }

    /// Deserialize plain data into `T`
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T> {
        let value = self.into_json()?;
        serde_json::from_value(value).map_err(|e| RpcError::InvalidParams(e.to_string()))
    }

    /// Borrow the local object, if this is one
    pub fn as_target(&self) -> Option<&MarshalableTarget> {
        match self {
            RpcValue::Target(t) => Some(t),
            _ => None,
        }
    }

    /// Borrow the proxy, if this is one
    pub fn as_proxy(&self) -> Option<&Arc<dyn ObjectProxy>> {
        match self {
            RpcValue::Proxy(p) => Some(p),
            _ => None,
        }
    }
}

impl From<Value> for RpcValue {
    fn from(value: Value) -> Self {
        RpcValue::Json(value)
    }
}

impl From<MarshalableTarget> for RpcValue {
    fn from(target: MarshalableTarget) -> Self {
        RpcValue::Target(target)
    }
}

impl From<Arc<dyn ObjectProxy>> for RpcValue {
    fn from(proxy: Arc<dyn ObjectProxy>) -> Self {
        RpcValue::Proxy(proxy)
    }
}

impl fmt::Debug for RpcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcValue::Json(v) => write!(f, "Json({})", v),
            RpcValue::Target(t) => write!(
                f,
                "Target({}, {})",
                t.target.name(),
                t.lifetime.as_str()
            ),
            RpcValue::Proxy(p) => write!(f, "Proxy(disposed={})", p.is_disposed()),
        }
    }
}

/// Take positional argument `index`, treating missing arguments as `null`
pub fn arg(args: &[RpcValue], index: usize) -> RpcValue {
    args.get(index).cloned().unwrap_or_else(RpcValue::null)
}
