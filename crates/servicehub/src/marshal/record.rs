//! Marshaled object wire records
//!
//! ```text
//! real object:     {"__jsonrpc_marshaled": 1, "handle": 5, "lifetime": "explicit"}
//! returned proxy:  {"__jsonrpc_marshaled": 0, "handle": 5}
//! release:         {"handle": 5, "ownedBySender": false}
//! ```

use hubrpc::{MarshalLifetime, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key marking a JSON object as a marshaled object record
pub const MARSHALED_KEY: &str = "__jsonrpc_marshaled";

/// Notification releasing a marshaled object
pub const RELEASE_METHOD: &str = "$/releaseMarshaledObject";

/// Method prefix for calls on a marshaled object
pub const INVOKE_PREFIX: &str = "$/invokeProxy/";

/// The sender exports a real object
pub const MARSHALED_REAL_OBJECT: i32 = 1;
/// The sender returns a proxy it received from the receiver
pub const MARSHALED_RETURNED_PROXY: i32 = 0;

/// Wire form of an object passed by reference
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarshaledObjectRecord {
    #[serde(rename = "__jsonrpc_marshaled")]
    pub marshaled: i32,
    pub handle: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<String>,
    #[serde(
        rename = "optionalInterfaces",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub optional_interfaces: Option<Vec<i32>>,
}

impl MarshaledObjectRecord {
    pub fn real_object(
        handle: i64,
        lifetime: MarshalLifetime,
        optional_interfaces: &[i32],
    ) -> Self {
        Self {
            marshaled: MARSHALED_REAL_OBJECT,
            handle,
            lifetime: Some(lifetime.as_str().to_string()),
            optional_interfaces: if optional_interfaces.is_empty() {
                None
            } else {
                Some(optional_interfaces.to_vec())
            },
        }
    }

    pub fn returned_proxy(handle: i64) -> Self {
        Self {
            marshaled: MARSHALED_RETURNED_PROXY,
            handle,
            lifetime: None,
            optional_interfaces: None,
        }
    }

    /// Whether `value` carries a marshaled object record
    pub fn is_record(value: &Value) -> bool {
        value
            .as_object()
            .map(|obj| obj.contains_key(MARSHALED_KEY))
            .unwrap_or(false)
    }

    pub fn from_value(value: Value) -> Result<Self, RpcError> {
        serde_json::from_value(value)
            .map_err(|e| RpcError::Marshaling(format!("malformed marshaled object record: {}", e)))
    }

    pub fn to_value(&self) -> Result<Value, RpcError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Declared lifetime; records without one are explicit
    pub fn lifetime(&self) -> Result<MarshalLifetime, RpcError> {
        match &self.lifetime {
            None => Ok(MarshalLifetime::Explicit),
            Some(s) => MarshalLifetime::parse(s)
                .ok_or_else(|| RpcError::Marshaling(format!("unknown lifetime {:?}", s))),
        }
    }
}

/// Parameters of [`RELEASE_METHOD`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseNotification {
    pub handle: i64,
    /// True when the sender exported the object and is withdrawing it
    pub owned_by_sender: bool,
}

/// Method name under which `method` of object `handle` is exposed
pub fn invoke_method_name(handle: i64, method: &str) -> String {
    format!("{}{}/{}", INVOKE_PREFIX, handle, method)
}

/// The alias registered next to `method`: `Async` added or removed
pub fn async_alias(method: &str) -> String {
    match method.strip_suffix("Async") {
        Some(base) if !base.is_empty() => base.to_string(),
        _ => format!("{}Async", method),
    }
}
