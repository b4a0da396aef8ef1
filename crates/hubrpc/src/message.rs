//! JSON-RPC 2.0 message structures
//!
//! ```text
//! request:       {"jsonrpc":"2.0","id":7,"method":"Add","params":[1,2]}
//! notification:  {"jsonrpc":"2.0","method":"AvailabilityChanged","params":[..]}
//! result:        {"jsonrpc":"2.0","id":7,"result":3}
//! error:         {"jsonrpc":"2.0","id":7,"error":{"code":-32000,"message":".."}}
//! ```

use crate::error::{Result, RpcError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version tag carried by every message
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier
pub type RequestId = u64;

/// Error object of an error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&RpcError> for ErrorObject {
    fn from(err: &RpcError) -> Self {
        match err {
            RpcError::Remote {
                code,
                message,
                data,
            } => Self {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            other => Self {
                code: other.code(),
                message: other.to_string(),
                data: None,
            },
        }
    }
}

impl From<ErrorObject> for RpcError {
    fn from(err: ErrorObject) -> Self {
        RpcError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Decoded JSON-RPC message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Vec<Value>,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
    Result {
        id: RequestId,
        result: Value,
    },
    Error {
        id: Option<RequestId>,
        error: ErrorObject,
    },
}

/// Flat wire shape every message is read through before classification
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawMessage {
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

impl Message {
    /// Encode to a frame payload
    pub fn encode(&self) -> Result<Bytes> {
        let mut raw = RawMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            ..Default::default()
        };
        match self {
            Message::Request { id, method, params } => {
                raw.id = Some(Value::from(*id));
                raw.method = Some(method.clone());
                raw.params = Some(Value::Array(params.clone()));
            }
            Message::Notification { method, params } => {
                raw.method = Some(method.clone());
                raw.params = Some(Value::Array(params.clone()));
            }
            Message::Result { id, result } => {
                raw.id = Some(Value::from(*id));
                // A null result still has to be present on the wire
                raw.result = Some(result.clone());
            }
            Message::Error { id, error } => {
                raw.id = Some(id.map(Value::from).unwrap_or(Value::Null));
                raw.error = Some(error.clone());
            }
        }
        Ok(Bytes::from(serde_json::to_vec(&raw)?))
    }

    /// Decode from a frame payload
    pub fn decode(data: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(data)?;
        let has_result = value.get("result").is_some();
        let raw: RawMessage = serde_json::from_value(value)?;

        if raw.jsonrpc != JSONRPC_VERSION {
            return Err(RpcError::InvalidMessage(format!(
                "unsupported jsonrpc version {:?}",
                raw.jsonrpc
            )));
        }

        let id = match raw.id {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(n.as_u64().ok_or_else(|| {
                RpcError::InvalidMessage(format!("unsupported request id {}", n))
            })?),
            Some(other) => {
                return Err(RpcError::InvalidMessage(format!(
                    "unsupported request id {}",
                    other
                )))
            }
        };

        if let Some(method) = raw.method {
            let params = match raw.params {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items,
                Some(single) => vec![single],
            };
            return Ok(match id {
                Some(id) => Message::Request { id, method, params },
                None => Message::Notification { method, params },
            });
        }

        if let Some(error) = raw.error {
            return Ok(Message::Error { id, error });
        }

        match id {
            Some(id) if has_result => Ok(Message::Result {
                id,
                result: raw.result.unwrap_or(Value::Null),
            }),
            _ => Err(RpcError::InvalidMessage(
                "message is neither a request, a notification nor a response".to_string(),
            )),
        }
    }
}
