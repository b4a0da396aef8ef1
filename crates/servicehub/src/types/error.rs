//! Service hub error types

use super::{ServiceAudience, ServiceMoniker};
use hubrpc::RpcError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for service hub operations
pub type Result<T> = std::result::Result<T, ServiceHubError>;

/// Service hub errors
#[derive(Error, Debug)]
pub enum ServiceHubError {
    /// Underlying RPC error
    #[error("RPC error: {0}")]
    Rpc(#[source] RpcError),

    /// Proffering a service nobody registered
    #[error("service not registered: {0}")]
    NotRegistered(ServiceMoniker),

    /// Same moniker and audience registered twice
    #[error("service already registered: {0} for audience {1:?}")]
    AlreadyRegistered(ServiceMoniker, ServiceAudience),

    /// Peer capabilities are incompatible with the relay
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Unknown or already connected channel request
    #[error("nothing to cancel for request {0}")]
    NothingToCancel(Uuid),

    /// Malformed connection info, unknown handle, or similar
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Activation callback failed; shared by every waiter of that activation
    #[error("activation of {moniker} failed: {message}")]
    ActivationFailed { moniker: String, message: String },

    #[error("operation canceled")]
    Canceled,

    #[error("object disposed: {0}")]
    ObjectDisposed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// JSON-RPC error codes carrying service hub errors across a connection
pub mod codes {
    pub const HANDSHAKE_REJECTED: i64 = -32010;
    pub const NOTHING_TO_CANCEL: i64 = -32011;
    pub const PROTOCOL_VIOLATION: i64 = -32012;
    pub const ACTIVATION_FAILED: i64 = -32013;
}

impl From<RpcError> for ServiceHubError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Canceled => ServiceHubError::Canceled,
            RpcError::ObjectDisposed(what) => ServiceHubError::ObjectDisposed(what),
            RpcError::Marshaling(msg) => ServiceHubError::Protocol(msg),
            RpcError::Remote {
                code,
                message,
                data,
            } => match code {
                codes::HANDSHAKE_REJECTED => ServiceHubError::HandshakeRejected(message),
                codes::NOTHING_TO_CANCEL => data
                    .as_ref()
                    .and_then(|d| d.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .map(ServiceHubError::NothingToCancel)
                    .unwrap_or(ServiceHubError::Protocol(message)),
                codes::PROTOCOL_VIOLATION => ServiceHubError::Protocol(message),
                codes::ACTIVATION_FAILED => ServiceHubError::ActivationFailed {
                    moniker: data
                        .as_ref()
                        .and_then(|d| d.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    message,
                },
                _ => ServiceHubError::Rpc(RpcError::Remote {
                    code,
                    message,
                    data,
                }),
            },
            other => ServiceHubError::Rpc(other),
        }
    }
}

impl From<ServiceHubError> for RpcError {
    fn from(err: ServiceHubError) -> Self {
        let remote = |code: i64, message: String, data: Option<serde_json::Value>| {
            RpcError::Remote {
                code,
                message,
                data,
            }
        };
        match err {
            ServiceHubError::Rpc(e) => e,
            ServiceHubError::Canceled => RpcError::Canceled,
            ServiceHubError::ObjectDisposed(what) => RpcError::ObjectDisposed(what),
            ServiceHubError::HandshakeRejected(msg) => remote(codes::HANDSHAKE_REJECTED, msg, None),
            ServiceHubError::NothingToCancel(id) => remote(
                codes::NOTHING_TO_CANCEL,
                format!("nothing to cancel for request {}", id),
                Some(serde_json::Value::String(id.to_string())),
            ),
            ServiceHubError::Protocol(msg) => remote(codes::PROTOCOL_VIOLATION, msg, None),
            ServiceHubError::ActivationFailed { moniker, message } => remote(
                codes::ACTIVATION_FAILED,
                message,
                Some(serde_json::Value::String(moniker)),
            ),
            other => RpcError::Invocation(other.to_string()),
        }
    }
}
