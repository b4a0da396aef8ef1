//! Error types for hubrpc

use thiserror::Error;

/// JSON-RPC error code for an unknown method
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code for malformed parameters
pub const INVALID_PARAMS: i64 = -32602;
/// Error code used when a local handler fails
pub const INVOCATION_ERROR: i64 = -32000;

/// RPC error types
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("invocation failed: {0}")]
    Invocation(String),

    #[error("object disposed: {0}")]
    ObjectDisposed(String),

    #[error("value cannot be marshaled: {0}")]
    NotMarshalable(String),

    #[error("marshaling protocol violation: {0}")]
    Marshaling(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation canceled")]
    Canceled,

    #[error("channel {0} rejected")]
    ChannelRejected(u64),

    #[error("multiplexing protocol violation: {0}")]
    Multiplexing(String),

    #[error("pipe listener failed: {0}")]
    Listener(String),

    #[error("task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

impl RpcError {
    /// JSON-RPC error code used when this error is reported to a peer
    pub fn code(&self) -> i64 {
        match self {
            RpcError::MethodNotFound(_) => METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) => INVALID_PARAMS,
            RpcError::Remote { code, .. } => *code,
            _ => INVOCATION_ERROR,
        }
    }

    /// Whether this error means the connection is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, RpcError::ConnectionClosed | RpcError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
