//! Remote channel request results

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How to reach a service a remote broker agreed to provide
///
/// At most one of `pipe_name` and `multiplexing_channel_id` is set. All
/// fields absent means the service is unavailable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteServiceConnectionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplexing_channel_id: Option<u64>,
}

impl RemoteServiceConnectionInfo {
    /// The "service unavailable" answer
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.request_id.is_none()
            && self.pipe_name.is_none()
            && self.multiplexing_channel_id.is_none()
    }

    pub fn pipe(request_id: Uuid, pipe_name: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id),
            pipe_name: Some(pipe_name.into()),
            multiplexing_channel_id: None,
        }
    }

    pub fn channel(request_id: Uuid, channel_id: u64) -> Self {
        Self {
            request_id: Some(request_id),
            pipe_name: None,
            multiplexing_channel_id: Some(channel_id),
        }
    }
}
