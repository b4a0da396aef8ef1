//! Per-request activation options

use hubrpc::{LocalTarget, ObjectProxy, RpcValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Object a client exposes so its service can call back into it
#[derive(Clone)]
pub enum ClientRpcTarget {
    /// Client side: the object to expose
    Local(Arc<LocalTarget>),
    /// Service side: proxy to the object the client exposed
    Remote(Arc<dyn ObjectProxy>),
}

impl ClientRpcTarget {
    /// Call back into the client
    pub async fn invoke(&self, method: &str, args: Vec<RpcValue>) -> hubrpc::Result<RpcValue> {
        match self {
            ClientRpcTarget::Local(target) => target.invoke(method, args).await,
            ClientRpcTarget::Remote(proxy) => proxy.invoke(method, args).await,
        }
    }
}

impl fmt::Debug for ClientRpcTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientRpcTarget::Local(target) => write!(f, "Local({})", target.name()),
            ClientRpcTarget::Remote(proxy) => {
                write!(f, "Remote(disposed={})", proxy.is_disposed())
            }
        }
    }
}

/// Options travelling with every service request
///
/// Only the plain-data fields cross the wire; the client RPC target is local
/// to one side.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceActivationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_culture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ui_culture: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub client_credentials: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub activation_arguments: HashMap<String, String>,
    #[serde(skip)]
    pub client_rpc_target: Option<ClientRpcTarget>,
}

impl ServiceActivationOptions {
    pub fn with_credentials(mut self, credentials: HashMap<String, String>) -> Self {
        self.client_credentials = credentials;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.activation_arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_client_rpc_target(mut self, target: Arc<LocalTarget>) -> Self {
        self.client_rpc_target = Some(ClientRpcTarget::Local(target));
        self
    }
}
