//! Proxies for objects the peer exported

use super::marshaler::ObjectMarshaler;
use super::record::{invoke_method_name, ReleaseNotification, RELEASE_METHOD};
use async_trait::async_trait;
use hubrpc::{ObjectProxy, RpcConnection, RpcError, RpcValue};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Stand-in for an object living on the other side of a connection
///
/// Holds only weak references to its connection and marshaler; the
/// connection owns the tables this proxy is listed in.
pub struct MarshaledProxy {
    handle: i64,
    connection_id: u64,
    optional_interfaces: Vec<i32>,
    connection: Weak<RpcConnection>,
    marshaler: Weak<ObjectMarshaler>,
    disposed: AtomicBool,
}

impl MarshaledProxy {
    pub(crate) fn new(
        handle: i64,
        optional_interfaces: Vec<i32>,
        connection: &Arc<RpcConnection>,
        marshaler: Weak<ObjectMarshaler>,
    ) -> Self {
        Self {
            handle,
            connection_id: connection.id(),
            optional_interfaces,
            connection: Arc::downgrade(connection),
            marshaler,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> i64 {
        self.handle
    }

    /// Id of the connection this proxy was imported on
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Optional interface codes the remote object advertised
    pub fn optional_interfaces(&self) -> &[i32] {
        &self.optional_interfaces
    }

    pub fn implements(&self, code: i32) -> bool {
        self.optional_interfaces.contains(&code)
    }

    /// Mark disposed without telling the peer
    pub(crate) fn sever(&self) -> bool {
        !self.disposed.swap(true, Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectProxy for MarshaledProxy {
    async fn invoke(&self, method: &str, args: Vec<RpcValue>) -> hubrpc::Result<RpcValue> {
        if self.is_disposed() {
            return Err(RpcError::ObjectDisposed(format!("marshaled object {}", self.handle)));
        }
        let connection = self.connection.upgrade().ok_or(RpcError::ConnectionClosed)?;
        connection
            .invoke(&invoke_method_name(self.handle, method), args)
            .await
    }

    fn dispose(&self) {
        if !self.sever() {
            return;
        }
        if let Some(marshaler) = self.marshaler.upgrade() {
            marshaler.forget_import(self.handle);
        }
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        let release = ReleaseNotification {
            handle: self.handle,
            owned_by_sender: false,
        };
        let sent = RpcValue::from_serialize(&release)
            .and_then(|arg| connection.notify(RELEASE_METHOD, vec![arg]));
        if let Err(e) = sent {
            debug!("Release of marshaled object {} not sent: {}", self.handle, e);
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for MarshaledProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarshaledProxy")
            .field("handle", &self.handle)
            .field("connection_id", &self.connection_id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
