//! Dynamic client proxy over an RPC connection

use crate::connection::RpcConnection;
use crate::error::{Result, RpcError};
use crate::value::{ObjectProxy, RpcValue};
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Forwards every call to the peer of its connection
///
/// The proxy owns the connection: disposing it disposes the connection.
pub struct RpcProxy {
    connection: Arc<RpcConnection>,
    disposed: AtomicBool,
}

impl RpcProxy {
    pub(crate) fn new(connection: Arc<RpcConnection>) -> Self {
        Self {
            connection,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &Arc<RpcConnection> {
        &self.connection
    }

    /// Invoke with a cancellation token
    pub async fn invoke_with_cancellation(
        &self,
        method: &str,
        args: Vec<RpcValue>,
        cancel: &CancellationToken,
    ) -> Result<RpcValue> {
        self.check_disposed()?;
        self.connection
            .invoke_with_cancellation(method, args, cancel)
            .await
    }

    /// Send a notification to the peer
    pub fn notify(&self, method: &str, args: Vec<RpcValue>) -> Result<()> {
        self.check_disposed()?;
        self.connection.notify(method, args)
    }

    fn check_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(RpcError::ObjectDisposed(format!(
                "proxy over {}#{}",
                self.connection.name(),
                self.connection.id()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectProxy for RpcProxy {
    async fn invoke(&self, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
        self.check_disposed()?;
        self.connection.invoke(method, args).await
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.connection.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst) || self.connection.is_closed()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for RpcProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProxy")
            .field("connection", &self.connection)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}
