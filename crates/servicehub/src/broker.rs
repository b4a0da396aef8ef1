//! Service broker abstraction
//!
//! A broker turns a moniker into either a proxy or a raw pipe. Local views,
//! remote broker clients and relays all speak this interface.

use crate::types::{Result, ServiceActivationOptions, ServiceMoniker, ServiceRpcDescriptor};
use async_trait::async_trait;
use hubrpc::{DuplexPipe, LocalTarget, ObjectProxy, RpcError, RpcProxy, RpcValue};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Capacity of availability event channels
pub const AVAILABILITY_CHANNEL_CAPACITY: usize = 64;

/// Services whose availability may have changed
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokeredServicesChanged {
    pub impacted_services: Vec<ServiceMoniker>,
    /// Services other than the listed ones may be affected too
    #[serde(default)]
    pub other_services_impacted: bool,
}

impl BrokeredServicesChanged {
    pub fn for_monikers(monikers: Vec<ServiceMoniker>) -> Self {
        Self {
            impacted_services: monikers,
            other_services_impacted: false,
        }
    }
}

/// Locates services and connects to them
#[async_trait]
pub trait ServiceBroker: Send + Sync {
    /// Get a proxy to the service, or `None` when it is unavailable
    async fn get_proxy(
        &self,
        descriptor: &ServiceRpcDescriptor,
        options: ServiceActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<ServiceProxy>>>;

    /// Get a pipe with the service bound to its other end, or `None` when it
    /// is unavailable
    async fn get_pipe(
        &self,
        moniker: &ServiceMoniker,
        options: ServiceActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<DuplexPipe>>;

    /// Subscribe to availability changes
    fn availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChanged>;
}

enum ProxyBackend {
    /// Direct dispatch to a service instance in this process
    Local(Arc<LocalTarget>),
    /// Calls over an RPC connection owned by the proxy
    Remote(Arc<RpcProxy>),
}

/// Disposable proxy to a brokered service
///
/// Disposal is idempotent; once disposed, every call fails with
/// `ObjectDisposed` instead of reaching the service.
pub struct ServiceProxy {
    moniker: ServiceMoniker,
    backend: ProxyBackend,
    disposed: AtomicBool,
}

impl ServiceProxy {
    /// Proxy dispatching straight to `instance`
    pub fn local(moniker: ServiceMoniker, instance: Arc<LocalTarget>) -> Self {
        Self {
            moniker,
            backend: ProxyBackend::Local(instance),
            disposed: AtomicBool::new(false),
        }
    }

    /// Proxy over an RPC connection
    pub fn remote(moniker: ServiceMoniker, proxy: Arc<RpcProxy>) -> Self {
        Self {
            moniker,
            backend: ProxyBackend::Remote(proxy),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn moniker(&self) -> &ServiceMoniker {
        &self.moniker
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, ProxyBackend::Local(_))
    }

    /// The RPC proxy behind a remote service proxy
    pub fn rpc_proxy(&self) -> Option<&Arc<RpcProxy>> {
        match &self.backend {
            ProxyBackend::Remote(proxy) => Some(proxy),
            ProxyBackend::Local(_) => None,
        }
    }
}

#[async_trait]
impl ObjectProxy for ServiceProxy {
    async fn invoke(&self, method: &str, args: Vec<RpcValue>) -> hubrpc::Result<RpcValue> {
        if self.is_disposed() {
            return Err(RpcError::ObjectDisposed(self.moniker.to_string()));
        }
        match &self.backend {
            ProxyBackend::Local(instance) => instance.invoke(method, args).await,
            ProxyBackend::Remote(proxy) => proxy.invoke(method, args).await,
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.backend {
            ProxyBackend::Local(instance) => instance.dispose(),
            ProxyBackend::Remote(proxy) => proxy.dispose(),
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("moniker", &self.moniker)
            .field("local", &self.is_local())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Typed client built on top of a service proxy
pub trait FromProxy: Sized {
    fn from_proxy(proxy: Arc<ServiceProxy>) -> Self;
}

/// Typed convenience calls for any [`ServiceBroker`]
#[async_trait]
pub trait ServiceBrokerExt: ServiceBroker {
    /// Get a proxy wrapped in the typed client `T`
    async fn get_typed_proxy<T>(
        &self,
        descriptor: &ServiceRpcDescriptor,
        options: ServiceActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<T>>
    where
        T: FromProxy + Send,
    {
        Ok(self
            .get_proxy(descriptor, options, cancel)
            .await?
            .map(T::from_proxy))
    }
}

impl<B: ServiceBroker + ?Sized> ServiceBrokerExt for B {}
