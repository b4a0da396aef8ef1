//! Remote broker client
//!
//! Turns a [`RemoteServiceBroker`] back into a local [`ServiceBroker`]:
//! requests a reservation, connects to the pipe or channel it describes,
//! and builds an RPC connection over it.

use super::protocol::RemoteServiceBroker;
use crate::broker::{BrokeredServicesChanged, ServiceBroker, ServiceProxy};
use crate::types::{
    ClientCapabilities, ClientRpcTarget, RemoteServiceConnectionInfo, Result,
    ServiceActivationOptions, ServiceBrokerClientMetadata, ServiceHubError, ServiceMoniker,
    ServiceRpcDescriptor,
};
use async_trait::async_trait;
use hubrpc::{boxed, connect_pipe, DuplexPipe, MultiplexingStream};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Supplies credentials for requests that carry none
#[async_trait]
pub trait AuthorizationServiceClient: Send + Sync {
    async fn get_credentials(&self, cancel: &CancellationToken) -> Result<HashMap<String, String>>;
}

/// Local broker backed by a remote one
pub struct RemoteServiceBrokerClient {
    remote: Arc<dyn RemoteServiceBroker>,
    transport: Option<MultiplexingStream>,
    authorization: RwLock<Option<Arc<dyn AuthorizationServiceClient>>>,
}

impl RemoteServiceBrokerClient {
    /// Handshake with `remote` and wrap it
    ///
    /// Advertises named pipes, plus multiplexed channels when a transport is
    /// given.
    pub async fn connect(
        remote: Arc<dyn RemoteServiceBroker>,
        transport: Option<MultiplexingStream>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let mut capabilities = ClientCapabilities::IPC_PIPE;
        if transport.is_some() {
            capabilities |= ClientCapabilities::MULTIPLEXING;
        }
        remote
            .handshake(
                ServiceBrokerClientMetadata {
                    supported_connections: capabilities,
                },
                cancel,
            )
            .await?;
        info!(
            "Connected to remote broker (capabilities {:#x})",
            capabilities.bits()
        );

        Ok(Arc::new(Self {
            remote,
            transport,
            authorization: RwLock::new(None),
        }))
    }

    /// Fill credentials of requests that carry none from `client`
    pub fn set_authorization_client(&self, client: Arc<dyn AuthorizationServiceClient>) {
        *self.authorization.write() = Some(client);
    }

    pub fn remote(&self) -> &Arc<dyn RemoteServiceBroker> {
        &self.remote
    }

    async fn prepare(
        &self,
        mut options: ServiceActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<ServiceActivationOptions> {
        if !options.client_credentials.is_empty() {
            return Ok(options);
        }
        let authorization = self.authorization.read().clone();
        if let Some(authorization) = authorization {
            options.client_credentials = authorization.get_credentials(cancel).await?;
        }
        Ok(options)
    }

    /// Reserve and connect a pipe to the service
    async fn request_pipe(
        &self,
        moniker: &ServiceMoniker,
        options: ServiceActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<DuplexPipe>> {
        let options = self.prepare(options, cancel).await?;
        let info = self
            .remote
            .request_service_channel(moniker, options, cancel)
            .await?;
        if info.is_empty() {
            debug!("Remote broker has no {}", moniker);
            return Ok(None);
        }
        let Some(request_id) = info.request_id else {
            return Err(ServiceHubError::Protocol(format!(
                "connection info for {} carries no request id",
                moniker
            )));
        };

        match self.open(&info, cancel).await {
            Ok(pipe) => {
                debug!("Connected to {} (request {})", moniker, request_id);
                Ok(Some(pipe))
            }
            Err(e) => {
                self.abandon(request_id).await;
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        info: &RemoteServiceConnectionInfo,
        cancel: &CancellationToken,
    ) -> Result<DuplexPipe> {
        match (&info.pipe_name, info.multiplexing_channel_id) {
            (None, Some(channel_id)) => {
                let stream = self.transport.as_ref().ok_or_else(|| {
                    ServiceHubError::Protocol(format!(
                        "channel {} offered without a multiplexing stream",
                        channel_id
                    ))
                })?;
                let channel = stream.accept_channel(channel_id, cancel).await?;
                Ok(boxed(channel))
            }
            (Some(pipe_name), None) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ServiceHubError::Canceled),
                    pipe = connect_pipe(pipe_name) => Ok(pipe?),
                }
            }
            (Some(_), Some(_)) => Err(ServiceHubError::Protocol(
                "connection info names both a pipe and a channel".to_string(),
            )),
            (None, None) => Err(ServiceHubError::Protocol(
                "connection info names neither a pipe nor a channel".to_string(),
            )),
        }
    }

    /// Best-effort withdrawal of a reservation we will not use
    async fn abandon(&self, request_id: Uuid) {
        if let Err(e) = self.remote.cancel_service_request(request_id).await {
            warn!("Could not cancel service request {}: {}", request_id, e);
        }
    }
}

#[async_trait]
impl ServiceBroker for RemoteServiceBrokerClient {
    async fn get_proxy(
        &self,
        descriptor: &ServiceRpcDescriptor,
        mut options: ServiceActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<ServiceProxy>>> {
        let client_target = options.client_rpc_target.take();
        let Some(pipe) = self
            .request_pipe(&descriptor.moniker, options, cancel)
            .await?
        else {
            return Ok(None);
        };

        let connection = descriptor.construct_connection(pipe);
        match client_target {
            Some(ClientRpcTarget::Local(target)) => connection.add_local_target(&target),
            Some(ClientRpcTarget::Remote(_)) => {
                debug!("Ignoring proxied client target for {}", descriptor.moniker)
            }
            None => {}
        }
        connection.start_listening();

        Ok(Some(Arc::new(ServiceProxy::remote(
            descriptor.moniker.clone(),
            connection.build_client_proxy(),
        ))))
    }

    async fn get_pipe(
        &self,
        moniker: &ServiceMoniker,
        options: ServiceActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<DuplexPipe>> {
        self.request_pipe(moniker, options, cancel).await
    }

    fn availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChanged> {
        self.remote.availability_changed()
    }
}

impl std::fmt::Debug for RemoteServiceBrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteServiceBrokerClient")
            .field("multiplexed", &self.transport.is_some())
            .finish()
    }
}
