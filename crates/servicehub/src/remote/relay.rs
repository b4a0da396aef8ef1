//! Remote broker relay
//!
//! Serves a local broker to another process. Each granted request reserves
//! either a single-client named pipe or a channel on a multiplexing stream;
//! once the client connects, bytes are spliced between it and the local
//! service pipe.

use super::protocol::RemoteServiceBroker;
use crate::broker::{BrokeredServicesChanged, ServiceBroker};
use crate::types::{
    ClientCapabilities, RemoteServiceConnectionInfo, Result, ServiceActivationOptions,
    ServiceBrokerClientMetadata, ServiceHubError, ServiceMoniker,
};
use async_trait::async_trait;
use hubrpc::{unique_pipe_name, DuplexPipe, MultiplexingStream, PipeServer, PipeServerOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Relay configuration
#[derive(Clone, Default)]
pub struct RelayOptions {
    /// Deliver services as channels on this stream instead of named pipes
    pub multiplexing_stream: Option<MultiplexingStream>,
    /// Close the multiplexing stream when the relay is disposed
    pub owns_transport: bool,
    /// Options for the per-request pipe servers
    pub pipe_options: Option<PipeServerOptions>,
}

impl RelayOptions {
    /// Relay over a multiplexing stream
    pub fn multiplexed(stream: MultiplexingStream, owns_transport: bool) -> Self {
        Self {
            multiplexing_stream: Some(stream),
            owns_transport,
            pipe_options: None,
        }
    }

    pub fn with_pipe_options(mut self, options: PipeServerOptions) -> Self {
        self.pipe_options = Some(options);
        self
    }
}

impl std::fmt::Debug for RelayOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayOptions")
            .field("multiplexed", &self.multiplexing_stream.is_some())
            .field("owns_transport", &self.owns_transport)
            .finish()
    }
}

enum Reservation {
    Pipe(Arc<PipeServer>),
    Channel(u64),
}

/// A granted request the client has not connected to yet
struct PendingRequest {
    moniker: ServiceMoniker,
    service: DuplexPipe,
    reservation: Reservation,
}

/// Serves a [`ServiceBroker`] to remote clients
pub struct RemoteServiceBrokerRelay {
    broker: Arc<dyn ServiceBroker>,
    options: RelayOptions,
    self_ref: Weak<RemoteServiceBrokerRelay>,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    disposed: AtomicBool,
}

impl RemoteServiceBrokerRelay {
    pub fn new(broker: Arc<dyn ServiceBroker>, options: RelayOptions) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            broker,
            options,
            self_ref: self_ref.clone(),
            pending: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Reservations awaiting a client
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_multiplexed(&self) -> bool {
        self.options.multiplexing_stream.is_some()
    }

    /// Tear down every reservation and an owned multiplexing stream
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<(Uuid, PendingRequest)> = self.pending.lock().drain().collect();
        for (id, request) in pending {
            debug!("Dropping reservation {} for {}", id, request.moniker);
            self.release(request);
        }
        if self.options.owns_transport {
            if let Some(stream) = &self.options.multiplexing_stream {
                stream.close();
            }
        }
        info!("Remote broker relay disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn release(&self, request: PendingRequest) {
        match request.reservation {
            Reservation::Pipe(server) => server.dispose(),
            Reservation::Channel(id) => {
                if let Some(stream) = &self.options.multiplexing_stream {
                    stream.cancel_offer(id);
                }
            }
        }
        // Dropping the service end closes the connection to the service
        drop(request.service);
    }

    /// Record a granted request, unless the relay was disposed meanwhile
    fn insert_pending(&self, request_id: Uuid, request: PendingRequest) -> Result<()> {
        let mut pending = self.pending.lock();
        if self.is_disposed() {
            drop(pending);
            debug!("Relay disposed while reserving {}", request.moniker);
            self.release(request);
            return Err(ServiceHubError::ObjectDisposed("remote broker relay".to_string()));
        }
        pending.insert(request_id, request);
        Ok(())
    }

    /// Claim a reservation for a connecting client
    fn claim(&self, request_id: Uuid) -> Option<PendingRequest> {
        self.pending.lock().remove(&request_id)
    }

    fn reserve_pipe(
        &self,
        request_id: Uuid,
        moniker: &ServiceMoniker,
        service: DuplexPipe,
    ) -> Result<RemoteServiceConnectionInfo> {
        let name = unique_pipe_name();
        let relay = self.self_ref.clone();
        let options = self
            .options
            .pipe_options
            .clone()
            .unwrap_or_else(PipeServerOptions::single_client);

        let server = PipeServer::start(name.clone(), options, move |client: DuplexPipe| {
            let relay = relay.clone();
            async move {
                let Some(relay) = relay.upgrade() else {
                    return;
                };
                match relay.claim(request_id) {
                    Some(request) => splice(request_id, request.moniker, request.service, client),
                    None => debug!("Client connected to withdrawn reservation {}", request_id),
                }
            }
        })?;

        self.insert_pending(
            request_id,
            PendingRequest {
                moniker: moniker.clone(),
                service,
                reservation: Reservation::Pipe(server),
            },
        )?;
        Ok(RemoteServiceConnectionInfo::pipe(request_id, name))
    }

    fn reserve_channel(
        &self,
        stream: &MultiplexingStream,
        request_id: Uuid,
        moniker: &ServiceMoniker,
        service: DuplexPipe,
    ) -> Result<RemoteServiceConnectionInfo> {
        let offer = stream.offer_channel(&request_id.to_string())?;
        let channel_id = offer.id();
        self.insert_pending(
            request_id,
            PendingRequest {
                moniker: moniker.clone(),
                service,
                reservation: Reservation::Channel(channel_id),
            },
        )?;

        let relay = self.self_ref.clone();
        tokio::spawn(async move {
            let outcome = offer.accepted().await;
            let Some(relay) = relay.upgrade() else {
                return;
            };
            match outcome {
                Ok(channel) => match relay.claim(request_id) {
                    Some(request) => {
                        splice(request_id, request.moniker, request.service, channel)
                    }
                    None => debug!("Channel {} accepted after withdrawal", channel_id),
                },
                Err(e) => {
                    if let Some(request) = relay.claim(request_id) {
                        debug!("Channel {} for {} failed: {}", channel_id, request.moniker, e);
                        relay.release(request);
                    }
                }
            }
        });

        Ok(RemoteServiceConnectionInfo::channel(request_id, channel_id))
    }
}

/// Copy bytes both ways until either side closes
fn splice<C>(request_id: Uuid, moniker: ServiceMoniker, mut service: DuplexPipe, mut client: C)
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    debug!("Client connected to {} (request {})", moniker, request_id);
    tokio::spawn(async move {
        match tokio::io::copy_bidirectional(&mut service, &mut client).await {
            Ok((to_client, to_service)) => debug!(
                "Relay for {} finished ({} bytes out, {} bytes in)",
                moniker, to_client, to_service
            ),
            Err(e) => debug!("Relay for {} ended: {}", moniker, e),
        }
    });
}

#[async_trait]
impl RemoteServiceBroker for RemoteServiceBrokerRelay {
    async fn handshake(
        &self,
        client: ServiceBrokerClientMetadata,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let required = if self.is_multiplexed() {
            ClientCapabilities::MULTIPLEXING
        } else {
            ClientCapabilities::IPC_PIPE
        };
        if !client.supported_connections.contains(required) {
            warn!(
                "Rejecting client with capabilities {:#x}",
                client.supported_connections.bits()
            );
            return Err(ServiceHubError::HandshakeRejected(format!(
                "relay requires capability {:#x}, client offers {:#x}",
                required.bits(),
                client.supported_connections.bits()
            )));
        }
        debug!("Handshake accepted");
        Ok(())
    }

    async fn request_service_channel(
        &self,
        moniker: &ServiceMoniker,
        options: ServiceActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<RemoteServiceConnectionInfo> {
        if self.is_disposed() {
            return Err(ServiceHubError::ObjectDisposed("remote broker relay".to_string()));
        }
        let Some(service) = self.broker.get_pipe(moniker, options, cancel).await? else {
            debug!("{} is unavailable", moniker);
            return Ok(RemoteServiceConnectionInfo::empty());
        };

        let request_id = Uuid::new_v4();
        let info = match &self.options.multiplexing_stream {
            Some(stream) => self.reserve_channel(stream, request_id, moniker, service)?,
            None => self.reserve_pipe(request_id, moniker, service)?,
        };
        info!("Reserved {} for request {}", moniker, request_id);
        Ok(info)
    }

    async fn cancel_service_request(&self, request_id: Uuid) -> Result<()> {
        let request = self
            .claim(request_id)
            .ok_or(ServiceHubError::NothingToCancel(request_id))?;
        debug!("Request {} for {} cancelled", request_id, request.moniker);
        self.release(request);
        Ok(())
    }

    fn availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChanged> {
        self.broker.availability_changed()
    }
}

impl std::fmt::Debug for RemoteServiceBrokerRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteServiceBrokerRelay")
            .field("options", &self.options)
            .field("pending", &self.pending_requests())
            .finish()
    }
}
