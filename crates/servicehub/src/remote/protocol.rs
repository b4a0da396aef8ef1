//! Remote service broker protocol
//!
//! The contract between a broker client and a relay, plus the adapter that
//! carries it over an RPC connection.

use crate::broker::{BrokeredServicesChanged, AVAILABILITY_CHANNEL_CAPACITY};
use crate::types::{
    RemoteServiceConnectionInfo, Result, ServiceActivationOptions, ServiceBrokerClientMetadata,
    ServiceMoniker,
};
use async_trait::async_trait;
use hubrpc::{arg, handler, ConnectionOptions, DuplexPipe, RpcConnection, RpcValue};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Method names on the wire
pub mod methods {
    pub const HANDSHAKE: &str = "HandshakeAsync";
    pub const REQUEST_SERVICE_CHANNEL: &str = "RequestServiceChannelAsync";
    pub const CANCEL_SERVICE_REQUEST: &str = "CancelServiceRequestAsync";
    pub const AVAILABILITY_CHANGED: &str = "AvailabilityChanged";
}

/// A broker reached over an out-of-process boundary
///
/// Services are not handed out directly; the remote side reserves a pipe or
/// a multiplexed channel and describes it in a
/// [`RemoteServiceConnectionInfo`] for the client to connect to.
#[async_trait]
pub trait RemoteServiceBroker: Send + Sync {
    /// Agree on the ways services can be delivered
    async fn handshake(
        &self,
        client: ServiceBrokerClientMetadata,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Reserve a connection to the service
    ///
    /// Returns empty info when the service is unavailable.
    async fn request_service_channel(
        &self,
        moniker: &ServiceMoniker,
        options: ServiceActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<RemoteServiceConnectionInfo>;

    /// Drop a reservation the client will not connect to
    async fn cancel_service_request(&self, request_id: Uuid) -> Result<()>;

    fn availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChanged>;
}

/// Expose `broker` to the peer of `connection`
///
/// Call before `start_listening`. Availability events are forwarded as
/// notifications until the connection closes.
pub fn serve_remote_broker(connection: &Arc<RpcConnection>, broker: Arc<dyn RemoteServiceBroker>) {
    let closed = connection.closed_token();

    let b = Arc::clone(&broker);
    let cancel = closed.clone();
    connection.add_local_method(
        methods::HANDSHAKE,
        handler(move |args| {
            let broker = Arc::clone(&b);
            let cancel = cancel.clone();
            async move {
                let client: ServiceBrokerClientMetadata = arg(&args, 0).deserialize()?;
                broker.handshake(client, &cancel).await?;
                Ok(RpcValue::null())
            }
        }),
    );

    let b = Arc::clone(&broker);
    let cancel = closed.clone();
    connection.add_local_method(
        methods::REQUEST_SERVICE_CHANNEL,
        handler(move |args| {
            let broker = Arc::clone(&b);
            let cancel = cancel.clone();
            async move {
                let moniker: ServiceMoniker = arg(&args, 0).deserialize()?;
                let options: ServiceActivationOptions = match args.get(1) {
                    Some(value) => value.clone().deserialize()?,
                    None => ServiceActivationOptions::default(),
                };
                let info = broker
                    .request_service_channel(&moniker, options, &cancel)
                    .await?;
                RpcValue::from_serialize(&info)
            }
        }),
    );

    let b = Arc::clone(&broker);
    connection.add_local_method(
        methods::CANCEL_SERVICE_REQUEST,
        handler(move |args| {
            let broker = Arc::clone(&b);
            async move {
                let request_id: Uuid = arg(&args, 0).deserialize()?;
                broker.cancel_service_request(request_id).await?;
                Ok(RpcValue::null())
            }
        }),
    );

    let mut events = broker.availability_changed();
    let weak = Arc::downgrade(connection);
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = closed.cancelled() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => BrokeredServicesChanged {
                    impacted_services: Vec::new(),
                    other_services_impacted: true,
                },
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(connection) = weak.upgrade() else {
                break;
            };
            let sent = RpcValue::from_serialize(&event)
                .and_then(|arg| connection.notify(methods::AVAILABILITY_CHANGED, vec![arg]));
            if let Err(e) = sent {
                debug!("Availability notification not sent: {}", e);
                break;
            }
        }
    });
}

/// Client side of the remote broker protocol over an RPC connection
pub struct RemoteServiceBrokerProxy {
    connection: Arc<RpcConnection>,
    events: broadcast::Sender<BrokeredServicesChanged>,
}

impl RemoteServiceBrokerProxy {
    /// Wrap a connection that is not listening yet and start it
    pub fn new(connection: Arc<RpcConnection>) -> Arc<Self> {
        let (events, _) = broadcast::channel(AVAILABILITY_CHANNEL_CAPACITY);
        let sender = events.clone();
        connection.add_local_method(
            methods::AVAILABILITY_CHANGED,
            handler(move |args| {
                let sender = sender.clone();
                async move {
                    let event: BrokeredServicesChanged = arg(&args, 0).deserialize()?;
                    let _ = sender.send(event);
                    Ok(RpcValue::null())
                }
            }),
        );
        connection.start_listening();
        Arc::new(Self { connection, events })
    }

    /// Speak the protocol over a raw pipe
    pub fn over_pipe(pipe: DuplexPipe) -> Arc<Self> {
        Self::new(RpcConnection::with_options(
            pipe,
            ConnectionOptions::named("remote-broker"),
        ))
    }

    pub fn connection(&self) -> &Arc<RpcConnection> {
        &self.connection
    }

    pub fn dispose(&self) {
        self.connection.dispose();
    }
}

#[async_trait]
impl RemoteServiceBroker for RemoteServiceBrokerProxy {
    async fn handshake(
        &self,
        client: ServiceBrokerClientMetadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.connection
            .invoke_with_cancellation(
                methods::HANDSHAKE,
                vec![RpcValue::from_serialize(&client)?],
                cancel,
            )
            .await?;
        Ok(())
    }

    async fn request_service_channel(
        &self,
        moniker: &ServiceMoniker,
        options: ServiceActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<RemoteServiceConnectionInfo> {
        let info = self
            .connection
            .invoke_with_cancellation(
                methods::REQUEST_SERVICE_CHANNEL,
                vec![
                    RpcValue::from_serialize(moniker)?,
                    RpcValue::from_serialize(&options)?,
                ],
                cancel,
            )
            .await?;
        Ok(info.deserialize()?)
    }

    async fn cancel_service_request(&self, request_id: Uuid) -> Result<()> {
        self.connection
            .invoke(
                methods::CANCEL_SERVICE_REQUEST,
                vec![RpcValue::from_serialize(&request_id)?],
            )
            .await?;
        Ok(())
    }

    fn availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChanged> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for RemoteServiceBrokerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteServiceBrokerProxy")
            .field("connection", &self.connection.id())
            .finish()
    }
}
