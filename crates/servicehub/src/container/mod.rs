//! Service container
//!
//! Holds the registration table (which monikers exist and for which
//! audience), the proffer table (who serves them) and hands out scoped
//! [`ServiceBrokerView`]s through which clients request services.

mod activation;
mod registry;
mod view;

pub use registry::{ActivationCallback, ServiceFactory, ServiceRegistration};
pub use view::{CredentialsPolicy, ServiceBrokerView};

use crate::broker::{BrokeredServicesChanged, ServiceBroker, AVAILABILITY_CHANNEL_CAPACITY};
use crate::remote::{RemoteServiceBroker, RemoteServiceBrokerClient};
use crate::types::{
    Result, ServiceActivationOptions, ServiceHubError, ServiceMoniker, ServiceRpcDescriptor,
    ServiceScope, ServiceSource,
};
use futures::FutureExt;
use hubrpc::{LocalTarget, MultiplexingStream};
use parking_lot::RwLock;
use registry::{Proffer, ProfferKey, ProfferKind, Tables};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Container configuration
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    /// Name used in logs
    pub name: String,
    /// Buffered availability events per subscriber
    pub event_capacity: usize,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            name: "container".to_string(),
            event_capacity: AVAILABILITY_CHANNEL_CAPACITY,
        }
    }
}

impl ContainerOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

/// Registry of services and the source of broker views
pub struct ServiceContainer {
    options: ContainerOptions,
    self_ref: Weak<ServiceContainer>,
    tables: RwLock<Tables>,
    next_generation: AtomicU64,
    events: broadcast::Sender<BrokeredServicesChanged>,
}

impl ServiceContainer {
    pub fn new() -> Arc<Self> {
        Self::with_options(ContainerOptions::default())
    }

    pub fn with_options(options: ContainerOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(options.event_capacity);
        Arc::new_cyclic(|self_ref| Self {
            options,
            self_ref: self_ref.clone(),
            tables: RwLock::new(Tables::default()),
            next_generation: AtomicU64::new(1),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Register services; either all entries are added or none
    pub fn register<I>(&self, entries: I) -> Result<RegistrationHandle>
    where
        I: IntoIterator<Item = (ServiceMoniker, ServiceRegistration)>,
    {
        let entries: Vec<(ServiceMoniker, Arc<ServiceRegistration>)> = entries
            .into_iter()
            .map(|(moniker, registration)| (moniker, Arc::new(registration)))
            .collect();

        self.tables.write().register(&entries)?;
        let monikers: Vec<ServiceMoniker> = entries.iter().map(|(m, _)| m.clone()).collect();
        info!("[{}] registered {:?}", self.options.name, monikers);
        self.raise(monikers);

        Ok(RegistrationHandle {
            container: self.self_ref.clone(),
            entries,
            disposed: AtomicBool::new(false),
        })
    }

    /// Registrations for exactly `moniker`, one per audience
    pub fn registration(&self, moniker: &ServiceMoniker) -> Vec<Arc<ServiceRegistration>> {
        self.tables.read().registration(moniker)
    }

    /// Serve a registered moniker from an in-process factory
    ///
    /// Replaces any previous proffer of the same moniker.
    pub fn proffer_factory<F, Fut>(
        &self,
        descriptor: ServiceRpcDescriptor,
        factory: F,
    ) -> Result<ProfferHandle>
    where
        F: Fn(
                ServiceMoniker,
                ServiceActivationOptions,
                Arc<ServiceBrokerView>,
                CancellationToken,
            ) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<Option<Arc<LocalTarget>>>> + Send + 'static,
    {
        let moniker = descriptor.moniker.clone();
        let factory: ServiceFactory = Arc::new(move |requested, options, view, cancel| {
            factory(requested, options, view, cancel).boxed()
        });
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let key = ProfferKey::Moniker(moniker.clone());
        {
            let mut tables = self.tables.write();
            if !tables.is_registered(&moniker) {
                return Err(ServiceHubError::NotRegistered(moniker));
            }
            tables.insert_proffer(
                key.clone(),
                Proffer {
                    generation,
                    kind: ProfferKind::Factory {
                        descriptor,
                        factory,
                    },
                },
            );
        }
        debug!("[{}] proffered factory for {}", self.options.name, moniker);
        self.raise(vec![moniker]);

        Ok(ProfferHandle::new(self.self_ref.clone(), vec![key], generation, None))
    }

    /// Serve monikers from a remote broker
    ///
    /// Handshakes with `remote` first. With `monikers` set to `None` the
    /// remote broker serves every registered moniker that has no proffer of
    /// its own. Availability events of the remote broker are re-raised here.
    pub async fn proffer_remote_broker(
        &self,
        remote: Arc<dyn RemoteServiceBroker>,
        transport: Option<MultiplexingStream>,
        source: ServiceSource,
        monikers: Option<Vec<ServiceMoniker>>,
    ) -> Result<ProfferHandle> {
        if let Some(monikers) = &monikers {
            let tables = self.tables.read();
            if let Some(missing) = monikers.iter().find(|m| !tables.is_registered(m)) {
                return Err(ServiceHubError::NotRegistered(missing.clone()));
            }
        }

        let client =
            RemoteServiceBrokerClient::connect(remote, transport, &CancellationToken::new())
                .await?;

        let keys: Vec<ProfferKey> = match &monikers {
            Some(monikers) => monikers.iter().cloned().map(ProfferKey::Moniker).collect(),
            None => vec![ProfferKey::Fallback],
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut tables = self.tables.write();
            for key in &keys {
                tables.insert_proffer(
                    key.clone(),
                    Proffer {
                        generation,
                        kind: ProfferKind::Remote {
                            client: Arc::clone(&client),
                            source,
                        },
                    },
                );
            }
        }
        info!(
            "[{}] proffered remote broker ({:?}) for {}",
            self.options.name,
            source,
            monikers
                .as_ref()
                .map(|m| format!("{:?}", m))
                .unwrap_or_else(|| "all services".to_string())
        );

        let forwarding = CancellationToken::new();
        let mut remote_events = client.availability_changed();
        let events = self.events.clone();
        let stop = forwarding.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = remote_events.recv() => match event {
                        Ok(event) => {
                            let _ = events.send(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let _ = events.send(BrokeredServicesChanged {
                                impacted_services: Vec::new(),
                                other_services_impacted: true,
                            });
                            debug!("Remote availability events lagged by {}", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        match monikers {
            Some(monikers) => self.raise(monikers),
            None => self.raise_all(),
        }

        Ok(ProfferHandle::new(
            self.self_ref.clone(),
            keys,
            generation,
            Some(forwarding),
        ))
    }

    /// Where a registered moniker is served from, when a remote broker
    /// proffers it
    ///
    /// `None` when the moniker is served in-process or not proffered at all.
    pub fn proffer_source(&self, moniker: &ServiceMoniker) -> Option<ServiceSource> {
        match self.tables.read().proffer(moniker)?.kind {
            ProfferKind::Remote { source, .. } => Some(source),
            ProfferKind::Factory { .. } => None,
        }
    }

    /// A broker view for clients in `scope`
    pub fn get_view(
        &self,
        scope: ServiceScope,
        credentials: HashMap<String, String>,
        policy: CredentialsPolicy,
    ) -> Result<Arc<ServiceBrokerView>> {
        let container = self
            .self_ref
            .upgrade()
            .ok_or_else(|| ServiceHubError::ObjectDisposed(self.options.name.clone()))?;
        Ok(ServiceBrokerView::new(container, scope, credentials, policy))
    }

    /// Subscribe to availability changes of any service in this container
    pub fn availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChanged> {
        self.events.subscribe()
    }

    pub(crate) fn resolve(
        &self,
        requested: &ServiceMoniker,
        scope: ServiceScope,
    ) -> Option<(ServiceMoniker, Arc<ServiceRegistration>)> {
        self.tables.read().resolve(requested, scope)
    }

    pub(crate) fn proffer(&self, registered: &ServiceMoniker) -> Option<Proffer> {
        self.tables.read().proffer(registered)
    }

    fn raise(&self, monikers: Vec<ServiceMoniker>) {
        // No subscribers is not an error
        let _ = self
            .events
            .send(BrokeredServicesChanged::for_monikers(monikers));
    }

    fn raise_all(&self) {
        let monikers = self.tables.read().registered_monikers();
        let _ = self.events.send(BrokeredServicesChanged {
            impacted_services: monikers,
            other_services_impacted: true,
        });
    }

    fn unregister(&self, entries: &[(ServiceMoniker, Arc<ServiceRegistration>)]) {
        self.tables.write().unregister(entries);
        let monikers: Vec<ServiceMoniker> = entries.iter().map(|(m, _)| m.clone()).collect();
        info!("[{}] unregistered {:?}", self.options.name, monikers);
        self.raise(monikers);
    }

    fn unproffer(&self, keys: &[ProfferKey], generation: u64) {
        let mut removed = Vec::new();
        let mut fallback_removed = false;
        {
            let mut tables = self.tables.write();
            for key in keys {
                if tables.remove_proffer(key, generation) {
                    match key {
                        ProfferKey::Moniker(moniker) => removed.push(moniker.clone()),
                        ProfferKey::Fallback => fallback_removed = true,
                    }
                }
            }
        }
        if fallback_removed {
            self.raise_all();
        } else if !removed.is_empty() {
            debug!("[{}] withdrew {:?}", self.options.name, removed);
            self.raise(removed);
        }
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("name", &self.options.name)
            .finish()
    }
}

/// Undoes a [`ServiceContainer::register`] call
pub struct RegistrationHandle {
    container: Weak<ServiceContainer>,
    entries: Vec<(ServiceMoniker, Arc<ServiceRegistration>)>,
    disposed: AtomicBool,
}

impl RegistrationHandle {
    pub fn monikers(&self) -> impl Iterator<Item = &ServiceMoniker> {
        self.entries.iter().map(|(m, _)| m)
    }

    /// Remove the registrations this handle was created for
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(container) = self.container.upgrade() {
            container.unregister(&self.entries);
        }
    }
}

/// Withdraws a proffer
///
/// A handle whose proffer was already replaced leaves the replacement alone.
pub struct ProfferHandle {
    container: Weak<ServiceContainer>,
    keys: Vec<ProfferKey>,
    generation: u64,
    forwarding: Option<CancellationToken>,
    disposed: AtomicBool,
}

impl ProfferHandle {
    fn new(
        container: Weak<ServiceContainer>,
        keys: Vec<ProfferKey>,
        generation: u64,
        forwarding: Option<CancellationToken>,
    ) -> Self {
        Self {
            container,
            keys,
            generation,
            forwarding,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(forwarding) = &self.forwarding {
            forwarding.cancel();
        }
        if let Some(container) = self.container.upgrade() {
            container.unproffer(&self.keys, self.generation);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}
