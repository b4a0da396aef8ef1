//! Registration and proffer tables

use super::activation::SharedActivation;
use super::view::ServiceBrokerView;
use super::ServiceContainer;
use crate::remote::RemoteServiceBrokerClient;
use crate::types::{
    Result, ServiceActivationOptions, ServiceAudience, ServiceHubError, ServiceMoniker,
    ServiceRpcDescriptor, ServiceScope, ServiceSource,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use hubrpc::LocalTarget;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Callback run once, on first demand, before a service is looked up
pub type ActivationCallback = Arc<
    dyn Fn(Arc<ServiceContainer>, ServiceMoniker) -> BoxFuture<'static, Result<()>> + Send + Sync,
>;

/// Creates service instances for a proffered moniker
///
/// Receives the requested moniker, the request options, the view the request
/// came through and the request's cancellation token. `None` means the
/// service declined the request.
pub type ServiceFactory = Arc<
    dyn Fn(
            ServiceMoniker,
            ServiceActivationOptions,
            Arc<ServiceBrokerView>,
            CancellationToken,
        ) -> BoxFuture<'static, Result<Option<Arc<LocalTarget>>>>
        + Send
        + Sync,
>;

/// What a registered service promises about itself
pub struct ServiceRegistration {
    audience: ServiceAudience,
    allow_guest_clients: bool,
    activation: Option<ActivationCallback>,
    pub(crate) activation_state: Mutex<Option<SharedActivation>>,
}

impl ServiceRegistration {
    pub fn new(audience: ServiceAudience) -> Self {
        Self {
            audience,
            allow_guest_clients: false,
            activation: None,
            activation_state: Mutex::new(None),
        }
    }

    pub fn allow_guest_clients(mut self, allow: bool) -> Self {
        self.allow_guest_clients = allow;
        self
    }

    /// Run `callback` the first time the service is requested
    pub fn with_activation<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Arc<ServiceContainer>, ServiceMoniker) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.activation = Some(Arc::new(move |container, moniker| {
            callback(container, moniker).boxed()
        }));
        self
    }

    pub fn audience(&self) -> ServiceAudience {
        self.audience
    }

    pub fn allows_guest_clients(&self) -> bool {
        self.allow_guest_clients
    }

    pub fn has_activation(&self) -> bool {
        self.activation.is_some()
    }

    pub(crate) fn activation(&self) -> Option<&ActivationCallback> {
        self.activation.as_ref()
    }
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("audience", &self.audience)
            .field("allow_guest_clients", &self.allow_guest_clients)
            .field("activation", &self.activation.is_some())
            .finish()
    }
}

/// Where a proffered service comes from
#[derive(Clone)]
pub(crate) enum ProfferKind {
    Factory {
        descriptor: ServiceRpcDescriptor,
        factory: ServiceFactory,
    },
    Remote {
        client: Arc<RemoteServiceBrokerClient>,
        source: ServiceSource,
    },
}

#[derive(Clone)]
pub(crate) struct Proffer {
    pub generation: u64,
    pub kind: ProfferKind,
}

/// Key a proffer handle removes on disposal
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ProfferKey {
    Moniker(ServiceMoniker),
    /// Remote broker serving every registered moniker without its own proffer
    Fallback,
}

/// Mutable container state, guarded by one lock
#[derive(Default)]
pub(crate) struct Tables {
    registrations: HashMap<ServiceMoniker, Vec<Arc<ServiceRegistration>>>,
    proffers: HashMap<ServiceMoniker, Proffer>,
    fallback: Option<Proffer>,
}

impl Tables {
    pub fn is_registered(&self, moniker: &ServiceMoniker) -> bool {
        self.registrations
            .get(moniker)
            .is_some_and(|entries| !entries.is_empty())
    }

    /// Insert a batch of registrations, or none of them
    pub fn register(
        &mut self,
        entries: &[(ServiceMoniker, Arc<ServiceRegistration>)],
    ) -> Result<()> {
        for (i, (moniker, registration)) in entries.iter().enumerate() {
            let audience = registration.audience();
            let taken = self
                .registrations
                .get(moniker)
                .is_some_and(|existing| existing.iter().any(|r| r.audience() == audience));
            let repeated = entries[..i]
                .iter()
                .any(|(m, r)| m == moniker && r.audience() == audience);
            if taken || repeated {
                return Err(ServiceHubError::AlreadyRegistered(
                    moniker.clone(),
                    audience,
                ));
            }
        }
        for (moniker, registration) in entries {
            self.registrations
                .entry(moniker.clone())
                .or_default()
                .push(Arc::clone(registration));
        }
        Ok(())
    }

    /// Remove exactly these registration instances
    pub fn unregister(&mut self, entries: &[(ServiceMoniker, Arc<ServiceRegistration>)]) {
        for (moniker, registration) in entries {
            if let Some(existing) = self.registrations.get_mut(moniker) {
                existing.retain(|r| !Arc::ptr_eq(r, registration));
                if existing.is_empty() {
                    self.registrations.remove(moniker);
                }
            }
        }
    }

    /// Registration serving `requested` for a view with `scope`
    ///
    /// An exact versioned registration wins over the unversioned one.
    pub fn resolve(
        &self,
        requested: &ServiceMoniker,
        scope: ServiceScope,
    ) -> Option<(ServiceMoniker, Arc<ServiceRegistration>)> {
        let mut candidates = Vec::with_capacity(2);
        if requested.version.is_some() {
            candidates.push(requested.clone());
        }
        candidates.push(requested.unversioned());

        candidates.into_iter().find_map(|key| {
            let registration = self
                .registrations
                .get(&key)?
                .iter()
                .find(|r| r.audience().is_visible_to(scope))
                .cloned()?;
            Some((key, registration))
        })
    }

    pub fn registration(&self, moniker: &ServiceMoniker) -> Vec<Arc<ServiceRegistration>> {
        self.registrations.get(moniker).cloned().unwrap_or_default()
    }

    pub fn proffer(&self, registered: &ServiceMoniker) -> Option<Proffer> {
        self.proffers
            .get(registered)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn insert_proffer(&mut self, key: ProfferKey, proffer: Proffer) {
        match key {
            ProfferKey::Moniker(moniker) => {
                self.proffers.insert(moniker, proffer);
            }
            ProfferKey::Fallback => self.fallback = Some(proffer),
        }
    }

    /// Remove a proffer unless it was replaced by a newer generation
    pub fn remove_proffer(&mut self, key: &ProfferKey, generation: u64) -> bool {
        match key {
            ProfferKey::Moniker(moniker) => {
                if self
                    .proffers
                    .get(moniker)
                    .is_some_and(|p| p.generation == generation)
                {
                    self.proffers.remove(moniker);
                    return true;
                }
                false
            }
            ProfferKey::Fallback => {
                if self
                    .fallback
                    .as_ref()
                    .is_some_and(|p| p.generation == generation)
                {
                    self.fallback = None;
                    return true;
                }
                false
            }
        }
    }

    pub fn registered_monikers(&self) -> Vec<ServiceMoniker> {
        self.registrations.keys().cloned().collect()
    }
}
