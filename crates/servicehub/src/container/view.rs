//! Scoped broker views over a container

use super::registry::{Proffer, ProfferKind};
use super::{activation, ServiceContainer};
use crate::broker::{BrokeredServicesChanged, ServiceBroker, ServiceProxy};
use crate::types::{
    ClientRpcTarget, Result, ServiceActivationOptions, ServiceHubError, ServiceMoniker,
    ServiceRpcDescriptor, ServiceScope,
};
use async_trait::async_trait;
use hubrpc::{boxed, DuplexPipe};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Buffer size of the in-memory pipe between a client and a local service
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// How view credentials combine with credentials on a request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CredentialsPolicy {
    /// Credentials on the request win when it carries any
    #[default]
    RequestOverridesDefault,
    /// View credentials always replace the request's
    FilterOverridesRequest,
}

/// A container seen from one scope
pub struct ServiceBrokerView {
    container: Arc<ServiceContainer>,
    self_ref: Weak<ServiceBrokerView>,
    scope: ServiceScope,
    credentials: HashMap<String, String>,
    policy: CredentialsPolicy,
}

impl ServiceBrokerView {
    pub(crate) fn new(
        container: Arc<ServiceContainer>,
        scope: ServiceScope,
        credentials: HashMap<String, String>,
        policy: CredentialsPolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            container,
            self_ref: self_ref.clone(),
            scope,
            credentials,
            policy,
        })
    }

    pub fn scope(&self) -> ServiceScope {
        self.scope
    }

    pub fn container(&self) -> &Arc<ServiceContainer> {
        &self.container
    }

    fn apply_credentials(&self, mut options: ServiceActivationOptions) -> ServiceActivationOptions {
        match self.policy {
            CredentialsPolicy::RequestOverridesDefault => {
                if options.client_credentials.is_empty() {
                    options.client_credentials = self.credentials.clone();
                }
            }
            CredentialsPolicy::FilterOverridesRequest => {
                options.client_credentials = self.credentials.clone();
            }
        }
        options
    }

    fn this(&self) -> Result<Arc<ServiceBrokerView>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| ServiceHubError::ObjectDisposed("service broker view".to_string()))
    }

    /// Find, activate and look up the proffer serving `requested`
    async fn locate(
        &self,
        requested: &ServiceMoniker,
        cancel: &CancellationToken,
    ) -> Result<Option<Proffer>> {
        if cancel.is_cancelled() {
            return Err(ServiceHubError::Canceled);
        }
        let Some((registered, registration)) = self.container.resolve(requested, self.scope)
        else {
            debug!("{} is not visible from {:?}", requested, self.scope);
            return Ok(None);
        };

        activation::ensure_activated(&registration, &self.container, &registered, cancel).await?;

        let proffer = self.container.proffer(&registered);
        if proffer.is_none() {
            debug!("{} is registered but not proffered", registered);
        }
        Ok(proffer)
    }
}

#[async_trait]
impl ServiceBroker for ServiceBrokerView {
    async fn get_proxy(
        &self,
        descriptor: &ServiceRpcDescriptor,
        options: ServiceActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<ServiceProxy>>> {
        let options = self.apply_credentials(options);
        let Some(proffer) = self.locate(&descriptor.moniker, cancel).await? else {
            return Ok(None);
        };

        match proffer.kind {
            ProfferKind::Factory { factory, .. } => {
                let instance =
                    factory(descriptor.moniker.clone(), options, self.this()?, cancel.clone())
                        .await?;
                Ok(instance.map(|instance| {
                    Arc::new(ServiceProxy::local(descriptor.moniker.clone(), instance))
                }))
            }
            ProfferKind::Remote { client, .. } => {
                client.get_proxy(descriptor, options, cancel).await
            }
        }
    }

    async fn get_pipe(
        &self,
        moniker: &ServiceMoniker,
        options: ServiceActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<DuplexPipe>> {
        let mut options = self.apply_credentials(options);
        let Some(proffer) = self.locate(moniker, cancel).await? else {
            return Ok(None);
        };

        let (descriptor, factory) = match proffer.kind {
            ProfferKind::Factory {
                descriptor,
                factory,
            } => (descriptor, factory),
            ProfferKind::Remote { client, .. } => {
                return client.get_pipe(moniker, options, cancel).await
            }
        };

        let (client_end, service_end) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        let connection = descriptor
            .with_moniker(moniker.clone())
            .construct_connection(boxed(service_end));
        options.client_rpc_target = Some(ClientRpcTarget::Remote(connection.build_client_proxy()));

        let instance = match factory(moniker.clone(), options, self.this()?, cancel.clone()).await
        {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                connection.dispose();
                return Ok(None);
            }
            Err(e) => {
                connection.dispose();
                return Err(e);
            }
        };

        connection.add_local_target(&instance);
        connection.start_listening();
        let name = moniker.to_string();
        tokio::spawn(async move {
            connection.wait_closed().await;
            debug!("Pipe to {} closed, disposing the service", name);
            instance.dispose();
        });

        Ok(Some(boxed(client_end)))
    }

    fn availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChanged> {
        self.container.availability_changed()
    }
}

impl std::fmt::Debug for ServiceBrokerView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBrokerView")
            .field("container", &self.container.name())
            .field("scope", &self.scope)
            .field("policy", &self.policy)
            .finish()
    }
}
