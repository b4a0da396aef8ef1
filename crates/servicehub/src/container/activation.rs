//! Single-flight service activation
//!
//! The first request for a registered service spawns its activation callback
//! as a detached task. Every request, concurrent or later, awaits the same
//! shared outcome; the callback never runs twice. A waiter that gets
//! cancelled stops waiting but leaves the activation running.

use super::registry::ServiceRegistration;
use super::ServiceContainer;
use crate::types::{Result, ServiceHubError, ServiceMoniker};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of an activation, shared by all of its waiters
pub(crate) type SharedActivation = Shared<BoxFuture<'static, std::result::Result<(), String>>>;

/// Ensure `registration` has been activated, starting it if necessary
pub(crate) async fn ensure_activated(
    registration: &ServiceRegistration,
    container: &Arc<ServiceContainer>,
    moniker: &ServiceMoniker,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(activation) = start_or_join(registration, container, moniker) else {
        return Ok(());
    };

    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(ServiceHubError::Canceled),
        outcome = activation => outcome.map_err(|message| ServiceHubError::ActivationFailed {
            moniker: moniker.to_string(),
            message,
        }),
    }
}

fn start_or_join(
    registration: &ServiceRegistration,
    container: &Arc<ServiceContainer>,
    moniker: &ServiceMoniker,
) -> Option<SharedActivation> {
    let callback = registration.activation()?;

    let mut state = registration.activation_state.lock();
    if let Some(existing) = state.as_ref() {
        return Some(existing.clone());
    }

    debug!("Activating {}", moniker);
    let task = tokio::spawn(callback(Arc::clone(container), moniker.clone()));
    let moniker = moniker.clone();
    let outcome = async move {
        match task.await {
            Ok(Ok(())) => {
                debug!("Activated {}", moniker);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Activation of {} failed: {}", moniker, e);
                Err(e.to_string())
            }
            Err(e) => {
                warn!("Activation of {} aborted: {}", moniker, e);
                Err(e.to_string())
            }
        }
    }
    .boxed()
    .shared();

    *state = Some(outcome.clone());
    Some(outcome)
}
