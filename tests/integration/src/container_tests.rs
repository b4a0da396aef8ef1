//! Container Tests - Registration, Visibility and Activation
//!
//! These tests exercise the in-process side of the hub:
//! - Audience visibility for every scope
//! - Version matching between requests and registrations
//! - Single-flight activation under concurrent demand
//! - Proxy disposal and availability events

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use hubrpc::{CancellationToken, LocalTarget, ObjectProxy, ObjectProxyExt, RpcError, RpcValue};
use serde_json::json;
use servicehub::{
    FromProxy, ServiceActivationOptions, ServiceAudience, ServiceBroker, ServiceBrokerExt,
    ServiceHubError, ServiceMoniker, ServiceProxy, ServiceRegistration, ServiceRpcDescriptor,
    ServiceScope,
};
use tokio::sync::Notify;

/// Typed client over the calculator proxy
struct Calculator(Arc<ServiceProxy>);

impl FromProxy for Calculator {
    fn from_proxy(proxy: Arc<ServiceProxy>) -> Self {
        Calculator(proxy)
    }
}

impl Calculator {
    async fn add(&self, a: i64, b: i64) -> hubrpc::Result<i64> {
        self.0.call("Add", vec![json!(a), json!(b)]).await
    }
}

#[tokio::test]
async fn test_audience_visibility_matrix() {
    init_logging();

    let audiences = [
        ServiceAudience::Process,
        ServiceAudience::LocalMachine,
        ServiceAudience::RemoteGuest,
        ServiceAudience::Everyone,
    ];
    let scopes = [
        ServiceScope::Process,
        ServiceScope::LocalMachine,
        ServiceScope::RemoteGuest,
    ];

    for audience in audiences {
        let counter = Arc::new(InstanceCounter::default());
        let container = container_with_calculator(audience, counter);
        for scope in scopes {
            let proxy = view(&container, scope)
                .get_proxy(
                    &calculator_descriptor(),
                    Default::default(),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert_eq!(
                proxy.is_some(),
                audience.is_visible_to(scope),
                "{:?} requested from {:?}",
                audience,
                scope
            );
        }
    }
}

#[tokio::test]
async fn test_versioned_registration_wins_over_wildcard() {
    init_logging();

    let container = servicehub::ServiceContainer::new();
    let wildcard = ServiceMoniker::new("calc");
    let pinned = ServiceMoniker::versioned("calc", "2.0");
    container
        .register([
            (wildcard.clone(), ServiceRegistration::new(ServiceAudience::Process)),
            (pinned.clone(), ServiceRegistration::new(ServiceAudience::Process)),
        ])
        .unwrap();

    for (moniker, label) in [(wildcard.clone(), "any"), (pinned.clone(), "v2")] {
        container
            .proffer_factory(ServiceRpcDescriptor::new(moniker), move |_, _, _, _| async move {
                Ok(Some(
                    LocalTarget::builder("calc")
                        .method("Which", move |_| async move { Ok(RpcValue::from(json!(label))) })
                        .build(),
                ))
            })
            .unwrap();
    }

    let view = view(&container, ServiceScope::Process);
    let cancel = CancellationToken::new();
    let which = |version: Option<&str>| {
        let moniker = match version {
            Some(v) => ServiceMoniker::versioned("calc", v),
            None => ServiceMoniker::new("calc"),
        };
        let view = Arc::clone(&view);
        let cancel = cancel.clone();
        async move {
            let proxy = view
                .get_proxy(&ServiceRpcDescriptor::new(moniker), Default::default(), &cancel)
                .await
                .unwrap()
                .unwrap();
            proxy.call::<String>("Which", vec![]).await.unwrap()
        }
    };

    assert_eq!(which(Some("2.0")).await, "v2");
    assert_eq!(which(Some("1.0")).await, "any");
    assert_eq!(which(None).await, "any");
}

#[tokio::test]
async fn test_pinned_registration_rejects_other_versions() {
    init_logging();

    let container = servicehub::ServiceContainer::new();
    let pinned = ServiceMoniker::versioned("calc", "1.0");
    container
        .register([(pinned.clone(), ServiceRegistration::new(ServiceAudience::Process))])
        .unwrap();
    container
        .proffer_factory(ServiceRpcDescriptor::new(pinned), |_, _, _, _| async {
            Ok(Some(LocalTarget::builder("calc").build()))
        })
        .unwrap();

    let view = view(&container, ServiceScope::Process);
    let cancel = CancellationToken::new();
    for requested in [
        ServiceMoniker::new("calc"),
        ServiceMoniker::versioned("calc", "2.0"),
    ] {
        let proxy = view
            .get_proxy(&ServiceRpcDescriptor::new(requested), Default::default(), &cancel)
            .await
            .unwrap();
        assert!(proxy.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_activation() {
    init_logging();

    let activations = Arc::new(AtomicU32::new(0));
    let release = Arc::new(Notify::new());
    let counter = Arc::new(InstanceCounter::default());

    let container = servicehub::ServiceContainer::new();
    {
        let activations = Arc::clone(&activations);
        let release = Arc::clone(&release);
        let counter = Arc::clone(&counter);
        container
            .register([(
                calculator_moniker(),
                ServiceRegistration::new(ServiceAudience::Process).with_activation(
                    move |container, _moniker| {
                        let activations = Arc::clone(&activations);
                        let release = Arc::clone(&release);
                        let counter = Arc::clone(&counter);
                        async move {
                            activations.fetch_add(1, Ordering::SeqCst);
                            release.notified().await;
                            container.proffer_factory(
                                calculator_descriptor(),
                                move |_, _, _, _| {
                                    let counter = Arc::clone(&counter);
                                    async move { Ok(Some(calculator(counter, None))) }
                                },
                            )?;
                            Ok(())
                        }
                    },
                ),
            )])
            .unwrap();
    }

    let view = view(&container, ServiceScope::Process);
    let requests: Vec<_> = (0..2)
        .map(|_| {
            let view = Arc::clone(&view);
            tokio::spawn(async move {
                view.get_typed_proxy::<Calculator>(
                    &calculator_descriptor(),
                    Default::default(),
                    &CancellationToken::new(),
                )
                .await
            })
        })
        .collect();

    assert!(wait_until(Duration::from_secs(2), || activations.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    release.notify_one();

    for request in requests {
        let calculator = request.await.unwrap().unwrap().unwrap();
        assert_eq!(calculator.add(40, 2).await.unwrap(), 42);
    }
    assert_eq!(activations.load(Ordering::SeqCst), 1);
    assert_eq!(counter.created(), 2);
}

#[tokio::test]
async fn test_failed_activation_is_shared() {
    init_logging();

    let activations = Arc::new(AtomicU32::new(0));
    let container = servicehub::ServiceContainer::new();
    let calls = Arc::clone(&activations);
    container
        .register([(
            calculator_moniker(),
            ServiceRegistration::new(ServiceAudience::Process).with_activation(
                move |_container, _moniker| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ServiceHubError::Protocol("no backing store".into())) }
                },
            ),
        )])
        .unwrap();

    let view = view(&container, ServiceScope::Process);
    for _ in 0..3 {
        let result = view
            .get_proxy(&calculator_descriptor(), Default::default(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ServiceHubError::ActivationFailed { .. })));
    }
    assert_eq!(activations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disposed_proxy_severs_access() {
    init_logging();

    let counter = Arc::new(InstanceCounter::default());
    let container = container_with_calculator(ServiceAudience::Process, Arc::clone(&counter));
    let proxy = view(&container, ServiceScope::Process)
        .get_proxy(&calculator_descriptor(), Default::default(), &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    let sum: i64 = proxy.call("Add", vec![json!(1), json!(2)]).await.unwrap();
    assert_eq!(sum, 3);

    proxy.dispose();
    proxy.dispose();
    assert_eq!(counter.disposed(), 1);
    let err = proxy
        .call::<i64>("Add", vec![json!(1), json!(2)])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ObjectDisposed(_)));
}

#[tokio::test]
async fn test_local_client_target_receives_callbacks() {
    init_logging();

    let counter = Arc::new(InstanceCounter::default());
    let container = container_with_calculator(ServiceAudience::Process, counter);
    let (sink, received) = notification_sink();

    let proxy = view(&container, ServiceScope::Process)
        .get_proxy(
            &calculator_descriptor(),
            ServiceActivationOptions::default().with_client_rpc_target(sink),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
        .unwrap();
    proxy
        .invoke("Notify", vec![json!("ready").into()])
        .await
        .unwrap();
    assert_eq!(*received.lock(), vec!["ready".to_string()]);
}

#[tokio::test]
async fn test_availability_events_follow_registrations() {
    init_logging();

    let container = servicehub::ServiceContainer::new();
    let view = view(&container, ServiceScope::Process);
    let mut events = view.availability_changed();

    let registration = container
        .register([(calculator_moniker(), ServiceRegistration::new(ServiceAudience::Process))])
        .unwrap();
    let proffer = container
        .proffer_factory(calculator_descriptor(), |_, _, _, _| async { Ok(None) })
        .unwrap();
    proffer.dispose();
    registration.dispose();

    for _ in 0..4 {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.impacted_services, vec![calculator_moniker()]);
    }
    assert!(container.registration(&calculator_moniker()).is_empty());
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    init_logging();

    let container = servicehub::ServiceContainer::new();
    let first = container
        .register([(calculator_moniker(), ServiceRegistration::new(ServiceAudience::Everyone))])
        .unwrap();
    let again = container.register([
        (ServiceMoniker::new("other"), ServiceRegistration::new(ServiceAudience::Everyone)),
        (calculator_moniker(), ServiceRegistration::new(ServiceAudience::Everyone)),
    ]);
    assert!(matches!(again, Err(ServiceHubError::AlreadyRegistered(..))));
    assert!(container.registration(&ServiceMoniker::new("other")).is_empty());

    // Unregistering the original frees the slot
    first.dispose();
    container
        .register([(calculator_moniker(), ServiceRegistration::new(ServiceAudience::Everyone))])
        .unwrap();
}

#[tokio::test]
async fn test_view_credentials_reach_factory() {
    init_logging();

    let container = servicehub::ServiceContainer::new();
    container
        .register([(calculator_moniker(), ServiceRegistration::new(ServiceAudience::Process))])
        .unwrap();
    container
        .proffer_factory(
            calculator_descriptor(),
            |_, options: ServiceActivationOptions, _, _| async move {
                let user = options.client_credentials.get("user").cloned();
                Ok(user.map(|_| LocalTarget::builder("calc").build()))
            },
        )
        .unwrap();

    let anonymous = view(&container, ServiceScope::Process);
    let signed_in = container
        .get_view(
            ServiceScope::Process,
            HashMap::from([("user".to_string(), "alice".to_string())]),
            servicehub::CredentialsPolicy::FilterOverridesRequest,
        )
        .unwrap();
    let cancel = CancellationToken::new();

    assert!(anonymous
        .get_proxy(&calculator_descriptor(), Default::default(), &cancel)
        .await
        .unwrap()
        .is_none());
    assert!(signed_in
        .get_proxy(&calculator_descriptor(), Default::default(), &cancel)
        .await
        .unwrap()
        .is_some());
}
