//! Remote Broker Tests - Relays, Clients and the Wire Protocol
//!
//! Each test serves a container through a relay over an in-memory protocol
//! connection and reaches it back through a remote broker client:
//! - Named pipe and multiplexed channel delivery
//! - Handshake capability checks
//! - Cancelling reservations before and after the client connects
//! - Availability events crossing the boundary

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use hubrpc::{connect_pipe, CancellationToken, ObjectProxy, ObjectProxyExt};
use serde_json::json;
use servicehub::{
    RelayOptions, RemoteServiceBroker, RemoteServiceBrokerClient, ServiceActivationOptions,
    ServiceAudience, ServiceBroker, ServiceHubError, ServiceMoniker, ServiceRegistration,
    ServiceScope, ServiceSource,
};

#[tokio::test]
async fn test_pipe_relay_round_trip() {
    init_logging();

    let counter = Arc::new(InstanceCounter::default());
    let (_container, relay) = calculator_relay(&counter, RelayOptions::default());
    let (_server, remote) = protocol_link(Arc::clone(&relay));
    let cancel = CancellationToken::new();

    let client = RemoteServiceBrokerClient::connect(remote, None, &cancel)
        .await
        .unwrap();
    let proxy = client
        .get_proxy(&calculator_descriptor(), Default::default(), &cancel)
        .await
        .unwrap()
        .expect("calculator over a pipe");
    assert!(!proxy.is_local());

    let sum: i64 = proxy.call("Add", vec![json!(40), json!(2)]).await.unwrap();
    assert_eq!(sum, 42);
    assert_eq!(relay.pending_requests(), 0);

    // Closing the client side tears the service instance down
    proxy.dispose();
    assert!(wait_until(Duration::from_secs(5), || counter.disposed() == 1).await);
}

#[tokio::test]
async fn test_remote_failure_surfaces_to_caller() {
    init_logging();

    let counter = Arc::new(InstanceCounter::default());
    let (_container, relay) = calculator_relay(&counter, RelayOptions::default());
    let (_server, remote) = protocol_link(relay);
    let cancel = CancellationToken::new();

    let client = RemoteServiceBrokerClient::connect(remote, None, &cancel)
        .await
        .unwrap();
    let proxy = client
        .get_proxy(&calculator_descriptor(), Default::default(), &cancel)
        .await
        .unwrap()
        .unwrap();
    let err = proxy
        .invoke("Divide", vec![json!(1).into(), json!(0).into()])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("division by zero"), "{}", err);
}

#[tokio::test]
async fn test_unknown_service_is_unavailable_remotely() {
    init_logging();

    let counter = Arc::new(InstanceCounter::default());
    let (_container, relay) = calculator_relay(&counter, RelayOptions::default());
    let (_server, remote) = protocol_link(Arc::clone(&relay));
    let cancel = CancellationToken::new();

    let client = RemoteServiceBrokerClient::connect(remote, None, &cancel)
        .await
        .unwrap();
    let pipe = client
        .get_pipe(&ServiceMoniker::new("missing"), Default::default(), &cancel)
        .await
        .unwrap();
    assert!(pipe.is_none());
    assert_eq!(relay.pending_requests(), 0);
    assert_eq!(counter.created(), 0);
}

#[tokio::test]
async fn test_multiplexed_relay_round_trip() {
    init_logging();

    let (near, far) = multiplexed_pair().await;
    let counter = Arc::new(InstanceCounter::default());
    let options = RelayOptions::multiplexed(near.clone(), false);
    let (_container, relay) = calculator_relay(&counter, options);
    let (_server, remote) = protocol_link(Arc::clone(&relay));
    let cancel = CancellationToken::new();

    let client = RemoteServiceBrokerClient::connect(remote, Some(far), &cancel)
        .await
        .unwrap();

    let mut proxies = Vec::new();
    for i in 0..3i64 {
        let proxy = client
            .get_proxy(&calculator_descriptor(), Default::default(), &cancel)
            .await
            .unwrap()
            .expect("calculator over a channel");
        let sum: i64 = proxy.call("Add", vec![json!(i), json!(i)]).await.unwrap();
        assert_eq!(sum, 2 * i);
        proxies.push(proxy);
    }
    assert_eq!(counter.created(), 3);
    assert_eq!(relay.pending_requests(), 0);

    relay.dispose();
    assert!(!near.is_closed());
}

#[tokio::test]
async fn test_handshake_rejects_missing_capability() {
    init_logging();

    let (near, _far) = multiplexed_pair().await;
    let counter = Arc::new(InstanceCounter::default());
    let (_container, relay) = calculator_relay(&counter, RelayOptions::multiplexed(near, true));
    let (_server, remote) = protocol_link(relay);

    // No transport means the client only offers named pipes
    let outcome =
        RemoteServiceBrokerClient::connect(remote, None, &CancellationToken::new()).await;
    assert!(matches!(outcome, Err(ServiceHubError::HandshakeRejected(_))));
}

#[tokio::test]
async fn test_cancel_after_connect_reports_nothing_to_cancel() {
    init_logging();

    let counter = Arc::new(InstanceCounter::default());
    let (_container, relay) = calculator_relay(&counter, RelayOptions::default());
    let (_server, remote) = protocol_link(Arc::clone(&relay));
    let cancel = CancellationToken::new();

    let info = remote
        .request_service_channel(&calculator_moniker(), Default::default(), &cancel)
        .await
        .unwrap();
    let request_id = info.request_id.expect("request id");
    let pipe_name = info.pipe_name.clone().expect("pipe name");

    let pipe = connect_pipe(&pipe_name).await.unwrap();
    let connection = calculator_descriptor().construct_connection(pipe);
    connection.start_listening();
    let sum = connection
        .invoke("Add", vec![json!(2).into(), json!(3).into()])
        .await
        .unwrap();
    assert_eq!(sum.as_json(), Some(&json!(5)));

    let late = remote.cancel_service_request(request_id).await;
    assert!(matches!(
        late,
        Err(ServiceHubError::NothingToCancel(id)) if id == request_id
    ));
    connection.dispose();
}

#[tokio::test]
async fn test_cancel_before_connect_releases_service() {
    init_logging();

    let counter = Arc::new(InstanceCounter::default());
    let (_container, relay) = calculator_relay(&counter, RelayOptions::default());
    let (_server, remote) = protocol_link(Arc::clone(&relay));

    let info = remote
        .request_service_channel(
            &calculator_moniker(),
            Default::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(relay.pending_requests(), 1);
    assert_eq!(counter.created(), 1);

    remote
        .cancel_service_request(info.request_id.unwrap())
        .await
        .unwrap();
    assert_eq!(relay.pending_requests(), 0);
    assert!(wait_until(Duration::from_secs(5), || counter.disposed() == 1).await);
}

#[tokio::test]
async fn test_client_target_reached_across_the_relay() {
    init_logging();

    let counter = Arc::new(InstanceCounter::default());
    let (_container, relay) = calculator_relay(&counter, RelayOptions::default());
    let (_server, remote) = protocol_link(relay);
    let cancel = CancellationToken::new();
    let (sink, received) = notification_sink();

    let client = RemoteServiceBrokerClient::connect(remote, None, &cancel)
        .await
        .unwrap();
    let proxy = client
        .get_proxy(
            &calculator_descriptor(),
            ServiceActivationOptions::default().with_client_rpc_target(sink),
            &cancel,
        )
        .await
        .unwrap()
        .unwrap();

    proxy
        .invoke("Notify", vec![json!("from the far side").into()])
        .await
        .unwrap();
    assert_eq!(*received.lock(), vec!["from the far side".to_string()]);
}

#[tokio::test]
async fn test_proffered_remote_broker_serves_and_forwards_events() {
    init_logging();

    let counter = Arc::new(InstanceCounter::default());
    let (far_container, relay) = calculator_relay(&counter, RelayOptions::default());
    let (_server, remote) = protocol_link(relay);

    let near_container = servicehub::ServiceContainer::new();
    near_container
        .register([(calculator_moniker(), ServiceRegistration::new(ServiceAudience::Process))])
        .unwrap();
    let proffer = near_container
        .proffer_remote_broker(
            remote,
            None,
            ServiceSource::OtherProcessOnSameMachine,
            Some(vec![calculator_moniker()]),
        )
        .await
        .unwrap();
    assert_eq!(
        near_container.proffer_source(&calculator_moniker()),
        Some(ServiceSource::OtherProcessOnSameMachine)
    );

    let near_view = view(&near_container, ServiceScope::Process);
    let mut events = near_view.availability_changed();
    let proxy = near_view
        .get_proxy(&calculator_descriptor(), Default::default(), &CancellationToken::new())
        .await
        .unwrap()
        .expect("calculator through the proffered broker");
    let sum: i64 = proxy.call("Add", vec![json!(1), json!(1)]).await.unwrap();
    assert_eq!(sum, 2);

    // A change on the far side shows up in the near container
    let extra = ServiceMoniker::new("extra");
    far_container
        .register([(extra.clone(), ServiceRegistration::new(ServiceAudience::LocalMachine))])
        .unwrap();
    let forwarded = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.impacted_services.contains(&extra) {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert!(!forwarded.other_services_impacted);

    proffer.dispose();
    assert_eq!(near_container.proffer_source(&calculator_moniker()), None);
    let gone = near_view
        .get_proxy(&calculator_descriptor(), Default::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
async fn test_remote_proffer_requires_registration() {
    init_logging();

    let counter = Arc::new(InstanceCounter::default());
    let (_far, relay) = calculator_relay(&counter, RelayOptions::default());
    let (_server, remote) = protocol_link(relay);

    let container = servicehub::ServiceContainer::new();
    let outcome = container
        .proffer_remote_broker(
            remote,
            None,
            ServiceSource::TrustedServer,
            Some(vec![ServiceMoniker::new("unregistered")]),
        )
        .await;
    assert!(matches!(outcome, Err(ServiceHubError::NotRegistered(_))));
}
