//! Marshaling Tests - Objects Passed by Reference Through Brokered Pipes
//!
//! A brokered "observable" service receives callback objects from its client
//! and hands out objects of its own. Covered here:
//! - Callbacks through the `Async` alias
//! - Identity of objects the peer sends back
//! - Release notifications in both directions
//! - Teardown when the connection closes

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use hubrpc::{
    arg, CancellationToken, LocalTarget, MarshalableTarget, ObjectProxy, RpcConnection, RpcError,
    RpcValue,
};
use parking_lot::Mutex;
use serde_json::json;
use servicehub::{
    ObjectMarshaler, ServiceAudience, ServiceBroker, ServiceContainer, ServiceMoniker,
    ServiceRegistration, ServiceRpcDescriptor, ServiceScope,
};

const OBSERVABLE: &str = "observable";

fn observable_descriptor() -> ServiceRpcDescriptor {
    ServiceRpcDescriptor::new(ServiceMoniker::new(OBSERVABLE))
}

/// What the observable service saw
#[derive(Default)]
struct ObservableState {
    observers: Mutex<Vec<Arc<dyn ObjectProxy>>>,
    counters_disposed: AtomicU32,
}

impl ObservableState {
    fn observer(&self, index: usize) -> Option<Arc<dyn ObjectProxy>> {
        self.observers.lock().get(index).cloned()
    }
}

fn counter_object(state: Arc<ObservableState>) -> Arc<LocalTarget> {
    let value = Arc::new(AtomicU32::new(0));
    LocalTarget::builder("counter")
        .method("Increment", move |_| {
            let value = Arc::clone(&value);
            async move { Ok(RpcValue::from(json!(value.fetch_add(1, Ordering::SeqCst) + 1))) }
        })
        .on_dispose(move || {
            state.counters_disposed.fetch_add(1, Ordering::SeqCst);
        })
        .build()
}

fn observable(state: Arc<ObservableState>) -> Arc<LocalTarget> {
    let subscribe = Arc::clone(&state);
    let publish = Arc::clone(&state);
    let unsubscribe = Arc::clone(&state);
    let create = state;
    LocalTarget::builder(OBSERVABLE)
        .method("Subscribe", move |args| {
            let state = Arc::clone(&subscribe);
            async move {
                let observer = arg(&args, 0)
                    .as_proxy()
                    .cloned()
                    .ok_or_else(|| RpcError::InvalidParams("expected an observer".into()))?;
                state.observers.lock().push(observer);
                Ok(RpcValue::null())
            }
        })
        .method("Publish", move |args| {
            let state = Arc::clone(&publish);
            async move {
                let value = arg(&args, 0);
                let observers: Vec<_> = state.observers.lock().clone();
                for observer in &observers {
                    observer.invoke("OnNextAsync", vec![value.clone()]).await?;
                }
                Ok(RpcValue::from(json!(observers.len())))
            }
        })
        .method("Unsubscribe", move |_| {
            let state = Arc::clone(&unsubscribe);
            async move {
                let observers: Vec<_> = state.observers.lock().drain(..).collect();
                for observer in observers {
                    observer.dispose();
                }
                Ok(RpcValue::null())
            }
        })
        .method("Echo", |args| async move { Ok(arg(&args, 0)) })
        .method("CreateCounter", move |_| {
            let state = Arc::clone(&create);
            async move { Ok(RpcValue::from(MarshalableTarget::explicit(counter_object(state)))) }
        })
        .build()
}

/// Client observer recording `OnNext` values and its own disposal
fn observer() -> (Arc<LocalTarget>, Arc<Mutex<Vec<i64>>>, Arc<AtomicBool>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let disposed = Arc::new(AtomicBool::new(false));
    let sink = Arc::clone(&seen);
    let flag = Arc::clone(&disposed);
    let target = LocalTarget::builder("observer")
        .method("OnNext", move |args| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(arg(&args, 0).deserialize()?);
                Ok(RpcValue::null())
            }
        })
        .on_dispose(move || flag.store(true, Ordering::SeqCst))
        .build();
    (target, seen, disposed)
}

struct Session {
    _container: Arc<ServiceContainer>,
    state: Arc<ObservableState>,
    connection: Arc<RpcConnection>,
}

impl Session {
    fn marshaler(&self) -> Arc<ObjectMarshaler> {
        ObjectMarshaler::for_connection(&self.connection).expect("marshaler installed")
    }
}

/// Broker a pipe to the observable service and connect to it
async fn open_session(client_descriptor: ServiceRpcDescriptor) -> Session {
    let state = Arc::new(ObservableState::default());
    let container = ServiceContainer::new();
    container
        .register([(
            ServiceMoniker::new(OBSERVABLE),
            ServiceRegistration::new(ServiceAudience::Process),
        )])
        .unwrap();
    let factory_state = Arc::clone(&state);
    container
        .proffer_factory(observable_descriptor(), move |_, _, _, _| {
            let state = Arc::clone(&factory_state);
            async move { Ok(Some(observable(state))) }
        })
        .unwrap();

    let pipe = view(&container, ServiceScope::Process)
        .get_pipe(
            &ServiceMoniker::new(OBSERVABLE),
            Default::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
        .expect("observable pipe");
    let connection = client_descriptor.construct_connection(pipe);
    connection.start_listening();
    Session {
        _container: container,
        state,
        connection,
    }
}

#[tokio::test]
async fn test_service_calls_back_through_async_alias() {
    init_logging();

    let session = open_session(observable_descriptor()).await;
    let (target, seen, _) = observer();
    session
        .connection
        .invoke("Subscribe", vec![MarshalableTarget::explicit(target).into()])
        .await
        .unwrap();

    for value in [1, 2, 3] {
        let notified = session
            .connection
            .invoke("Publish", vec![json!(value).into()])
            .await
            .unwrap();
        assert_eq!(notified.as_json(), Some(&json!(1)));
    }
    assert_eq!(*seen.lock(), vec![1, 2, 3]);
    assert_eq!(session.marshaler().export_count(), 1);
}

#[tokio::test]
async fn test_object_sent_back_is_the_original() {
    init_logging();

    let session = open_session(observable_descriptor()).await;
    let (target, _, _) = observer();
    let returned = session
        .connection
        .invoke(
            "Echo",
            vec![MarshalableTarget::explicit(Arc::clone(&target)).into()],
        )
        .await
        .unwrap();

    let original = returned.as_target().expect("local object, not a proxy");
    assert!(Arc::ptr_eq(&original.target, &target));
}

#[tokio::test]
async fn test_service_release_disposes_client_object() {
    init_logging();

    let session = open_session(observable_descriptor()).await;
    let (target, _, disposed) = observer();
    session
        .connection
        .invoke("Subscribe", vec![MarshalableTarget::explicit(target).into()])
        .await
        .unwrap();
    session.connection.invoke("Unsubscribe", vec![]).await.unwrap();

    assert!(wait_until(Duration::from_secs(5), || disposed.load(Ordering::SeqCst)).await);
    assert_eq!(session.marshaler().export_count(), 0);
}

#[tokio::test]
async fn test_service_objects_are_released_by_the_client() {
    init_logging();

    let session = open_session(observable_descriptor()).await;
    let counter = session
        .connection
        .invoke("CreateCounter", vec![])
        .await
        .unwrap();
    let counter = counter.as_proxy().cloned().expect("proxy to the counter");

    for expected in 1..=3 {
        let value = counter.invoke("IncrementAsync", vec![]).await.unwrap();
        assert_eq!(value.as_json(), Some(&json!(expected)));
    }
    assert_eq!(session.marshaler().import_count(), 1);

    counter.dispose();
    assert_eq!(session.marshaler().import_count(), 0);
    assert!(matches!(
        counter.invoke("Increment", vec![]).await,
        Err(RpcError::ObjectDisposed(_))
    ));
    let state = Arc::clone(&session.state);
    assert!(
        wait_until(Duration::from_secs(5), || {
            state.counters_disposed.load(Ordering::SeqCst) == 1
        })
        .await
    );
}

#[tokio::test]
async fn test_failed_call_unregisters_new_export() {
    init_logging();

    let session = open_session(observable_descriptor()).await;
    let (target, _, disposed) = observer();
    let outcome = session
        .connection
        .invoke("NoSuchMethod", vec![MarshalableTarget::explicit(target).into()])
        .await;
    assert!(outcome.is_err());
    assert_eq!(session.marshaler().export_count(), 0);
    // The caller still owns an object the peer never received
    assert!(!disposed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_closing_connection_tears_down_both_sides() {
    init_logging();

    let session = open_session(observable_descriptor()).await;
    let (target, _, disposed) = observer();
    session
        .connection
        .invoke("Subscribe", vec![MarshalableTarget::explicit(target).into()])
        .await
        .unwrap();
    let remote_view = session.state.observer(0).expect("service holds the observer");
    assert!(!remote_view.is_disposed());

    session.connection.dispose();
    assert!(disposed.load(Ordering::SeqCst));
    assert_eq!(session.marshaler().export_count(), 0);
    assert!(wait_until(Duration::from_secs(5), || remote_view.is_disposed()).await);
}

#[tokio::test]
async fn test_objects_rejected_without_marshaling() {
    init_logging();

    let session = open_session(observable_descriptor().with_marshaled_objects(false)).await;
    let (target, _, _) = observer();
    let outcome = session
        .connection
        .invoke("Subscribe", vec![MarshalableTarget::explicit(target).into()])
        .await;
    assert!(matches!(outcome, Err(RpcError::NotMarshalable(_))));
    assert!(ObjectMarshaler::for_connection(&session.connection).is_none());
}
