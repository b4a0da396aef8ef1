//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use hubrpc::{
    arg, boxed, ConnectionOptions, LocalTarget, MultiplexingOptions, MultiplexingStream,
    RpcConnection, RpcValue,
};
use parking_lot::Mutex;
use serde_json::json;
use servicehub::{
    serve_remote_broker, CredentialsPolicy, RelayOptions, RemoteServiceBrokerProxy,
    RemoteServiceBrokerRelay, ServiceActivationOptions, ServiceAudience, ServiceBrokerView,
    ServiceContainer, ServiceMoniker, ServiceRegistration, ServiceRpcDescriptor, ServiceScope,
};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub const CALCULATOR: &str = "calculator";

pub fn calculator_moniker() -> ServiceMoniker {
    ServiceMoniker::new(CALCULATOR)
}

pub fn calculator_descriptor() -> ServiceRpcDescriptor {
    ServiceRpcDescriptor::new(calculator_moniker())
}

/// Counts instances the calculator factory created and disposed
#[derive(Default)]
pub struct InstanceCounter {
    pub created: AtomicU32,
    pub disposed: AtomicU32,
}

impl InstanceCounter {
    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> u32 {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// A calculator with `Add`, `Divide` and `Notify(callbackMethod)`
///
/// `Notify` calls back into the client RPC target if one was supplied.
pub fn calculator(
    counter: Arc<InstanceCounter>,
    client: Option<servicehub::ClientRpcTarget>,
) -> Arc<LocalTarget> {
    counter.created.fetch_add(1, Ordering::SeqCst);
    let disposed = Arc::clone(&counter);
    LocalTarget::builder(CALCULATOR)
        .method("Add", |args| async move {
            let a: i64 = arg(&args, 0).deserialize()?;
            let b: i64 = arg(&args, 1).deserialize()?;
            Ok(RpcValue::from(json!(a + b)))
        })
        .method("Divide", |args| async move {
            let a: i64 = arg(&args, 0).deserialize()?;
            let b: i64 = arg(&args, 1).deserialize()?;
            if b == 0 {
                return Err(hubrpc::RpcError::Invocation("division by zero".to_string()));
            }
            Ok(RpcValue::from(json!(a / b)))
        })
        .method("Notify", move |args| {
            let client = client.clone();
            async move {
                let message: String = arg(&args, 0).deserialize()?;
                match client {
                    Some(client) => client.invoke("OnNotified", vec![json!(message).into()]).await,
                    None => Ok(RpcValue::null()),
                }
            }
        })
        .on_dispose(move || {
            disposed.disposed.fetch_add(1, Ordering::SeqCst);
        })
        .build()
}

/// Register the calculator for `audience` and proffer its factory
pub fn container_with_calculator(
    audience: ServiceAudience,
    counter: Arc<InstanceCounter>,
) -> Arc<ServiceContainer> {
    let container = ServiceContainer::new();
    container
        .register([(calculator_moniker(), ServiceRegistration::new(audience))])
        .expect("register calculator");
    container
        .proffer_factory(
            calculator_descriptor(),
            move |_, options: ServiceActivationOptions, _, _| {
                let counter = Arc::clone(&counter);
                async move { Ok(Some(calculator(counter, options.client_rpc_target))) }
            },
        )
        .expect("proffer calculator");
    container
}

pub fn view(container: &Arc<ServiceContainer>, scope: ServiceScope) -> Arc<ServiceBrokerView> {
    container
        .get_view(scope, HashMap::new(), CredentialsPolicy::RequestOverridesDefault)
        .expect("view")
}

/// Client target recording every `OnNotified` message
pub fn notification_sink() -> (Arc<LocalTarget>, Arc<Mutex<Vec<String>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let target = LocalTarget::builder("notifications")
        .method("OnNotified", move |args| {
            let sink = Arc::clone(&sink);
            async move {
                let message: String = arg(&args, 0).deserialize()?;
                sink.lock().push(message);
                Ok(RpcValue::null())
            }
        })
        .build();
    (target, received)
}

/// Two connected multiplexing streams over an in-memory pipe
pub async fn multiplexed_pair() -> (MultiplexingStream, MultiplexingStream) {
    let (near, far) = tokio::io::duplex(256 * 1024);
    let (a, b) = tokio::join!(
        MultiplexingStream::create(boxed(near), MultiplexingOptions::named("near")),
        MultiplexingStream::create(boxed(far), MultiplexingOptions::named("far")),
    );
    (a.expect("near stream"), b.expect("far stream"))
}

/// Serve `relay` over an in-memory protocol connection
///
/// Returns the relay-side connection and the client-side protocol proxy.
pub fn protocol_link(
    relay: Arc<RemoteServiceBrokerRelay>,
) -> (Arc<RpcConnection>, Arc<RemoteServiceBrokerProxy>) {
    let (server_end, client_end) = tokio::io::duplex(64 * 1024);
    let server =
        RpcConnection::with_options(boxed(server_end), ConnectionOptions::named("relay"));
    serve_remote_broker(&server, relay);
    server.start_listening();
    (server, RemoteServiceBrokerProxy::over_pipe(boxed(client_end)))
}

/// Calculator container served through a relay over a `LocalMachine` view
pub fn calculator_relay(
    counter: &Arc<InstanceCounter>,
    options: RelayOptions,
) -> (Arc<ServiceContainer>, Arc<RemoteServiceBrokerRelay>) {
    let container =
        container_with_calculator(ServiceAudience::LocalMachine, Arc::clone(counter));
    let relay =
        RemoteServiceBrokerRelay::new(view(&container, ServiceScope::LocalMachine), options);
    (container, relay)
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Success/failure counters and latency extremes for load tests
pub struct ConcurrentStats {
    success: AtomicU64,
    failure: AtomicU64,
    total_latency_us: AtomicU64,
    min_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

impl ConcurrentStats {
    pub fn new() -> Self {
        Self {
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            min_latency_us: AtomicU64::new(u64::MAX),
            max_latency_us: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        let us = latency.as_micros() as u64;
        self.success.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(us, Ordering::Relaxed);
        self.min_latency_us.fetch_min(us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }

    pub fn avg_latency(&self) -> Duration {
        let n = self.success_count();
        if n == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_latency_us.load(Ordering::Relaxed) / n)
    }

    pub fn min_latency(&self) -> Duration {
        match self.min_latency_us.load(Ordering::Relaxed) {
            u64::MAX => Duration::ZERO,
            us => Duration::from_micros(us),
        }
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_micros(self.max_latency_us.load(Ordering::Relaxed))
    }
}

/// Outcome of the whole suite, printed by the runner
#[derive(Debug, Default)]
pub struct TestSuiteResults {
    pub passed: usize,
    pub failed: usize,
    pub durations: Vec<(String, Duration)>,
}

impl TestSuiteResults {
    pub fn record(&mut self, name: &str, success: bool, duration: Duration) {
        if success {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.durations.push((name.to_string(), duration));
    }

    pub fn total(&self) -> Duration {
        self.durations.iter().map(|(_, d)| *d).sum()
    }
}
