//! Stress Tests - Concurrency Against Shared Brokers
//!
//! These tests look for races in the hub by:
//! - Requesting many proxies at once from one container
//! - Piling requests onto one slow activation
//! - Pushing concurrent requests through a relay
//! - Churning registrations while services are being requested

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::Barrier;

use common::*;
use hubrpc::{CancellationToken, ObjectProxy, ObjectProxyExt};
use serde_json::json;
use servicehub::{
    RelayOptions, RemoteServiceBrokerClient, ServiceAudience, ServiceBroker, ServiceContainer,
    ServiceMoniker, ServiceRegistration, ServiceScope,
};

fn print_stats(title: &str, expected: u64, stats: &ConcurrentStats) {
    println!("\n=== {} ===", title);
    println!("Expected: {}", expected);
    println!("Successful: {}", stats.success_count());
    println!("Failed: {}", stats.failure_count());
    println!("Avg latency: {:?}", stats.avg_latency());
    println!("Min latency: {:?}", stats.min_latency());
    println!("Max latency: {:?}", stats.max_latency());
}

/// Test: many clients asking one container for proxies at once
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_local_proxies() {
    init_logging();

    const NUM_CLIENTS: usize = 64;
    const CALLS_PER_CLIENT: i64 = 20;

    let counter = Arc::new(InstanceCounter::default());
    let container = container_with_calculator(ServiceAudience::Process, Arc::clone(&counter));
    let view = view(&container, ServiceScope::Process);
    let stats = Arc::new(ConcurrentStats::new());
    let barrier = Arc::new(Barrier::new(NUM_CLIENTS));

    let clients = (0..NUM_CLIENTS).map(|client_id| {
        let view = Arc::clone(&view);
        let stats = Arc::clone(&stats);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            barrier.wait().await;
            let proxy = match view
                .get_proxy(&calculator_descriptor(), Default::default(), &CancellationToken::new())
                .await
            {
                Ok(Some(proxy)) => proxy,
                other => {
                    eprintln!("Client {} got no proxy: {:?}", client_id, other.err());
                    stats.record_failure();
                    return;
                }
            };
            for i in 0..CALLS_PER_CLIENT {
                let start = Instant::now();
                match proxy.call::<i64>("Add", vec![json!(client_id), json!(i)]).await {
                    Ok(sum) if sum == client_id as i64 + i => stats.record_success(start.elapsed()),
                    _ => stats.record_failure(),
                }
            }
            proxy.dispose();
        })
    });
    join_all(clients).await;

    let expected = NUM_CLIENTS as u64 * CALLS_PER_CLIENT as u64;
    print_stats("Concurrent Local Proxies", expected, &stats);
    assert_eq!(stats.success_count(), expected);
    assert_eq!(counter.created(), NUM_CLIENTS as u32);
    assert_eq!(counter.disposed(), NUM_CLIENTS as u32);
}

/// Test: a slow activation shared by a crowd of waiters
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_activation_storm_runs_callback_once() {
    init_logging();

    const NUM_CLIENTS: usize = 100;

    let activations = Arc::new(AtomicU32::new(0));
    let counter = Arc::new(InstanceCounter::default());
    let container = ServiceContainer::new();
    {
        let activations = Arc::clone(&activations);
        let counter = Arc::clone(&counter);
        container
            .register([(
                calculator_moniker(),
                ServiceRegistration::new(ServiceAudience::Process).with_activation(
                    move |container, _moniker| {
                        let activations = Arc::clone(&activations);
                        let counter = Arc::clone(&counter);
                        async move {
                            activations.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            container.proffer_factory(calculator_descriptor(), move |_, _, _, _| {
                                let counter = Arc::clone(&counter);
                                async move { Ok(Some(calculator(counter, None))) }
                            })?;
                            Ok(())
                        }
                    },
                ),
            )])
            .unwrap();
    }

    let view = view(&container, ServiceScope::Process);
    let requests = (0..NUM_CLIENTS).map(|_| {
        let view = Arc::clone(&view);
        tokio::spawn(async move {
            view.get_proxy(&calculator_descriptor(), Default::default(), &CancellationToken::new())
                .await
        })
    });
    let outcomes = join_all(requests).await;

    let served = outcomes
        .into_iter()
        .filter(|outcome| matches!(outcome, Ok(Ok(Some(_)))))
        .count();
    assert_eq!(served, NUM_CLIENTS);
    assert_eq!(activations.load(Ordering::SeqCst), 1);
    assert_eq!(counter.created(), NUM_CLIENTS as u32);
}

/// Test: concurrent requests through one multiplexed relay
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_multiplexed_relay_requests() {
    init_logging();

    const NUM_CLIENTS: usize = 32;
    const CALLS_PER_CLIENT: i64 = 10;

    let (near, far) = multiplexed_pair().await;
    let counter = Arc::new(InstanceCounter::default());
    let (_container, relay) =
        calculator_relay(&counter, RelayOptions::multiplexed(near.clone(), false));
    let (_server, remote) = protocol_link(Arc::clone(&relay));
    let client = RemoteServiceBrokerClient::connect(remote, Some(far), &CancellationToken::new())
        .await
        .unwrap();

    let stats = Arc::new(ConcurrentStats::new());
    let barrier = Arc::new(Barrier::new(NUM_CLIENTS));
    let clients = (0..NUM_CLIENTS).map(|client_id| {
        let client = Arc::clone(&client);
        let stats = Arc::clone(&stats);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            barrier.wait().await;
            let proxy = match client
                .get_proxy(&calculator_descriptor(), Default::default(), &CancellationToken::new())
                .await
            {
                Ok(Some(proxy)) => proxy,
                Ok(None) => {
                    eprintln!("Client {}: calculator unavailable", client_id);
                    stats.record_failure();
                    return;
                }
                Err(e) => {
                    eprintln!("Client {} failed: {}", client_id, e);
                    stats.record_failure();
                    return;
                }
            };
            for i in 0..CALLS_PER_CLIENT {
                let start = Instant::now();
                match proxy.call::<i64>("Add", vec![json!(i), json!(i)]).await {
                    Ok(sum) if sum == 2 * i => stats.record_success(start.elapsed()),
                    _ => stats.record_failure(),
                }
            }
            proxy.dispose();
        })
    });
    join_all(clients).await;

    let expected = NUM_CLIENTS as u64 * CALLS_PER_CLIENT as u64;
    print_stats("Concurrent Multiplexed Relay Requests", expected, &stats);
    assert_eq!(stats.success_count(), expected);
    assert_eq!(relay.pending_requests(), 0);
    assert!(
        wait_until(Duration::from_secs(10), || counter.disposed() == NUM_CLIENTS as u32).await
    );
}

/// Test: registrations churn while the calculator is being requested
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registration_churn_under_load() {
    init_logging();

    const ROUNDS: usize = 200;

    let counter = Arc::new(InstanceCounter::default());
    let container = container_with_calculator(ServiceAudience::Process, Arc::clone(&counter));
    let view = view(&container, ServiceScope::Process);
    let mut events = view.availability_changed();
    let stop = Arc::new(AtomicBool::new(false));

    let churn = {
        let container = Arc::clone(&container);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut rounds = 0;
            while !stop.load(Ordering::SeqCst) {
                let moniker = ServiceMoniker::new(format!("transient-{}", rounds % 8));
                let handle = container
                    .register([(moniker, ServiceRegistration::new(ServiceAudience::Process))])
                    .expect("transient monikers are never registered twice");
                tokio::task::yield_now().await;
                handle.dispose();
                rounds += 1;
            }
            rounds
        })
    };

    let stats = ConcurrentStats::new();
    for _ in 0..ROUNDS {
        let start = Instant::now();
        let outcome = view
            .get_proxy(&calculator_descriptor(), Default::default(), &CancellationToken::new())
            .await;
        match outcome {
            Ok(Some(proxy)) => {
                stats.record_success(start.elapsed());
                proxy.dispose();
            }
            _ => stats.record_failure(),
        }
    }
    stop.store(true, Ordering::SeqCst);
    let rounds = churn.await.unwrap();

    print_stats("Registration Churn", ROUNDS as u64, &stats);
    assert_eq!(stats.success_count(), ROUNDS as u64);
    assert!(rounds > 0);
    // Churn can outpace the event channel; lagging is fine, silence is not
    assert!(!matches!(events.try_recv(), Err(TryRecvError::Empty)));
}
