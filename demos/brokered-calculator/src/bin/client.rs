//! Calculator Client
//!
//! Run with:
//!   cargo run --bin calculator-client -- --mode remote --pipe servicehub-calculator
//!   cargo run --bin calculator-client -- --mode local
//!   cargo run --bin calculator-client -- --mode multiplexed

use std::collections::HashMap;

use clap::{Parser, ValueEnum};
use hubrpc::{
    boxed, connect_pipe, CancellationToken, ConnectionOptions, MultiplexingOptions,
    MultiplexingStream, RpcConnection,
};
use servicehub::{
    serve_remote_broker, CredentialsPolicy, RelayOptions, RemoteServiceBrokerClient,
    RemoteServiceBrokerProxy, RemoteServiceBrokerRelay, ServiceBroker, ServiceBrokerExt,
    ServiceScope,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use brokered_calculator::{calculator_descriptor, host_container, CalculatorClient, DEFAULT_PIPE};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Connect to a running calculator-host over its pipe
    Remote,
    /// Use an in-process container directly
    Local,
    /// Relay an in-process container over an in-memory multiplexing stream
    Multiplexed,
}

#[derive(Parser)]
#[command(name = "calculator-client")]
#[command(about = "Calls the brokered calculator")]
struct Args {
    #[arg(short, long, value_enum, default_value_t = Mode::Remote)]
    mode: Mode,

    /// Pipe of the calculator host (remote mode)
    #[arg(short, long, default_value = DEFAULT_PIPE)]
    pipe: String,

    /// First operand
    #[arg(short, long, default_value = "84")]
    a: i64,

    /// Second operand
    #[arg(short, long, default_value = "5")]
    b: i64,
}

async fn exercise<B>(broker: &B, a: i64, b: i64) -> Result<(), Box<dyn std::error::Error>>
where
    B: ServiceBroker + ?Sized,
{
    let calculator = broker
        .get_typed_proxy::<CalculatorClient>(
            &calculator_descriptor(),
            Default::default(),
            &CancellationToken::new(),
        )
        .await?
        .ok_or("calculator is not available")?;
    info!(
        "Got a {} calculator",
        if calculator.is_local() { "local" } else { "remote" }
    );

    info!("{} + {} = {}", a, b, calculator.add(a, b).await?);
    info!("{} - {} = {}", a, b, calculator.subtract(a, b).await?);
    info!("{} * {} = {}", a, b, calculator.multiply(a, b).await?);
    match calculator.divide(a, b).await {
        Ok(result) => info!(
            "{} / {} = {} remainder {}",
            a, b, result.quotient, result.remainder
        ),
        Err(e) => error!("{} / {} failed: {}", a, b, e),
    }

    calculator.dispose();
    Ok(())
}

async fn run_remote(pipe: &str, a: i64, b: i64) -> Result<(), Box<dyn std::error::Error>> {
    info!("Connecting to calculator host on pipe {}", pipe);
    let remote = RemoteServiceBrokerProxy::over_pipe(connect_pipe(pipe).await?);
    let client = RemoteServiceBrokerClient::connect(
        remote.clone(),
        None,
        &CancellationToken::new(),
    )
    .await?;
    let outcome = exercise(client.as_ref(), a, b).await;
    remote.dispose();
    outcome
}

async fn run_local(a: i64, b: i64) -> Result<(), Box<dyn std::error::Error>> {
    let container = host_container("calculator-local")?;
    let view = container.get_view(
        ServiceScope::Process,
        HashMap::new(),
        CredentialsPolicy::RequestOverridesDefault,
    )?;
    exercise(view.as_ref(), a, b).await
}

async fn run_multiplexed(a: i64, b: i64) -> Result<(), Box<dyn std::error::Error>> {
    let container = host_container("calculator-relayed")?;
    let view = container.get_view(
        ServiceScope::LocalMachine,
        HashMap::new(),
        CredentialsPolicy::RequestOverridesDefault,
    )?;

    // One stream carries every service channel
    let (near, far) = tokio::io::duplex(256 * 1024);
    let (host_stream, client_stream) = tokio::try_join!(
        MultiplexingStream::create(boxed(near), MultiplexingOptions::named("host")),
        MultiplexingStream::create(boxed(far), MultiplexingOptions::named("client")),
    )?;
    let relay = RemoteServiceBrokerRelay::new(view, RelayOptions::multiplexed(host_stream, true));

    // The broker protocol itself runs over a separate pipe
    let (host_end, client_end) = tokio::io::duplex(64 * 1024);
    let host =
        RpcConnection::with_options(boxed(host_end), ConnectionOptions::named("relay-host"));
    serve_remote_broker(&host, relay.clone());
    host.start_listening();

    let remote = RemoteServiceBrokerProxy::over_pipe(boxed(client_end));
    let client = RemoteServiceBrokerClient::connect(
        remote.clone(),
        Some(client_stream),
        &CancellationToken::new(),
    )
    .await?;
    let outcome = exercise(client.as_ref(), a, b).await;

    remote.dispose();
    relay.dispose();
    outcome
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    info!("Calculator client ({:?} mode)", args.mode);

    match args.mode {
        Mode::Remote => run_remote(&args.pipe, args.a, args.b).await,
        Mode::Local => run_local(args.a, args.b).await,
        Mode::Multiplexed => run_multiplexed(args.a, args.b).await,
    }
}
