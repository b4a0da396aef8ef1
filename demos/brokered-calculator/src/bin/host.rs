//! Calculator Host
//!
//! Run with: cargo run --bin calculator-host -- --pipe servicehub-calculator

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use hubrpc::{ConnectionOptions, PipeServer, PipeServerOptions, RpcConnection};
use servicehub::{
    serve_remote_broker, CredentialsPolicy, RelayOptions, RemoteServiceBrokerRelay, ServiceScope,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use brokered_calculator::{host_container, DEFAULT_PIPE};

#[derive(Parser)]
#[command(name = "calculator-host")]
#[command(about = "Serves the brokered calculator to other processes")]
struct Args {
    /// Pipe the remote broker protocol listens on
    #[arg(short, long, default_value = DEFAULT_PIPE)]
    pipe: String,
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

    let container = host_container("calculator-host")?;
    let view = container.get_view(
        ServiceScope::LocalMachine,
        HashMap::new(),
        CredentialsPolicy::RequestOverridesDefault,
    )?;
    let relay = RemoteServiceBrokerRelay::new(view, RelayOptions::default());

    let server = PipeServer::start(args.pipe.clone(), PipeServerOptions::default(), move |pipe| {
        let relay = Arc::clone(&relay);
        async move {
            let connection =
                RpcConnection::with_options(pipe, ConnectionOptions::named("broker-client"));
            serve_remote_broker(&connection, relay);
            connection.start_listening();
            info!("Broker client connected");
            connection.wait_closed().await;
            info!("Broker client disconnected");
        }
    })?;

    info!("Calculator host listening on pipe {}", args.pipe);
    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    server.shutdown().await;
    Ok(())
}
