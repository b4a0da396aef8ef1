//! Local pipe listener and connector
//!
//! On Unix a pipe is a Unix domain socket in the temp directory; on Windows
//! it is a named pipe under `\\.\pipe\`.
//!
//! # Listener behavior
//!
//! - accept errors are retried up to `max_accept_retries` times
//! - after that the endpoint is recreated, up to `max_recreate_attempts`
//!   times per failure episode, then the listener stops with an error log;
//!   a successful accept ends the episode
//! - each client is handed to the callback in its own task, limited by a
//!   semaphore, unless the server is single-client
//! - shutdown waits for running callbacks, bounded by `shutdown_timeout`

use crate::error::{Result, RpcError};
use crate::transport::{boxed, DuplexPipe};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pipe server configuration
#[derive(Debug, Clone)]
pub struct PipeServerOptions {
    /// Stop listening after the first client connects
    pub single_client: bool,
    pub max_accept_retries: u32,
    pub max_recreate_attempts: u32,
    pub retry_delay: Duration,
    pub shutdown_timeout: Duration,
    pub max_connections: usize,
}

impl Default for PipeServerOptions {
    fn default() -> Self {
        Self {
            single_client: false,
            max_accept_retries: 3,
            max_recreate_attempts: 3,
            retry_delay: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
            max_connections: 1024,
        }
    }
}

impl PipeServerOptions {
    /// Options for a server that accepts exactly one client
    pub fn single_client() -> Self {
        Self {
            single_client: true,
            max_connections: 1,
            ..Default::default()
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Callback invoked for each connected client
pub type PipeCallback = Arc<dyn Fn(DuplexPipe) -> BoxFuture<'static, ()> + Send + Sync>;

/// Generate a fresh, unique pipe name
pub fn unique_pipe_name() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Platform address of the pipe called `name`
#[cfg(unix)]
pub fn pipe_path(name: &str) -> String {
    std::env::temp_dir()
        .join(format!("{}.sock", name))
        .to_string_lossy()
        .into_owned()
}

/// Platform address of the pipe called `name`
#[cfg(windows)]
pub fn pipe_path(name: &str) -> String {
    format!(r"\\.\pipe\{}", name)
}

/// Connect to the pipe called `name`
#[cfg(unix)]
pub async fn connect_pipe(name: &str) -> Result<DuplexPipe> {
    let stream = tokio::net::UnixStream::connect(pipe_path(name)).await?;
    Ok(boxed(stream))
}

/// Connect to the pipe called `name`
#[cfg(windows)]
pub async fn connect_pipe(name: &str) -> Result<DuplexPipe> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new().open(pipe_path(name))?;
    Ok(boxed(client))
}

/// Source of client connections for the accept loop
#[async_trait]
trait Listener: Send + 'static {
    async fn accept(&mut self) -> std::io::Result<DuplexPipe>;
}

#[cfg(unix)]
struct Endpoint {
    listener: tokio::net::UnixListener,
    path: String,
}

#[cfg(unix)]
impl Endpoint {
    fn bind(name: &str) -> std::io::Result<Self> {
        let path = pipe_path(name);
        // A stale socket file from a crashed process blocks bind
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for Endpoint {
    async fn accept(&mut self) -> std::io::Result<DuplexPipe> {
        let (stream, _) = self.listener.accept().await?;
        Ok(boxed(stream))
    }
}

#[cfg(unix)]
impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(windows)]
struct Endpoint {
    next: tokio::net::windows::named_pipe::NamedPipeServer,
    path: String,
}

#[cfg(windows)]
impl Endpoint {
    fn bind(name: &str) -> std::io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let path = pipe_path(name);
        let next = ServerOptions::new().first_pipe_instance(true).create(&path)?;
        Ok(Self { next, path })
    }
}

#[cfg(windows)]
#[async_trait]
impl Listener for Endpoint {
    async fn accept(&mut self) -> std::io::Result<DuplexPipe> {
        use tokio::net::windows::named_pipe::ServerOptions;
        self.next.connect().await?;
        let next = ServerOptions::new().create(&self.path)?;
        let connected = std::mem::replace(&mut self.next, next);
        Ok(boxed(connected))
    }
}

/// Accepts clients on a named local pipe
pub struct PipeServer {
    name: String,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    accepted: Arc<AtomicU64>,
}

impl PipeServer {
    /// Create the pipe and start accepting clients
    ///
    /// The pipe exists when this returns, so clients may connect right away.
    pub fn start<F, Fut>(
        name: impl Into<String>,
        options: PipeServerOptions,
        on_connect: F,
    ) -> Result<Arc<Self>>
    where
        F: Fn(DuplexPipe) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let endpoint = Endpoint::bind(&name)
            .map_err(|e| RpcError::Listener(format!("cannot create pipe {}: {}", name, e)))?;
        let callback: PipeCallback = Arc::new(move |pipe| on_connect(pipe).boxed());
        Ok(Self::spawn(name, endpoint, Endpoint::bind, options, callback))
    }

    fn spawn<L, B>(
        name: String,
        endpoint: L,
        rebind: B,
        options: PipeServerOptions,
        callback: PipeCallback,
    ) -> Arc<Self>
    where
        L: Listener,
        B: Fn(&str) -> std::io::Result<L> + Send + 'static,
    {
        let server = Arc::new(Self {
            name: name.clone(),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            accepted: Arc::new(AtomicU64::new(0)),
        });

        info!(
            "Pipe server listening on {} (single_client: {})",
            name, options.single_client
        );

        tokio::spawn(accept_loop(
            name,
            endpoint,
            rebind,
            options,
            callback,
            server.shutdown.clone(),
            server.stopped.clone(),
            Arc::clone(&server.accepted),
        ));

        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of clients accepted so far
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Stop accepting clients
    pub fn dispose(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the accept loop has exited
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Stop accepting and wait for the graceful shutdown to finish
    pub async fn shutdown(&self) {
        self.dispose();
        self.stopped().await
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_with_retries<L: Listener>(
    endpoint: &mut L,
    options: &PipeServerOptions,
    name: &str,
) -> std::io::Result<DuplexPipe> {
    let mut attempt = 0;
    loop {
        match endpoint.accept().await {
            Ok(pipe) => return Ok(pipe),
            Err(e) if attempt < options.max_accept_retries => {
                attempt += 1;
                warn!(
                    "Accept on pipe {} failed (attempt {}/{}): {}",
                    name, attempt, options.max_accept_retries, e
                );
                tokio::time::sleep(options.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop<L, B>(
    name: String,
    endpoint: L,
    rebind: B,
    options: PipeServerOptions,
    callback: PipeCallback,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    accepted: Arc<AtomicU64>,
) where
    L: Listener,
    B: Fn(&str) -> std::io::Result<L>,
{
    let semaphore = Arc::new(Semaphore::new(options.max_connections));
    let mut endpoint = Some(endpoint);
    let mut recreations = 0;

    loop {
        if endpoint.is_none() {
            match rebind(&name) {
                Ok(fresh) => endpoint = Some(fresh),
                Err(e) => {
                    recreations += 1;
                    if recreations > options.max_recreate_attempts {
                        error!("Giving up on pipe {}: cannot recreate endpoint: {}", name, e);
                        break;
                    }
                    warn!("Recreating pipe {} failed: {}", name, e);
                    tokio::time::sleep(options.retry_delay).await;
                    continue;
                }
            }
        }
        let Some(current) = endpoint.as_mut() else {
            continue;
        };

        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            outcome = accept_with_retries(current, &options, &name) => outcome,
        };

        let pipe = match outcome {
            Ok(pipe) => {
                recreations = 0;
                pipe
            }
            Err(e) => {
                recreations += 1;
                if recreations > options.max_recreate_attempts {
                    error!(
                        "Giving up on pipe {} after {} endpoint recreations: {}",
                        name, options.max_recreate_attempts, e
                    );
                    break;
                }
                warn!("Accept retries exhausted on pipe {}, recreating endpoint: {}", name, e);
                endpoint = None;
                continue;
            }
        };

        let permit = match Arc::clone(&semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Connection limit reached on pipe {}, rejecting client", name);
                drop(pipe);
                continue;
            }
        };

        accepted.fetch_add(1, Ordering::Relaxed);
        debug!("Accepted client on pipe {}", name);

        let callback = Arc::clone(&callback);
        tokio::spawn(async move {
            let _permit = permit;
            callback(pipe).await;
        });

        if options.single_client {
            break;
        }
    }

    // Single-client servers stop listening as soon as the client is in
    drop(endpoint);

    let drain = semaphore.acquire_many(options.max_connections as u32);
    if tokio::time::timeout(options.shutdown_timeout, drain).await.is_err() {
        debug!("Pipe {} stopped with connections still running", name);
    }
    info!("Pipe server {} stopped", name);
    stopped.cancel();
}
