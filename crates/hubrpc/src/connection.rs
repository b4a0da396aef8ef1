//! Point-to-point RPC connection
//!
//! An [`RpcConnection`] runs JSON-RPC over any duplex byte channel. Either
//! side may expose local methods and invoke the peer's methods.
//!
//! # Tasks
//!
//! - a writer task owns the write half and drains an unbounded frame queue,
//!   so notifications can be sent from synchronous code
//! - a reader task owns the read half, completes pending calls and spawns one
//!   task per inbound request
//!
//! Both tasks start with [`RpcConnection::start_listening`] and stop when the
//! connection is disposed or the peer goes away.

use crate::error::{Result, RpcError};
use crate::message::{ErrorObject, Message, RequestId};
use crate::proxy::RpcProxy;
use crate::target::{handler, LocalTarget, MethodHandler};
use crate::transport::{DuplexPipe, FrameTransport, DEFAULT_MAX_FRAME_SIZE};
use crate::value::RpcValue;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Converts object references to and from their wire form
///
/// Installed per connection; owns whatever per-connection state the
/// conversion needs and is told when calls finish and when the connection
/// closes.
pub trait ValueMarshaler: Send + Sync + 'static {
    /// Convert an outbound value. `call` is the request or notification
    /// the value is an argument of, `None` for return values.
    fn to_wire(
        &self,
        connection: &Arc<RpcConnection>,
        value: RpcValue,
        call: Option<RequestId>,
    ) -> Result<Value>;

    /// Convert an inbound value
    fn from_wire(&self, connection: &Arc<RpcConnection>, value: Value) -> Result<RpcValue>;

    /// Convert the arguments of an inbound request
    ///
    /// When one argument fails, nothing converted from the earlier ones may
    /// stay registered with the marshaler.
    fn args_from_wire(
        &self,
        connection: &Arc<RpcConnection>,
        params: Vec<Value>,
    ) -> Result<Vec<RpcValue>> {
        params
            .into_iter()
            .map(|param| self.from_wire(connection, param))
            .collect()
    }

    /// The outbound request `call` got a successful response, or the
    /// notification `call` was queued
    fn call_completed(&self, _connection: &Arc<RpcConnection>, _call: RequestId) {}

    /// The outbound request or notification `call` failed or was abandoned
    fn call_failed(&self, _connection: &Arc<RpcConnection>, _call: RequestId) {}

    /// The connection has been disposed
    fn connection_closed(&self, _connection: &RpcConnection) {}

    /// Cast to Any for downcasting
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// RPC connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Name used in log output
    pub name: String,
    /// Largest frame accepted or sent
    pub max_frame_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            name: "rpc".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ConnectionOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

type PendingCall = oneshot::Sender<Result<Value>>;

struct ConnectionIo {
    reader: FrameTransport<ReadHalf<DuplexPipe>>,
    writer: FrameTransport<WriteHalf<DuplexPipe>>,
    outbound_rx: mpsc::UnboundedReceiver<Bytes>,
}

/// JSON-RPC connection over a duplex byte channel
pub struct RpcConnection {
    id: u64,
    options: ConnectionOptions,
    self_ref: Weak<RpcConnection>,
    io: Mutex<Option<ConnectionIo>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    methods: RwLock<HashMap<String, MethodHandler>>,
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    next_request_id: AtomicU64,
    marshaler: RwLock<Option<Arc<dyn ValueMarshaler>>>,
    listening: AtomicBool,
    closed: CancellationToken,
}

impl RpcConnection {
    /// Create a connection over `pipe` with default options
    pub fn new(pipe: DuplexPipe) -> Arc<Self> {
        Self::with_options(pipe, ConnectionOptions::default())
    }

    /// Create a connection over `pipe`
    ///
    /// Nothing is read or written until [`start_listening`](Self::start_listening).
    pub fn with_options(pipe: DuplexPipe, options: ConnectionOptions) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(pipe);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let io = ConnectionIo {
            reader: FrameTransport::new(read_half).with_max_frame_size(options.max_frame_size),
            writer: FrameTransport::new(write_half).with_max_frame_size(options.max_frame_size),
            outbound_rx,
        };

        Arc::new_cyclic(|self_ref| Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            options,
            self_ref: self_ref.clone(),
            io: Mutex::new(Some(io)),
            outbound,
            methods: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            marshaler: RwLock::new(None),
            listening: AtomicBool::new(false),
            closed: CancellationToken::new(),
        })
    }

    /// Process-unique connection number, for diagnostics
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Expose every method of `target` to the peer
    pub fn add_local_target(&self, target: &Arc<LocalTarget>) {
        let mut methods = self.methods.write();
        for name in target.method_names() {
            let target = Arc::clone(target);
            let method = name.to_string();
            methods.insert(
                name.to_string(),
                handler(move |args| {
                    let target = Arc::clone(&target);
                    let method = method.clone();
                    async move { target.invoke(&method, args).await }
                }),
            );
        }
        debug!(
            "[{}#{}] added local target {}",
            self.options.name,
            self.id,
            target.name()
        );
    }

    /// Expose a single method to the peer, replacing any previous handler
    pub fn add_local_method(&self, name: impl Into<String>, handler: MethodHandler) {
        self.methods.write().insert(name.into(), handler);
    }

    /// Stop exposing a method; returns whether it existed
    pub fn remove_local_method(&self, name: &str) -> bool {
        self.methods.write().remove(name).is_some()
    }

    pub fn has_local_method(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    /// Install the object marshaler for this connection
    pub fn set_marshaler(&self, marshaler: Arc<dyn ValueMarshaler>) {
        *self.marshaler.write() = Some(marshaler);
    }

    pub fn marshaler(&self) -> Option<Arc<dyn ValueMarshaler>> {
        self.marshaler.read().clone()
    }

    /// Build a dynamic proxy for the peer's methods
    ///
    /// Disposing the proxy disposes this connection.
    pub fn build_client_proxy(self: &Arc<Self>) -> Arc<RpcProxy> {
        Arc::new(RpcProxy::new(Arc::clone(self)))
    }

    /// Start the reader and writer tasks
    ///
    /// Calling this more than once has no effect.
    pub fn start_listening(self: &Arc<Self>) {
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(io) = self.io.lock().take() else {
            return;
        };
        let ConnectionIo {
            mut reader,
            mut writer,
            mut outbound_rx,
        } = io;

        let closed = self.closed.clone();
        let name = format!("{}#{}", self.options.name, self.id);
        let writer_name = name.clone();
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = writer.write_frame(&frame).await {
                                warn!("[{}] write failed: {}", writer_name, e);
                                if let Some(conn) = weak.upgrade() {
                                    conn.dispose();
                                }
                                return;
                            }
                        }
                        None => break,
                    },

                    _ = closed.cancelled() => {
                        // Flush what was queued before disposal
                        while let Ok(frame) = outbound_rx.try_recv() {
                            if writer.write_frame(&frame).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
            if let Err(e) = writer.shutdown().await {
                debug!("[{}] write shutdown: {}", writer_name, e);
            }
        });

        let conn = Arc::clone(self);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = reader.read_frame() => frame,
                };
                match frame {
                    Ok(frame) => conn.handle_frame(frame),
                    Err(RpcError::ConnectionClosed) => {
                        debug!("[{}] peer closed the connection", name);
                        break;
                    }
                    Err(e) => {
                        warn!("[{}] read failed: {}", name, e);
                        break;
                    }
                }
            }
            conn.dispose();
        });
    }

    fn handle_frame(self: &Arc<Self>, frame: Bytes) {
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "[{}#{}] dropping malformed message: {}",
                    self.options.name, self.id, e
                );
                return;
            }
        };

        match message {
            Message::Request { id, method, params } => {
                trace!("[{}#{}] <- request {} {}", self.options.name, self.id, id, method);
                let conn = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = conn.dispatch(&method, params).await;
                    conn.send_response(id, &method, outcome);
                });
            }
            Message::Notification { method, params } => {
                trace!("[{}#{}] <- notification {}", self.options.name, self.id, method);
                let conn = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = conn.dispatch(&method, params).await {
                        match e {
                            RpcError::MethodNotFound(_) => debug!(
                                "[{}#{}] unhandled notification {}",
                                conn.options.name, conn.id, method
                            ),
                            e => warn!(
                                "[{}#{}] notification {} failed: {}",
                                conn.options.name, conn.id, method, e
                            ),
                        }
                    }
                });
            }
            Message::Result { id, result } => self.complete(id, Ok(result)),
            Message::Error { id: Some(id), error } => self.complete(id, Err(error.into())),
            Message::Error { id: None, error } => {
                warn!(
                    "[{}#{}] peer reported error without request id: {} {}",
                    self.options.name, self.id, error.code, error.message
                );
            }
        }
    }

    fn complete(&self, id: RequestId, outcome: Result<Value>) {
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(
                "[{}#{}] response for unknown request {}",
                self.options.name, self.id, id
            ),
        }
    }

    async fn dispatch(self: &Arc<Self>, method: &str, params: Vec<Value>) -> Result<Value> {
        let handler = self
            .methods
            .read()
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(method.to_string()))?;

        let args = match self.marshaler() {
            Some(m) => m.args_from_wire(self, params)?,
            None => params.into_iter().map(RpcValue::Json).collect(),
        };

        let result = handler(args).await?;
        self.to_wire(result, None)
    }

    fn send_response(&self, id: RequestId, method: &str, outcome: Result<Value>) {
        let message = match outcome {
            Ok(result) => Message::Result { id, result },
            Err(e) => {
                debug!(
                    "[{}#{}] request {} ({}) failed: {}",
                    self.options.name, self.id, id, method, e
                );
                Message::Error {
                    id: Some(id),
                    error: ErrorObject::from(&e),
                }
            }
        };
        if let Err(e) = self.send(&message) {
            debug!(
                "[{}#{}] could not send response {}: {}",
                self.options.name, self.id, id, e
            );
        }
    }

    fn send(&self, message: &Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }
        let frame = message.encode()?;
        self.outbound
            .send(frame)
            .map_err(|_| RpcError::ConnectionClosed)
    }

    fn to_wire(self: &Arc<Self>, value: RpcValue, call: Option<RequestId>) -> Result<Value> {
        match value {
            RpcValue::Json(v) => Ok(v),
            other => match self.marshaler() {
                Some(m) => m.to_wire(self, other, call),
                None => Err(RpcError::NotMarshalable(format!(
                    "{:?} requires a connection with object marshaling",
                    other
                ))),
            },
        }
    }

    fn from_wire(self: &Arc<Self>, value: Value) -> Result<RpcValue> {
        match self.marshaler() {
            Some(m) => m.from_wire(self, value),
            None => Ok(RpcValue::Json(value)),
        }
    }

    /// Invoke a method on the peer and wait for its result
    pub async fn invoke(self: &Arc<Self>, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
        self.invoke_with_cancellation(method, args, &CancellationToken::new())
            .await
    }

    /// Invoke a method on the peer; `cancel` abandons the wait
    pub async fn invoke_with_cancellation(
        self: &Arc<Self>,
        method: &str,
        args: Vec<RpcValue>,
        cancel: &CancellationToken,
    ) -> Result<RpcValue> {
        if self.closed.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let outcome = self.invoke_inner(id, method, args, cancel).await;

        let marshaler = self.marshaler();
        match outcome {
            Ok(result) => {
                if let Some(m) = &marshaler {
                    m.call_completed(self, id);
                }
                self.from_wire(result)
            }
            Err(e) => {
                if let Some(m) = &marshaler {
                    m.call_failed(self, id);
                }
                Err(e)
            }
        }
    }

    async fn invoke_inner(
        self: &Arc<Self>,
        id: RequestId,
        method: &str,
        args: Vec<RpcValue>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut params = Vec::with_capacity(args.len());
        for arg in args {
            params.push(self.to_wire(arg, Some(id))?);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let message = Message::Request {
            id,
            method: method.to_string(),
            params,
        };
        trace!("[{}#{}] -> request {} {}", self.options.name, self.id, id, method);
        if let Err(e) = self.send(&message) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        tokio::select! {
            outcome = rx => outcome.unwrap_or(Err(RpcError::ConnectionClosed)),
            _ = cancel.cancelled() => {
                self.pending.lock().remove(&id);
                Err(RpcError::Canceled)
            }
        }
    }

    /// Send a notification; no response is expected
    ///
    /// Objects among `args` count as delivered once the notification is
    /// queued. If it never gets that far they are unregistered again.
    pub fn notify(self: &Arc<Self>, method: &str, args: Vec<RpcValue>) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }

        // Notifications draw from the request id space so the marshaler can
        // track their objects
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let outcome = self.notify_inner(id, method, args);

        if let Some(m) = self.marshaler() {
            match &outcome {
                Ok(()) => m.call_completed(self, id),
                Err(_) => m.call_failed(self, id),
            }
        }
        outcome
    }

    fn notify_inner(
        self: &Arc<Self>,
        id: RequestId,
        method: &str,
        args: Vec<RpcValue>,
    ) -> Result<()> {
        let mut params = Vec::with_capacity(args.len());
        for arg in args {
            params.push(self.to_wire(arg, Some(id))?);
        }
        trace!("[{}#{}] -> notification {}", self.options.name, self.id, method);
        self.send(&Message::Notification {
            method: method.to_string(),
            params,
        })
    }

    /// Number of outbound calls awaiting a response
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Close the connection
    ///
    /// Fails every pending call with `ConnectionClosed` and tells the
    /// marshaler. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        debug!("[{}#{}] disposed", self.options.name, self.id);

        // Never started: dropping the halves lets the peer observe EOF
        drop(self.io.lock().take());

        let pending: Vec<PendingCall> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }

        if let Some(m) = self.marshaler() {
            m.connection_closed(self);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled once the connection is disposed
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Wait until the connection is disposed
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await
    }
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("name", &self.options.name)
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
