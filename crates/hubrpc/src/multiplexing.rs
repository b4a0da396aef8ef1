//! Multiplexing stream
//!
//! Carries any number of independent byte channels over one duplex pipe.
//! Either side may offer a channel; the peer accepts it by id or by name.
//!
//! # Wire format
//!
//! Every frame travels inside the length-prefixed [`FrameTransport`]:
//!
//! ```text
//! handshake:  [version u8][nonce 16 bytes]
//! frame:      [code u8][channel id u64 LE][payload]
//! ```
//!
//! The side with the larger nonce allocates odd channel ids, the other side
//! even ids, so both can offer channels without coordination.

use crate::error::{Result, RpcError};
use crate::transport::{DuplexPipe, FrameTransport, DEFAULT_MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Handshake protocol version
pub const PROTOCOL_VERSION: u8 = 1;

const HANDSHAKE_SIZE: usize = 17;
const FRAME_PREFIX_SIZE: usize = 9;
const CHUNK_SIZE: usize = 16 * 1024;

/// Channel frame codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameCode {
    Offer = 0,
    Accept = 1,
    Data = 2,
    Close = 3,
}

impl TryFrom<u8> for FrameCode {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameCode::Offer),
            1 => Ok(FrameCode::Accept),
            2 => Ok(FrameCode::Data),
            3 => Ok(FrameCode::Close),
            other => Err(RpcError::Multiplexing(format!("unknown frame code {}", other))),
        }
    }
}

/// Multiplexing stream configuration
#[derive(Debug, Clone)]
pub struct MultiplexingOptions {
    /// Name used in log output
    pub name: String,
    pub max_frame_size: usize,
    /// In-memory buffer per channel direction
    pub channel_buffer_size: usize,
}

impl Default for MultiplexingOptions {
    fn default() -> Self {
        Self {
            name: "mxstream".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_buffer_size: 64 * 1024,
        }
    }
}

impl MultiplexingOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// One logical byte channel
pub struct Channel {
    id: u64,
    stream: DuplexStream,
}

impl Channel {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// A channel offered to the peer, not yet accepted
pub struct ChannelOffer {
    id: u64,
    accepted: oneshot::Receiver<Result<Channel>>,
}

impl ChannelOffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the peer to accept the channel
    pub async fn accepted(self) -> Result<Channel> {
        self.accepted.await.unwrap_or(Err(RpcError::Canceled))
    }
}

type ChannelWaiter = oneshot::Sender<Result<Channel>>;

enum ChannelState {
    OfferedLocally {
        name: String,
        accepted: ChannelWaiter,
    },
    OfferedRemotely {
        name: String,
    },
    Open {
        inbound: Option<mpsc::UnboundedSender<Bytes>>,
        local_closed: bool,
    },
}

#[derive(Default)]
struct MuxState {
    channels: HashMap<u64, ChannelState>,
    id_waiters: HashMap<u64, ChannelWaiter>,
    name_waiters: HashMap<String, VecDeque<ChannelWaiter>>,
}

struct Inner {
    options: MultiplexingOptions,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Bytes>,
    state: Mutex<MuxState>,
    closed: CancellationToken,
}

/// Channel multiplexer over a single duplex pipe
#[derive(Clone)]
pub struct MultiplexingStream {
    inner: Arc<Inner>,
}

impl MultiplexingStream {
    /// Handshake over `pipe` and start the stream
    pub async fn create(pipe: DuplexPipe, options: MultiplexingOptions) -> Result<Self> {
        let (read_half, write_half) = tokio::io::split(pipe);
        let mut reader = FrameTransport::new(read_half).with_max_frame_size(options.max_frame_size);
        let mut writer =
            FrameTransport::new(write_half).with_max_frame_size(options.max_frame_size);

        let nonce = Uuid::new_v4();
        let mut hello = BytesMut::with_capacity(HANDSHAKE_SIZE);
        hello.put_u8(PROTOCOL_VERSION);
        hello.put_slice(nonce.as_bytes());
        writer.write_frame(&hello).await?;

        let reply = reader.read_frame().await?;
        if reply.len() != HANDSHAKE_SIZE {
            return Err(RpcError::Multiplexing(format!(
                "handshake of {} bytes",
                reply.len()
            )));
        }
        if reply[0] != PROTOCOL_VERSION {
            return Err(RpcError::Multiplexing(format!(
                "unsupported protocol version {}",
                reply[0]
            )));
        }
        let peer_nonce = &reply[1..];
        let odd = match nonce.as_bytes()[..].cmp(peer_nonce) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                return Err(RpcError::Multiplexing("handshake nonce collision".to_string()))
            }
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            options,
            next_id: AtomicU64::new(if odd { 1 } else { 2 }),
            outbound,
            state: Mutex::new(MuxState::default()),
            closed: CancellationToken::new(),
        });
        info!(
            "[{}] multiplexing stream established ({} channel ids)",
            inner.options.name,
            if odd { "odd" } else { "even" }
        );

        spawn_writer(&inner, writer, outbound_rx);
        spawn_reader(&inner, reader);

        Ok(Self { inner })
    }

    /// Offer a new channel to the peer
    pub fn offer_channel(&self, name: &str) -> Result<ChannelOffer> {
        if self.inner.closed.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }
        let id = self.inner.next_id.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.state.lock().channels.insert(
            id,
            ChannelState::OfferedLocally {
                name: name.to_string(),
                accepted: tx,
            },
        );
        if let Err(e) = self.inner.send_frame(FrameCode::Offer, id, name.as_bytes()) {
            self.inner.state.lock().channels.remove(&id);
            return Err(e);
        }
        debug!("[{}] offered channel {} ({})", self.inner.options.name, id, name);
        Ok(ChannelOffer { id, accepted: rx })
    }

    /// Withdraw an offer that has not been accepted
    ///
    /// Returns whether an offer was withdrawn.
    pub fn cancel_offer(&self, id: u64) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            match state.channels.get(&id) {
                Some(ChannelState::OfferedLocally { .. }) => state.channels.remove(&id),
                _ => None,
            }
        };
        match removed {
            Some(ChannelState::OfferedLocally { name, accepted }) => {
                let _ = accepted.send(Err(RpcError::Canceled));
                if let Err(e) = self.inner.send_frame(FrameCode::Close, id, &[]) {
                    debug!(
                        "[{}] could not announce withdrawn offer {}: {}",
                        self.inner.options.name, id, e
                    );
                }
                debug!("[{}] withdrew offer {} ({})", self.inner.options.name, id, name);
                true
            }
            _ => false,
        }
    }

    /// Accept the channel the peer offered with `id`, waiting for the offer
    /// to arrive if needed
    pub async fn accept_channel(&self, id: u64, cancel: &CancellationToken) -> Result<Channel> {
        let rx = {
            let mut state = self.inner.state.lock();
            match state.channels.get(&id) {
                Some(ChannelState::OfferedRemotely { .. }) => {
                    return self.inner.accept_offered(&mut state, id);
                }
                Some(_) => {
                    return Err(RpcError::Multiplexing(format!(
                        "channel {} is not awaiting acceptance",
                        id
                    )))
                }
                None => {}
            }
            if self.inner.closed.is_cancelled() {
                return Err(RpcError::ConnectionClosed);
            }
            let (tx, rx) = oneshot::channel();
            state.id_waiters.insert(id, tx);
            rx
        };

        tokio::select! {
            outcome = rx => outcome.unwrap_or(Err(RpcError::ConnectionClosed)),
            _ = cancel.cancelled() => {
                self.inner.state.lock().id_waiters.remove(&id);
                Err(RpcError::Canceled)
            }
        }
    }

    /// Accept the next channel the peer offers under `name`
    pub async fn accept_channel_by_name(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Channel> {
        let rx = {
            let mut state = self.inner.state.lock();
            let offered = state
                .channels
                .iter()
                .filter_map(|(id, s)| match s {
                    ChannelState::OfferedRemotely { name: n } if n == name => Some(*id),
                    _ => None,
                })
                .min();
            if let Some(id) = offered {
                return self.inner.accept_offered(&mut state, id);
            }
            if self.inner.closed.is_cancelled() {
                return Err(RpcError::ConnectionClosed);
            }
            let (tx, rx) = oneshot::channel();
            state
                .name_waiters
                .entry(name.to_string())
                .or_default()
                .push_back(tx);
            rx
        };

        tokio::select! {
            outcome = rx => outcome.unwrap_or(Err(RpcError::ConnectionClosed)),
            _ = cancel.cancelled() => Err(RpcError::Canceled),
        }
    }

    /// Close the stream and every channel on it
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Token cancelled once the stream is closed
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Number of channels known to the stream, in any state
    pub fn channel_count(&self) -> usize {
        self.inner.state.lock().channels.len()
    }
}

impl std::fmt::Debug for MultiplexingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexingStream")
            .field("name", &self.inner.options.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    fn send_frame(&self, code: FrameCode, id: u64, payload: &[u8]) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }
        let mut frame = BytesMut::with_capacity(FRAME_PREFIX_SIZE + payload.len());
        frame.put_u8(code as u8);
        frame.put_u64_le(id);
        frame.put_slice(payload);
        self.outbound
            .send(frame.freeze())
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Accept a remotely offered channel; the caller holds the state lock
    fn accept_offered(self: &Arc<Self>, state: &mut MuxState, id: u64) -> Result<Channel> {
        let (channel, inbound) = self.open_channel(id);
        state.channels.insert(
            id,
            ChannelState::Open {
                inbound: Some(inbound),
                local_closed: false,
            },
        );
        self.send_frame(FrameCode::Accept, id, &[])?;
        debug!("[{}] accepted channel {}", self.options.name, id);
        Ok(channel)
    }

    /// Build the user-facing channel and its pump tasks
    fn open_channel(self: &Arc<Self>, id: u64) -> (Channel, mpsc::UnboundedSender<Bytes>) {
        let (user, internal) = tokio::io::duplex(self.options.channel_buffer_size);
        let (mut internal_read, mut internal_write) = tokio::io::split(internal);
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Bytes>();

        // Peer data → user
        tokio::spawn(async move {
            while let Some(data) = inbound_rx.recv().await {
                if internal_write.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = internal_write.shutdown().await;
        });

        // User writes → peer
        let weak: Weak<Inner> = Arc::downgrade(self);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let read = tokio::select! {
                    _ = closed.cancelled() => return,
                    read = internal_read.read(&mut buf) => read,
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match read {
                    Ok(0) | Err(_) => {
                        inner.local_close(id);
                        return;
                    }
                    Ok(n) => {
                        if inner.send_frame(FrameCode::Data, id, &buf[..n]).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        (Channel { id, stream: user }, inbound_tx)
    }

    fn local_close(&self, id: u64) {
        let mut state = self.state.lock();
        let remove = match state.channels.get_mut(&id) {
            Some(ChannelState::Open {
                inbound,
                local_closed,
            }) => {
                *local_closed = true;
                inbound.is_none()
            }
            _ => false,
        };
        if remove {
            state.channels.remove(&id);
        }
        drop(state);
        if let Err(e) = self.send_frame(FrameCode::Close, id, &[]) {
            trace!("[{}] close of channel {} not sent: {}", self.options.name, id, e);
        }
    }

    fn handle_frame(self: &Arc<Self>, mut frame: Bytes) -> Result<()> {
        if frame.len() < FRAME_PREFIX_SIZE {
            return Err(RpcError::Multiplexing(format!(
                "frame of {} bytes",
                frame.len()
            )));
        }
        let code = FrameCode::try_from(frame.get_u8())?;
        let id = frame.get_u64_le();

        match code {
            FrameCode::Offer => {
                let name = String::from_utf8(frame.to_vec())
                    .map_err(|e| RpcError::Multiplexing(format!("channel name: {}", e)))?;
                self.on_offer(id, name)
            }
            FrameCode::Accept => {
                self.on_accept(id);
                Ok(())
            }
            FrameCode::Data => {
                let state = self.state.lock();
                match state.channels.get(&id) {
                    Some(ChannelState::Open {
                        inbound: Some(tx), ..
                    }) => {
                        let _ = tx.send(frame);
                    }
                    _ => trace!("[{}] data for inactive channel {}", self.options.name, id),
                }
                Ok(())
            }
            FrameCode::Close => {
                self.on_close(id);
                Ok(())
            }
        }
    }

    fn on_offer(self: &Arc<Self>, id: u64, name: String) -> Result<()> {
        let mut state = self.state.lock();
        if state.channels.contains_key(&id) {
            return Err(RpcError::Multiplexing(format!("duplicate channel id {}", id)));
        }
        debug!("[{}] peer offered channel {} ({})", self.options.name, id, name);

        let waiter = match state.id_waiters.remove(&id) {
            Some(w) if !w.is_closed() => Some(w),
            _ => state.name_waiters.get_mut(&name).and_then(|queue| {
                while let Some(w) = queue.pop_front() {
                    if !w.is_closed() {
                        return Some(w);
                    }
                }
                None
            }),
        };

        match waiter {
            Some(waiter) => {
                let outcome = self.accept_offered(&mut state, id);
                let _ = waiter.send(outcome);
            }
            None => {
                state
                    .channels
                    .insert(id, ChannelState::OfferedRemotely { name });
            }
        }
        Ok(())
    }

    fn on_accept(self: &Arc<Self>, id: u64) {
        let mut state = self.state.lock();
        match state.channels.remove(&id) {
            Some(ChannelState::OfferedLocally { name, accepted }) => {
                let (channel, inbound) = self.open_channel(id);
                state.channels.insert(
                    id,
                    ChannelState::Open {
                        inbound: Some(inbound),
                        local_closed: false,
                    },
                );
                debug!("[{}] peer accepted channel {} ({})", self.options.name, id, name);
                // A dropped offer drops the channel, which closes it
                let _ = accepted.send(Ok(channel));
            }
            Some(other) => {
                state.channels.insert(id, other);
                warn!("[{}] unexpected accept for channel {}", self.options.name, id);
            }
            None => debug!("[{}] accept for withdrawn channel {}", self.options.name, id),
        }
    }

    fn on_close(&self, id: u64) {
        let mut state = self.state.lock();
        match state.channels.remove(&id) {
            Some(ChannelState::OfferedLocally { accepted, .. }) => {
                debug!("[{}] peer rejected channel {}", self.options.name, id);
                let _ = accepted.send(Err(RpcError::ChannelRejected(id)));
            }
            Some(ChannelState::OfferedRemotely { name }) => {
                debug!("[{}] peer withdrew offer {} ({})", self.options.name, id, name);
            }
            Some(ChannelState::Open { local_closed, .. }) => {
                // Dropping the inbound sender ends the user's read side
                if !local_closed {
                    state.channels.insert(
                        id,
                        ChannelState::Open {
                            inbound: None,
                            local_closed,
                        },
                    );
                }
            }
            None => trace!("[{}] close for unknown channel {}", self.options.name, id),
        }
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let state = std::mem::take(&mut *self.state.lock());
        let channels = state.channels.len();
        for (_, channel) in state.channels {
            if let ChannelState::OfferedLocally { accepted, .. } = channel {
                let _ = accepted.send(Err(RpcError::ConnectionClosed));
            }
        }
        info!(
            "[{}] multiplexing stream closed ({} channels)",
            self.options.name, channels
        );
    }
}

fn spawn_writer(
    inner: &Arc<Inner>,
    mut writer: FrameTransport<tokio::io::WriteHalf<DuplexPipe>>,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let closed = inner.closed.clone();
    let weak = Arc::downgrade(inner);
    let name = inner.options.name.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                frame = outbound_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            warn!("[{}] write failed: {}", name, e);
                            if let Some(inner) = weak.upgrade() {
                                inner.close();
                            }
                            return;
                        }
                    }
                    None => break,
                },

                _ = closed.cancelled() => {
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if writer.write_frame(&frame).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    });
}

fn spawn_reader(inner: &Arc<Inner>, mut reader: FrameTransport<tokio::io::ReadHalf<DuplexPipe>>) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = inner.closed.cancelled() => break,
                frame = reader.read_frame() => frame,
            };
            let outcome = match frame {
                Ok(frame) => inner.handle_frame(frame),
                Err(RpcError::ConnectionClosed) => {
                    debug!("[{}] peer closed the stream", inner.options.name);
                    break;
                }
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!("[{}] stream failed: {}", inner.options.name, e);
                break;
            }
        }
        inner.close();
    });
}
