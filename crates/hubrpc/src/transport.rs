//! Frame transport layer
//!
//! Every message travelling over a duplex byte channel is preceded by a
//! 4-byte little-endian length header, so frames are self-delimiting on any
//! stream (pipes, sockets, in-memory duplex pairs, multiplexed channels).

use crate::error::{Result, RpcError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length header preceding each frame
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum frame size (16 MiB default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Any bidirectional byte stream usable as an RPC channel
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncDuplex for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owned, type-erased duplex byte channel
pub type DuplexPipe = Box<dyn AsyncDuplex>;

/// Box any duplex stream into a [`DuplexPipe`]
pub fn boxed<T: AsyncDuplex>(stream: T) -> DuplexPipe {
    Box::new(stream)
}

/// Length-prefixed frame transport
pub struct FrameTransport<T> {
    inner: T,
    max_frame_size: usize,
    read_buf: BytesMut,
}

impl<T> FrameTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_frame_size(mut self, max_size: usize) -> Self {
        self.max_frame_size = max_size;
        self
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: AsyncRead + Unpin> FrameTransport<T> {
    /// Read a complete frame payload
    ///
    /// Returns `ConnectionClosed` on a clean EOF between frames.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        while self.read_buf.len() < FRAME_HEADER_SIZE {
            if self.fill_buf().await? == 0 {
                if self.read_buf.is_empty() {
                    return Err(RpcError::ConnectionClosed);
                }
                return Err(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "incomplete frame header",
                )));
            }
        }

        let frame_length = (&self.read_buf[..FRAME_HEADER_SIZE]).get_u32_le() as usize;
        if frame_length > self.max_frame_size {
            return Err(RpcError::FrameTooLarge {
                size: frame_length,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_HEADER_SIZE + frame_length;
        while self.read_buf.len() < total {
            if self.fill_buf().await? == 0 {
                return Err(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "incomplete frame: expected {} bytes, got {}",
                        total,
                        self.read_buf.len()
                    ),
                )));
            }
        }

        self.read_buf.advance(FRAME_HEADER_SIZE);
        Ok(self.read_buf.split_to(frame_length).freeze())
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < 4096 {
            self.read_buf.reserve(8192);
        }
        let n = self.inner.read_buf(&mut self.read_buf).await?;
        Ok(n)
    }
}

impl<T: AsyncWrite + Unpin> FrameTransport<T> {
    /// Write one frame, prefixing it with its length
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_frame_size {
            return Err(RpcError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.put_u32_le(payload.len() as u32);
        frame.put_slice(payload);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write side so the peer observes EOF
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
