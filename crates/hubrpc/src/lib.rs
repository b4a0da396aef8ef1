//! JSON-RPC connections over arbitrary duplex byte channels
//!
//! This crate provides the transport layer the service hub is built on.
//!
//! # Features
//!
//! - Length-prefixed JSON-RPC 2.0 framing over any `AsyncRead + AsyncWrite`
//! - Bidirectional calls and notifications on a single connection
//! - Explicit method tables built with [`TargetBuilder`]
//! - Dynamic proxies implementing [`ObjectProxy`]
//! - A [`ValueMarshaler`] hook for passing objects by reference
//! - A [`MultiplexingStream`] carrying many channels over one pipe
//! - Local pipe listener and connector
//!
//! # Example
//!
//! ```no_run
//! use hubrpc::{boxed, LocalTarget, ObjectProxyExt, RpcConnection, RpcValue};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (a, b) = tokio::io::duplex(64 * 1024);
//!
//!     let echo = LocalTarget::builder("echo")
//!         .method("Echo", |args: Vec<RpcValue>| async move {
//!             Ok(hubrpc::arg(&args, 0))
//!         })
//!         .build();
//!
//!     let server = RpcConnection::new(boxed(b));
//!     server.add_local_target(&echo);
//!     server.start_listening();
//!
//!     let client = RpcConnection::new(boxed(a));
//!     client.start_listening();
//!
//!     let proxy = client.build_client_proxy();
//!     let reply: String = proxy.call("Echo", vec![json!("hello")]).await.unwrap();
//!     assert_eq!(reply, "hello");
//! }
//! ```

pub mod connection;
pub mod error;
pub mod message;
pub mod multiplexing;
pub mod pipe;
pub mod proxy;
pub mod target;
pub mod transport;
pub mod value;

pub use connection::{ConnectionOptions, RpcConnection, ValueMarshaler};
pub use error::{Result, RpcError};
pub use message::{ErrorObject, Message, RequestId};
pub use multiplexing::{Channel, ChannelOffer, MultiplexingOptions, MultiplexingStream};
pub use pipe::{connect_pipe, unique_pipe_name, PipeServer, PipeServerOptions};
pub use proxy::RpcProxy;
pub use target::{handler, LocalTarget, MethodHandler, TargetBuilder};
pub use transport::{boxed, AsyncDuplex, DuplexPipe, FrameTransport};
pub use value::{arg, MarshalLifetime, MarshalableTarget, ObjectProxy, ObjectProxyExt, RpcValue};

pub use tokio_util::sync::CancellationToken;
