//! Out-of-process brokering
//!
//! - [`RemoteServiceBrokerRelay`] serves a local broker to other processes
//! - [`RemoteServiceBrokerClient`] consumes a remote broker as a local one
//! - [`serve_remote_broker`] and [`RemoteServiceBrokerProxy`] carry the
//!   protocol between them over an RPC connection

mod client;
mod protocol;
mod relay;

pub use client::{AuthorizationServiceClient, RemoteServiceBrokerClient};
pub use protocol::{methods, serve_remote_broker, RemoteServiceBroker, RemoteServiceBrokerProxy};
pub use relay::{RelayOptions, RemoteServiceBrokerRelay};
