//! Brokered service hub
//!
//! Locates services by moniker and connects clients to them, in the same
//! process or across process boundaries, on top of the `hubrpc` transport.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Service Hub (this crate)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Container            │  Remote brokering │  Marshaling     │
//! │  - registrations      │  - relay          │  - handles      │
//! │  - proffers           │  - client         │  - proxies      │
//! │  - scoped views       │  - wire adapter   │  - release      │
//! ├─────────────────────────────────────────────────────────────┤
//! │      hubrpc: JSON-RPC connection, multiplexing, pipes       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! - **Moniker**: name plus optional version identifying a service
//! - **Audience**: who may see a registration; a view has a **scope**
//! - **Proffer**: a factory or remote broker serving a registered moniker
//! - **Relay**: exposes a view to another process over pipes or channels
//! - **Handle**: per-connection number naming a marshaled object
//!
//! # Modules
//!
//! - [`types`]: monikers, audiences, options, descriptors and errors
//! - [`broker`]: the [`ServiceBroker`] interface and [`ServiceProxy`]
//! - [`container`]: registrations, proffers, activation and views
//! - [`remote`]: relay, client and the remote broker protocol
//! - [`marshal`]: live objects as RPC arguments and return values
//!
//! # Example
//!
//! ```no_run
//! use servicehub::{
//!     CredentialsPolicy, ServiceAudience, ServiceBroker, ServiceContainer, ServiceMoniker,
//!     ServiceRegistration, ServiceRpcDescriptor, ServiceScope,
//! };
//! use hubrpc::{CancellationToken, LocalTarget, ObjectProxyExt, RpcValue};
//! use std::collections::HashMap;
//!
//! # async fn example() -> servicehub::Result<()> {
//! let container = ServiceContainer::new();
//! let moniker = ServiceMoniker::new("calculator");
//! container.register([(moniker.clone(), ServiceRegistration::new(ServiceAudience::Process))])?;
//! container.proffer_factory(ServiceRpcDescriptor::new(moniker.clone()), |_, _, _, _| async {
//!     Ok(Some(
//!         LocalTarget::builder("calculator")
//!             .method("Add", |args| async move {
//!                 let a: i64 = hubrpc::arg(&args, 0).deserialize()?;
//!                 let b: i64 = hubrpc::arg(&args, 1).deserialize()?;
//!                 Ok(RpcValue::from(serde_json::json!(a + b)))
//!             })
//!             .build(),
//!     ))
//! })?;
//!
//! let view = container.get_view(
//!     ServiceScope::Process,
//!     HashMap::new(),
//!     CredentialsPolicy::RequestOverridesDefault,
//! )?;
//! let descriptor = ServiceRpcDescriptor::new(moniker);
//! if let Some(proxy) = view
//!     .get_proxy(&descriptor, Default::default(), &CancellationToken::new())
//!     .await?
//! {
//!     let sum: i64 = proxy.call("Add", vec![2.into(), 3.into()]).await?;
//!     assert_eq!(sum, 5);
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod container;
pub mod marshal;
pub mod remote;
pub mod types;

pub use broker::{BrokeredServicesChanged, FromProxy, ServiceBroker, ServiceBrokerExt, ServiceProxy};
pub use container::{
    ContainerOptions, CredentialsPolicy, ProfferHandle, RegistrationHandle, ServiceBrokerView,
    ServiceContainer, ServiceRegistration,
};
pub use marshal::{MarshaledProxy, ObjectMarshaler};
pub use remote::{
    serve_remote_broker, AuthorizationServiceClient, RelayOptions, RemoteServiceBroker,
    RemoteServiceBrokerClient, RemoteServiceBrokerProxy, RemoteServiceBrokerRelay,
};
pub use types::{
    ClientCapabilities, ClientRpcTarget, RemoteServiceConnectionInfo, Result,
    ServiceActivationOptions, ServiceAudience, ServiceBrokerClientMetadata, ServiceHubError,
    ServiceMoniker, ServiceRpcDescriptor, ServiceScope, ServiceSource,
};
