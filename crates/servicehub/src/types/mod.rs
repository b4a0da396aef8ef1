//! Core service hub types
//!
//! - Identity: [`ServiceMoniker`]
//! - Access control: [`ServiceAudience`], [`ServiceScope`]
//! - Connection recipes: [`ServiceRpcDescriptor`]
//! - Wire records: [`RemoteServiceConnectionInfo`], [`ServiceBrokerClientMetadata`]

mod audience;
mod capabilities;
mod connection_info;
mod descriptor;
mod error;
mod moniker;
mod options;

pub use audience::{ServiceAudience, ServiceScope, ServiceSource};
pub use capabilities::{ClientCapabilities, ServiceBrokerClientMetadata};
pub use connection_info::RemoteServiceConnectionInfo;
pub use descriptor::ServiceRpcDescriptor;
pub use error::*;
pub use moniker::ServiceMoniker;
pub use options::{ClientRpcTarget, ServiceActivationOptions};
