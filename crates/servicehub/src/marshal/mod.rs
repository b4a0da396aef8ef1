//! Marshaled object protocol
//!
//! Lets RPC arguments and return values carry live objects instead of
//! copies. Each connection gets its own [`ObjectMarshaler`], which assigns
//! handles to exported objects and hands out [`MarshaledProxy`] instances
//! for imported ones.
//!
//! # Protocol
//!
//! - an exported object's methods are served as `$/invokeProxy/<handle>/<method>`
//! - sending back an imported proxy restores the original object on its owner
//! - disposing a proxy sends `$/releaseMarshaledObject`
//! - objects first sent in a call that fails are unregistered again

mod marshaler;
mod proxy;
mod record;
mod tables;

pub use marshaler::ObjectMarshaler;
pub use proxy::MarshaledProxy;
pub use record::{
    async_alias, invoke_method_name, MarshaledObjectRecord, ReleaseNotification, INVOKE_PREFIX,
    MARSHALED_KEY, RELEASE_METHOD,
};
