//! Service RPC descriptors

use super::ServiceMoniker;
use crate::marshal::ObjectMarshaler;
use hubrpc::{ConnectionOptions, DuplexPipe, RpcConnection};
use std::sync::Arc;

/// A moniker plus the recipe for talking to the service over a pipe
#[derive(Clone, Debug)]
pub struct ServiceRpcDescriptor {
    pub moniker: ServiceMoniker,
    marshaled_objects: bool,
    max_frame_size: Option<usize>,
}

impl ServiceRpcDescriptor {
    /// Descriptor with object marshaling enabled
    pub fn new(moniker: ServiceMoniker) -> Self {
        Self {
            moniker,
            marshaled_objects: true,
            max_frame_size: None,
        }
    }

    pub fn with_marshaled_objects(mut self, enabled: bool) -> Self {
        self.marshaled_objects = enabled;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = Some(size);
        self
    }

    pub fn marshaled_objects(&self) -> bool {
        self.marshaled_objects
    }

    /// Same recipe, different moniker
    pub fn with_moniker(&self, moniker: ServiceMoniker) -> Self {
        Self {
            moniker,
            ..self.clone()
        }
    }

    /// Build an RPC connection over `pipe`
    ///
    /// The connection is not listening yet; callers add local targets first
    /// and then call `start_listening`.
    pub fn construct_connection(&self, pipe: DuplexPipe) -> Arc<RpcConnection> {
        let mut options = ConnectionOptions::named(self.moniker.to_string());
        if let Some(size) = self.max_frame_size {
            options = options.with_max_frame_size(size);
        }
        let connection = RpcConnection::with_options(pipe, options);
        if self.marshaled_objects {
            ObjectMarshaler::install(&connection);
        }
        connection
    }
}
