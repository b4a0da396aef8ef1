//! Handshake capability flags

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Transport capabilities a remote broker client announces
    ///
    /// On the wire the flags travel as their integer value.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ClientCapabilities: u32 {
        /// Can accept channels on an existing multiplexing stream
        const MULTIPLEXING = 0b001;
        /// Can connect to a named local pipe
        const IPC_PIPE = 0b010;
        /// Can activate services in its own process
        const LOCAL_ACTIVATION = 0b100;
    }
}

impl Serialize for ClientCapabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClientCapabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Bits from newer peers are kept, not rejected
        u32::deserialize(deserializer).map(Self::from_bits_retain)
    }
}

/// Metadata a client sends with its handshake
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerClientMetadata {
    pub supported_connections: ClientCapabilities,
}
