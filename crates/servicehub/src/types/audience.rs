//! Audiences and scopes

use serde::{Deserialize, Serialize};

/// Who may use a registered service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceAudience {
    Process,
    LocalMachine,
    RemoteGuest,
    Everyone,
}

/// Where a requesting view lives
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceScope {
    Process,
    LocalMachine,
    RemoteGuest,
}

/// Where a remotely proffered service is served from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceSource {
    SameProcess,
    OtherProcessOnSameMachine,
    TrustedServer,
    UntrustedServer,
}

impl ServiceAudience {
    /// Whether a view with `scope` may see services registered for this audience
    ///
    /// | audience      | visible to scopes            |
    /// |---------------|------------------------------|
    /// | Everyone      | all                          |
    /// | RemoteGuest   | RemoteGuest                  |
    /// | LocalMachine  | LocalMachine, Process        |
    /// | Process       | Process                      |
    pub fn is_visible_to(self, scope: ServiceScope) -> bool {
        match self {
            ServiceAudience::Everyone => true,
            ServiceAudience::RemoteGuest => scope == ServiceScope::RemoteGuest,
            ServiceAudience::LocalMachine => {
                matches!(scope, ServiceScope::LocalMachine | ServiceScope::Process)
            }
            ServiceAudience::Process => scope == ServiceScope::Process,
        }
    }
}
