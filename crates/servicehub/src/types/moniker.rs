//! Service monikers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name and optional version identifying a service
///
/// A registration without a version matches requests for any version; a
/// versioned registration only matches that exact version.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceMoniker {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ServiceMoniker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn versioned(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }

    /// The same name without a version
    pub fn unversioned(&self) -> Self {
        Self::new(self.name.clone())
    }

    /// Whether a registration under `self` serves a request for `requested`
    pub fn matches_request(&self, requested: &ServiceMoniker) -> bool {
        self.name == requested.name
            && match &self.version {
                None => true,
                Some(v) => requested.version.as_ref() == Some(v),
            }
    }
}

impl fmt::Display for ServiceMoniker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{} ({})", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}
