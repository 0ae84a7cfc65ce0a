//! Host identity
//!
//! A host is identified by a stable, externally supplied name. The name is the
//! owner token written into leases and is passed explicitly to every store and
//! balancer call.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{HostError, Result};

/// Key prefix reserved for host presence leases
///
/// A host holding zero partitions owns no partition lease and would be
/// invisible to other hosts' host-count estimates. Each host therefore also
/// holds a lease keyed `"$host/<name>"`, which only signals liveness.
pub const PRESENCE_PREFIX: &str = "$host/";

/// Validated host name used as the lease owner token
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostName(String);

impl HostName {
    /// Create a host name, rejecting empty or whitespace-only names
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(HostError::config("host_name", "must not be empty"));
        }
        if name.contains('/') {
            return Err(HostError::config(
                "host_name",
                format!("'{}' must not contain '/'", name),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of this host's presence lease
    pub fn presence_key(&self) -> String {
        format!("{}{}", PRESENCE_PREFIX, self.0)
    }
}

impl fmt::Display for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for HostName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for HostName {
    type Error = HostError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<HostName> for String {
    fn from(value: HostName) -> Self {
        value.0
    }
}

/// Returns true if the lease key belongs to a host presence record
pub fn is_presence_key(key: &str) -> bool {
    key.starts_with(PRESENCE_PREFIX)
}
