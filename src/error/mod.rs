//! Error types for partition-host
//!
//! Errors fall into two scopes. Partition-scoped errors (`LeaseHeldByOther`,
//! `NotOwner`, `StaleWriter`) describe the outcome of one lease or checkpoint
//! operation and are absorbed by the balancer. Store-scoped errors
//! (`BackendUnavailable`, `StoreNotProvisioned`, `Timeout`) describe the
//! health of a backend and degrade a whole balancing cycle.

use thiserror::Error;

mod domain;

pub use domain::ConfigError;

/// Result type alias for partition-host operations
pub type Result<T> = std::result::Result<T, HostError>;

/// Main error type for partition-host
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Lease for partition {partition_id} held by {owner} until {expires_at_ms}")]
    LeaseHeldByOther {
        partition_id: String,
        owner: String,
        expires_at_ms: i64,
    },

    #[error("Host {requester} does not own partition {partition_id} (owner: {owner:?})")]
    NotOwner {
        partition_id: String,
        requester: String,
        owner: String,
    },

    #[error(
        "Stale writer for {partition_id}: epoch {writer_epoch} < stored epoch {stored_epoch}"
    )]
    StaleWriter {
        partition_id: String,
        writer_epoch: u64,
        stored_epoch: u64,
    },

    #[error("Backend unavailable: {store}: {detail}")]
    BackendUnavailable { store: String, detail: String },

    #[error("Store not provisioned: {0}")]
    StoreNotProvisioned(String),

    #[error("Lease not found: partition={0}")]
    LeaseNotFound(String),

    #[error("Timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Pump error: {0}")]
    Pump(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Host is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HostError {
    /// Create a backend-unavailable error for the named store
    pub fn backend(store: &str, detail: impl Into<String>) -> Self {
        HostError::BackendUnavailable {
            store: store.to_string(),
            detail: detail.into(),
        }
    }

    /// Create a configuration error for a single setting
    pub fn config(setting: &str, reason: impl Into<String>) -> Self {
        HostError::Config(ConfigError::invalid_setting(setting, reason))
    }

    /// Returns true if the operation may succeed when retried with backoff
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            HostError::BackendUnavailable { .. } | HostError::Timeout { .. }
        )
    }

    /// Returns true if the error concerns a single partition rather than the
    /// health of a store
    pub fn is_partition_scoped(&self) -> bool {
        matches!(
            self,
            HostError::LeaseHeldByOther { .. }
                | HostError::NotOwner { .. }
                | HostError::StaleWriter { .. }
                | HostError::LeaseNotFound(_)
        )
    }
}
