//! Partition discovery
//!
//! The balancer asks a [`PartitionDiscovery`] for the stream's partition
//! identifiers at the start of every cycle, so partitions added to the stream
//! are picked up without restarting hosts.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::{HostError, Result};
use crate::host::is_presence_key;

/// Enumerates the partition identifiers of a stream
#[async_trait]
pub trait PartitionDiscovery: Send + Sync + Debug {
    async fn partition_ids(&self) -> Result<Vec<String>>;
}

/// Fixed partition set, either counted (`"0".."n-1"`) or listed explicitly
#[derive(Debug, Clone)]
pub struct StaticPartitions {
    ids: Vec<String>,
}

impl StaticPartitions {
    /// Explicit list of partition identifiers
    pub fn new<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        if let Some(bad) = ids.iter().find(|id| id.is_empty() || is_presence_key(id)) {
            return Err(HostError::config(
                "partition_ids",
                format!("'{}' is not a valid partition identifier", bad),
            ));
        }
        ids.sort();
        ids.dedup();
        Ok(Self { ids })
    }

    /// Partitions `"0"` through `"count - 1"`
    pub fn count(count: u32) -> Self {
        Self {
            ids: (0..count).map(|i| i.to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[async_trait]
impl PartitionDiscovery for StaticPartitions {
    async fn partition_ids(&self) -> Result<Vec<String>> {
        if self.ids.is_empty() {
            return Err(HostError::Discovery("stream has no partitions".to_string()));
        }
        Ok(self.ids.clone())
    }
}
