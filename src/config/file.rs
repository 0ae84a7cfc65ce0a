//! Configuration file support for partition-host
//!
//! ## Example Configuration
//!
//! ```toml
//! # partition-host.toml
//!
//! [balancer]
//! lease_duration_ms = 30000
//! # balance_interval_ms = 10000   # defaults to a third of the lease
//! drain_timeout_ms = 10000
//! store_call_timeout_ms = 2000
//! max_retries = 3
//!
//! [simulation]
//! hosts = 3
//! partitions = 8
//! duration_secs = 20
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::defaults::*;
use super::BalancerConfig;
use crate::error::{ConfigError, Result};

/// Root configuration structure for TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Balancer settings; absent means the caller picks its own defaults
    pub balancer: Option<BalancerConfig>,

    /// Settings for the `simulate` command
    pub simulation: SimulationSection,
}

/// `[simulation]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    pub hosts: usize,
    pub partitions: u32,
    pub duration_secs: u64,
    pub report_interval_ms: u64,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            hosts: DEFAULT_SIM_HOSTS,
            partitions: DEFAULT_SIM_PARTITIONS,
            duration_secs: DEFAULT_SIM_DURATION_SECS,
            report_interval_ms: DEFAULT_SIM_REPORT_INTERVAL_MS,
        }
    }
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Message(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse(&contents).map_err(|e| {
            ConfigError::Message(format!("Failed to parse config file {:?}: {}", path, e)).into()
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Look for a configuration file in the default locations
    pub fn load_default() -> Option<Self> {
        let default_paths = [
            PathBuf::from(DEFAULT_CONFIG_FILE),
            PathBuf::from("/etc/partition-host").join(DEFAULT_CONFIG_FILE),
        ];

        for path in default_paths.iter() {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        tracing::info!("Loaded configuration from {:?}", path);
                        return Some(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        None
    }

    /// Render an example configuration file
    pub fn generate_example() -> String {
        let example = ConfigFile {
            balancer: Some(BalancerConfig::default()),
            simulation: SimulationSection::default(),
        };
        let body = toml::to_string_pretty(&example).unwrap_or_default();
        format!("# partition-host configuration\n\n{}", body)
    }
}
