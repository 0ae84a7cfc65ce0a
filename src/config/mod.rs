//! Configuration for partition-host
//!
//! [`BalancerConfig`] holds every knob of the balancing loop. It can be built
//! from code (including the presets below), read from the `[balancer]` section
//! of a TOML file, and overridden from CLI arguments or environment variables.
//!
//! ## Priority Order
//!
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file
//! 4. Default values

pub mod args;
pub mod defaults;
pub mod file;

pub use args::{CliArgs, Command, HostDisruption, SimulateArgs, SimulationPlan};
pub use defaults::*;
pub use file::{ConfigFile, SimulationSection};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Configuration for the partition balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Lease lifetime in milliseconds
    pub lease_duration_ms: u64,

    /// Interval between balancing cycles; defaults to a third of the lease
    /// duration. Must be shorter than the lease duration.
    pub balance_interval_ms: Option<u64>,

    /// Time budget for releasing leases on shutdown
    pub drain_timeout_ms: u64,

    /// Timeout applied to every individual store call
    pub store_call_timeout_ms: u64,

    /// Retries for a transient store failure within one cycle
    pub max_retries: u32,

    /// Base delay for exponential backoff
    pub retry_base_delay_ms: u64,

    /// Upper bound for a single backoff delay
    pub max_retry_delay_ms: u64,

    /// Maximum acquisitions attempted per cycle
    pub max_acquire_per_cycle: usize,

    /// Maximum voluntary releases per cycle
    pub max_release_per_cycle: usize,

    /// Consecutive failed cycles before health is reported as degraded
    pub degraded_after_failed_cycles: u32,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: DEFAULT_LEASE_DURATION_MS,
            balance_interval_ms: None,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            store_call_timeout_ms: DEFAULT_STORE_CALL_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            max_acquire_per_cycle: DEFAULT_MAX_ACQUIRE_PER_CYCLE,
            max_release_per_cycle: DEFAULT_MAX_RELEASE_PER_CYCLE,
            degraded_after_failed_cycles: DEFAULT_DEGRADED_AFTER_FAILED_CYCLES,
        }
    }
}

impl BalancerConfig {
    /// Create a configuration with shorter timeouts for testing
    pub fn for_testing() -> Self {
        Self {
            lease_duration_ms: 3_000,
            balance_interval_ms: Some(1_000),
            drain_timeout_ms: 2_000,
            store_call_timeout_ms: 500,
            max_retries: 2,
            retry_base_delay_ms: 10,
            max_retry_delay_ms: 100,
            max_acquire_per_cycle: DEFAULT_MAX_ACQUIRE_PER_CYCLE,
            max_release_per_cycle: DEFAULT_MAX_RELEASE_PER_CYCLE,
            degraded_after_failed_cycles: 2,
        }
    }

    /// Create a configuration optimized for fast failover
    pub fn low_latency() -> Self {
        Self {
            lease_duration_ms: 10_000,
            balance_interval_ms: Some(2_500),
            drain_timeout_ms: 5_000,
            store_call_timeout_ms: 1_000,
            ..Self::default()
        }
    }

    /// Create a configuration optimized for stability
    pub fn high_availability() -> Self {
        Self {
            lease_duration_ms: 60_000,
            balance_interval_ms: Some(15_000),
            drain_timeout_ms: 30_000,
            store_call_timeout_ms: 5_000,
            max_retries: 5,
            ..Self::default()
        }
    }

    /// Set the lease duration, resetting the interval to its derived default
    pub fn with_lease_duration(mut self, duration_ms: u64) -> Self {
        self.lease_duration_ms = duration_ms;
        self.balance_interval_ms = None;
        self
    }

    /// Override the balance interval
    pub fn with_balance_interval(mut self, interval_ms: u64) -> Self {
        self.balance_interval_ms = Some(interval_ms);
        self
    }

    /// Set the drain timeout
    pub fn with_drain_timeout(mut self, timeout_ms: u64) -> Self {
        self.drain_timeout_ms = timeout_ms;
        self
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Effective interval between cycles
    pub fn balance_interval(&self) -> Duration {
        Duration::from_millis(
            self.balance_interval_ms
                .unwrap_or(self.lease_duration_ms / DEFAULT_BALANCE_INTERVAL_DIVISOR),
        )
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn store_call_timeout(&self) -> Duration {
        Duration::from_millis(self.store_call_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    /// Check that every bound is usable
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration_ms == 0 {
            return Err(ConfigError::invalid_setting(
                "lease_duration_ms",
                "must be greater than zero",
            )
            .into());
        }

        let interval_ms = self.balance_interval().as_millis() as u64;
        if interval_ms == 0 {
            return Err(ConfigError::invalid_setting(
                "balance_interval_ms",
                "must be greater than zero",
            )
            .into());
        }
        if interval_ms >= self.lease_duration_ms {
            return Err(ConfigError::invalid_setting(
                "balance_interval_ms",
                format!(
                    "{} must be shorter than lease_duration_ms ({})",
                    interval_ms, self.lease_duration_ms
                ),
            )
            .into());
        }

        if self.store_call_timeout_ms == 0 {
            return Err(ConfigError::invalid_setting(
                "store_call_timeout_ms",
                "must be greater than zero",
            )
            .into());
        }
        if self.store_call_timeout_ms > interval_ms {
            return Err(ConfigError::invalid_setting(
                "store_call_timeout_ms",
                format!(
                    "{} must not exceed the balance interval ({})",
                    self.store_call_timeout_ms, interval_ms
                ),
            )
            .into());
        }

        if self.drain_timeout_ms == 0 {
            return Err(ConfigError::invalid_setting(
                "drain_timeout_ms",
                "must be greater than zero",
            )
            .into());
        }
        if self.max_acquire_per_cycle == 0 {
            return Err(ConfigError::invalid_setting(
                "max_acquire_per_cycle",
                "must be at least 1",
            )
            .into());
        }
        if self.max_release_per_cycle == 0 {
            return Err(ConfigError::invalid_setting(
                "max_release_per_cycle",
                "must be at least 1",
            )
            .into());
        }
        if self.degraded_after_failed_cycles == 0 {
            return Err(ConfigError::invalid_setting(
                "degraded_after_failed_cycles",
                "must be at least 1",
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;

    #[test]
    fn test_default_config() {
        let config = BalancerConfig::default();
        assert_eq!(config.lease_duration(), Duration::from_secs(30));
        assert_eq!(config.balance_interval(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(BalancerConfig::for_testing().validate().is_ok());
        assert!(BalancerConfig::low_latency().validate().is_ok());
        assert!(BalancerConfig::high_availability().validate().is_ok());
    }

    #[test]
    fn test_interval_must_be_shorter_than_lease() {
        let config = BalancerConfig::default()
            .with_lease_duration(1_000)
            .with_balance_interval(1_000);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, HostError::Config(_)));
        assert!(err.to_string().contains("balance_interval_ms"));
    }

    #[test]
    fn test_with_lease_duration_resets_interval() {
        let config = BalancerConfig::default()
            .with_balance_interval(500)
            .with_lease_duration(9_000);
        assert_eq!(config.balance_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = BalancerConfig {
            lease_duration_ms: 0,
            ..BalancerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = BalancerConfig {
            max_acquire_per_cycle: 0,
            ..BalancerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = BalancerConfig {
            store_call_timeout_ms: 20_000,
            ..BalancerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = BalancerConfig::for_testing();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: BalancerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, config);
    }
}
