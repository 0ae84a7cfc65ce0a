//! Default constants for partition-host configuration
//!
//! These constants define the default values used throughout the configuration
//! system when no explicit value is provided.

/// Default lease lifetime in milliseconds (30 seconds)
pub const DEFAULT_LEASE_DURATION_MS: u64 = 30_000;

/// Divisor applied to the lease duration to derive the balance interval
/// when none is configured. One third tolerates one missed cycle.
pub const DEFAULT_BALANCE_INTERVAL_DIVISOR: u64 = 3;

/// Default time budget for releasing leases on shutdown
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 10_000;

/// Default timeout applied to every individual store call
pub const DEFAULT_STORE_CALL_TIMEOUT_MS: u64 = 2_000;

/// Default number of retries for a transient store failure within a cycle
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff between retries
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;

/// Upper bound for a single backoff delay
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 2_000;

/// Default cap on acquisitions attempted per cycle
pub const DEFAULT_MAX_ACQUIRE_PER_CYCLE: usize = 32;

/// Default cap on voluntary releases per cycle
pub const DEFAULT_MAX_RELEASE_PER_CYCLE: usize = 8;

/// Consecutive failed cycles before the host reports degraded health
pub const DEFAULT_DEGRADED_AFTER_FAILED_CYCLES: u32 = 3;

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default configuration file name searched in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "partition-host.toml";

/// Default number of hosts started by `simulate`
pub const DEFAULT_SIM_HOSTS: usize = 3;

/// Default number of partitions used by `simulate`
pub const DEFAULT_SIM_PARTITIONS: u32 = 8;

/// Default run time of `simulate` in seconds
pub const DEFAULT_SIM_DURATION_SECS: u64 = 20;

/// Default interval between ownership reports in `simulate`
pub const DEFAULT_SIM_REPORT_INTERVAL_MS: u64 = 2_000;

/// Lease duration used by `simulate` unless overridden
pub const DEFAULT_SIM_LEASE_DURATION_MS: u64 = 3_000;
