//! Command-line arguments for partition-host
//!
//! This module defines the CLI arguments structure using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use super::defaults::*;
use super::file::ConfigFile;
use super::BalancerConfig;
use crate::error::{HostError, Result};

/// Command-line arguments for partition-host
#[derive(Parser, Debug, Clone)]
#[command(name = "partition-host")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lease-based partition ownership for stream consumers")]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    /// If not specified, looks for partition-host.toml in current directory
    /// or /etc/partition-host/
    #[arg(short, long, env = "PARTITION_HOST_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PARTITION_HOST_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL, global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run several hosts in-process against shared in-memory stores
    Simulate(SimulateArgs),

    /// Print an example configuration file and exit
    GenerateConfig,
}

/// Arguments for `simulate`
///
/// Unset options fall back to the configuration file, then to defaults.
#[derive(Args, Debug, Clone, Default)]
pub struct SimulateArgs {
    /// Number of hosts to start
    #[arg(long, env = "PARTITION_HOST_HOSTS")]
    pub hosts: Option<usize>,

    /// Number of partitions in the simulated stream
    #[arg(long, env = "PARTITION_HOST_PARTITIONS")]
    pub partitions: Option<u32>,

    /// Lease duration in milliseconds
    #[arg(long, env = "PARTITION_HOST_LEASE_DURATION_MS")]
    pub lease_duration_ms: Option<u64>,

    /// Interval between balancing cycles in milliseconds
    #[arg(long, env = "PARTITION_HOST_BALANCE_INTERVAL_MS")]
    pub balance_interval_ms: Option<u64>,

    /// Shutdown drain budget in milliseconds
    #[arg(long, env = "PARTITION_HOST_DRAIN_TIMEOUT_MS")]
    pub drain_timeout_ms: Option<u64>,

    /// Total run time in seconds
    #[arg(long, env = "PARTITION_HOST_DURATION_SECS")]
    pub duration_secs: Option<u64>,

    /// Interval between ownership reports in milliseconds
    #[arg(long, env = "PARTITION_HOST_REPORT_INTERVAL_MS")]
    pub report_interval_ms: Option<u64>,

    /// Gracefully stop the host with this index after `--stop-after-secs`
    #[arg(long, requires = "stop_after_secs")]
    pub stop_host: Option<usize>,

    #[arg(long)]
    pub stop_after_secs: Option<u64>,

    /// Abort the host with this index (no lease release) after `--crash-after-secs`
    #[arg(long, requires = "crash_after_secs")]
    pub crash_host: Option<usize>,

    #[arg(long)]
    pub crash_after_secs: Option<u64>,

    /// Emit reports as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// A scheduled disruption of one simulated host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostDisruption {
    pub host_index: usize,
    pub after: Duration,
}

/// Fully resolved settings for a simulation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationPlan {
    pub balancer: BalancerConfig,
    pub hosts: usize,
    pub partitions: u32,
    pub duration: Duration,
    pub report_interval: Duration,
    pub stop: Option<HostDisruption>,
    pub crash: Option<HostDisruption>,
    pub json: bool,
}

impl SimulateArgs {
    /// Merge these arguments over the file configuration
    pub fn resolve(&self, file: &ConfigFile) -> Result<SimulationPlan> {
        let mut balancer = file
            .balancer
            .clone()
            .unwrap_or_else(|| {
                BalancerConfig::default().with_lease_duration(DEFAULT_SIM_LEASE_DURATION_MS)
            });

        if let Some(lease_ms) = self.lease_duration_ms {
            balancer = balancer.with_lease_duration(lease_ms);
        }
        if let Some(interval_ms) = self.balance_interval_ms {
            balancer = balancer.with_balance_interval(interval_ms);
        }
        if let Some(drain_ms) = self.drain_timeout_ms {
            balancer = balancer.with_drain_timeout(drain_ms);
        }
        // Keep the per-call timeout inside the interval when only the lease was shortened.
        let interval_ms = balancer.balance_interval().as_millis() as u64;
        if balancer.store_call_timeout_ms > interval_ms {
            balancer.store_call_timeout_ms = interval_ms.max(1);
        }
        balancer.validate()?;

        let hosts = self.hosts.unwrap_or(file.simulation.hosts);
        if hosts == 0 {
            return Err(HostError::config("hosts", "must be at least 1"));
        }
        let partitions = self.partitions.unwrap_or(file.simulation.partitions);
        if partitions == 0 {
            return Err(HostError::config("partitions", "must be at least 1"));
        }

        let stop = disruption("stop_host", self.stop_host, self.stop_after_secs, hosts)?;
        let crash = disruption("crash_host", self.crash_host, self.crash_after_secs, hosts)?;

        Ok(SimulationPlan {
            balancer,
            hosts,
            partitions,
            duration: Duration::from_secs(
                self.duration_secs
                    .unwrap_or(file.simulation.duration_secs),
            ),
            report_interval: Duration::from_millis(
                self.report_interval_ms
                    .unwrap_or(file.simulation.report_interval_ms)
                    .max(1),
            ),
            stop,
            crash,
            json: self.json,
        })
    }
}

fn disruption(
    setting: &str,
    host_index: Option<usize>,
    after_secs: Option<u64>,
    hosts: usize,
) -> Result<Option<HostDisruption>> {
    match host_index {
        None => Ok(None),
        Some(index) if index >= hosts => Err(HostError::config(
            setting,
            format!("host index {} out of range (0..{})", index, hosts),
        )),
        Some(index) => Ok(Some(HostDisruption {
            host_index: index,
            after: Duration::from_secs(after_secs.unwrap_or(0)),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simulate_command() {
        let args = CliArgs::try_parse_from([
            "partition-host",
            "simulate",
            "--hosts",
            "4",
            "--partitions",
            "16",
            "--crash-host",
            "1",
            "--crash-after-secs",
            "5",
        ])
        .unwrap();

        match args.command {
            Command::Simulate(sim) => {
                assert_eq!(sim.hosts, Some(4));
                assert_eq!(sim.partitions, Some(16));
                assert_eq!(sim.crash_host, Some(1));
                assert_eq!(sim.crash_after_secs, Some(5));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = ConfigFile::parse(
            r#"
            [balancer]
            lease_duration_ms = 9000

            [simulation]
            hosts = 5
            partitions = 10
            "#,
        )
        .unwrap();
        let args = SimulateArgs {
            hosts: Some(2),
            lease_duration_ms: Some(6_000),
            ..SimulateArgs::default()
        };

        let plan = args.resolve(&file).unwrap();
        assert_eq!(plan.hosts, 2);
        assert_eq!(plan.partitions, 10);
        assert_eq!(plan.balancer.lease_duration_ms, 6_000);
        assert_eq!(plan.balancer.balance_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_defaults_without_file() {
        let plan = SimulateArgs::default().resolve(&ConfigFile::default()).unwrap();
        assert_eq!(plan.hosts, DEFAULT_SIM_HOSTS);
        assert_eq!(plan.partitions, DEFAULT_SIM_PARTITIONS);
        assert_eq!(plan.balancer.lease_duration_ms, DEFAULT_SIM_LEASE_DURATION_MS);
        assert!(plan.stop.is_none());
    }

    #[test]
    fn test_disruption_out_of_range() {
        let args = SimulateArgs {
            hosts: Some(2),
            stop_host: Some(2),
            stop_after_secs: Some(1),
            ..SimulateArgs::default()
        };
        assert!(args.resolve(&ConfigFile::default()).is_err());
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let args = SimulateArgs {
            lease_duration_ms: Some(1_000),
            balance_interval_ms: Some(2_000),
            ..SimulateArgs::default()
        };
        assert!(args.resolve(&ConfigFile::default()).is_err());
    }
}
