//! partition-host - lease-based partition ownership simulator
//!
//! Runs several hosts in one process against shared in-memory stores and
//! prints who owns what as they join, leave and crash.

use clap::Parser;
use partition_host::clock::Clock;
use partition_host::config::{CliArgs, Command, ConfigFile, SimulationPlan};
use partition_host::storage::{
    CheckpointStore, InMemoryCheckpointStore, InMemoryLeaseStore, LeaseStore,
};
use partition_host::testing::RecordingPump;
use partition_host::{
    init_logging, HostError, HostName, PartitionBalancer, Result, StaticPartitions,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("partition-host failed: {e}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    let sim = match args.command {
        Command::GenerateConfig => {
            println!("{}", ConfigFile::generate_example());
            return Ok(());
        }
        Command::Simulate(sim) => sim,
    };

    init_logging(&args.log_level)?;

    let config_file = match args.config {
        Some(ref path) => ConfigFile::load(path)?,
        None => ConfigFile::load_default().unwrap_or_default(),
    };
    let plan = match sim.resolve(&config_file) {
        Ok(plan) => plan,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(simulate(plan))
}

/// One line of ownership output
#[derive(Debug, Serialize)]
struct OwnershipReport {
    elapsed_ms: u64,
    /// Owner per partition, empty when free
    owners: BTreeMap<String, String>,
    /// Partition count per live host
    counts: BTreeMap<String, usize>,
}

struct SimHost {
    balancer: Arc<PartitionBalancer>,
    pump: Arc<RecordingPump>,
    running: bool,
}

async fn simulate(plan: SimulationPlan) -> Result<()> {
    info!(
        hosts = plan.hosts,
        partitions = plan.partitions,
        lease_duration_ms = plan.balancer.lease_duration_ms,
        "Starting simulation"
    );

    let lease_store: Arc<dyn LeaseStore> =
        Arc::new(InMemoryLeaseStore::new(plan.balancer.lease_duration()));
    let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let discovery = Arc::new(StaticPartitions::count(plan.partitions));

    let mut hosts = Vec::with_capacity(plan.hosts);
    for index in 0..plan.hosts {
        let pump = Arc::new(RecordingPump::new());
        let balancer = Arc::new(PartitionBalancer::new(
            HostName::new(format!("host-{}", index))?,
            plan.balancer.clone(),
            Arc::clone(&lease_store),
            Arc::clone(&checkpoint_store),
            pump.clone(),
            discovery.clone(),
        )?);
        balancer.start()?;
        hosts.push(SimHost {
            balancer,
            pump,
            running: true,
        });
    }

    let started = Instant::now();
    let mut report_timer = tokio::time::interval(plan.report_interval);
    let end = tokio::time::sleep(plan.duration);
    tokio::pin!(end);

    loop {
        tokio::select! {
            _ = &mut end => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = report_timer.tick() => {
                let elapsed = started.elapsed();
                disrupt(&plan, &mut hosts, elapsed).await;
                report(&plan, lease_store.as_ref(), elapsed).await?;
            }
        }
    }

    for host in hosts.iter_mut().filter(|h| h.running) {
        host.balancer.shutdown().await;
        host.running = false;
    }
    report(&plan, lease_store.as_ref(), started.elapsed()).await?;

    for host in &hosts {
        let stats = host.balancer.stats();
        info!(
            host = %host.balancer.host(),
            acquisitions = stats.acquisitions,
            releases = stats.releases,
            losses = stats.losses,
            epoch_bumps = stats.epoch_bumps,
            pump_starts = host.pump.starts().len(),
            "Host summary"
        );
    }
    Ok(())
}

/// Apply the scheduled stop and crash once their time has come
async fn disrupt(plan: &SimulationPlan, hosts: &mut [SimHost], elapsed: Duration) {
    if let Some(stop) = plan.stop {
        let host = &mut hosts[stop.host_index];
        if host.running && elapsed >= stop.after {
            info!(host = %host.balancer.host(), "Stopping host gracefully");
            host.balancer.shutdown().await;
            host.running = false;
        }
    }
    if let Some(crash) = plan.crash {
        let host = &mut hosts[crash.host_index];
        if host.running && elapsed >= crash.after {
            warn!(host = %host.balancer.host(), "Crashing host");
            host.balancer.abort().await;
            host.running = false;
        }
    }
}

async fn report(
    plan: &SimulationPlan,
    lease_store: &dyn LeaseStore,
    elapsed: Duration,
) -> Result<()> {
    let now_ms = partition_host::clock::SystemClock.now_ms();
    let leases = lease_store.list_leases().await?;

    let mut owners = BTreeMap::new();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for lease in leases {
        if partition_host::host::is_presence_key(&lease.partition_id) {
            if !lease.is_free_at(now_ms) {
                counts.entry(lease.owner).or_insert(0);
            }
            continue;
        }
        let owner = if lease.is_free_at(now_ms) {
            String::new()
        } else {
            *counts.entry(lease.owner.clone()).or_insert(0) += 1;
            lease.owner
        };
        owners.insert(lease.partition_id, owner);
    }

    let line = OwnershipReport {
        elapsed_ms: elapsed.as_millis() as u64,
        owners,
        counts,
    };
    if plan.json {
        println!("{}", serde_json::to_string(&line).map_err(HostError::from)?);
    } else {
        let counts: Vec<String> = line
            .counts
            .iter()
            .map(|(host, n)| format!("{}={}", host, n))
            .collect();
        let owners: Vec<String> = line
            .owners
            .iter()
            .map(|(p, o)| format!("{}:{}", p, if o.is_empty() { "-" } else { o }))
            .collect();
        println!(
            "[{:>6}ms] {}  |  {}",
            line.elapsed_ms,
            counts.join(" "),
            owners.join(" ")
        );
    }
    Ok(())
}
