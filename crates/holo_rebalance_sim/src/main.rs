//! Synthetic driver for the Clay rebalancer.
//!
//! Generates a skewed transactional workload over a range-partitioned table,
//! feeds it to a [`MigrationCoordinator`], and plays the execution layer: each
//! submitted unit is committed after a configurable delay and background
//! pushes are acknowledged in-process. Per-partition load is logged on every
//! report tick so the effect of each round is visible.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use holo_rebalance::{
    spawn_launch_controller, CoordinatorPhase, MigrationCoordinator, MigrationExecutor,
    MigrationPayload, MigrationRequest, PartitionId, PushTransport, RangePartitioner, RebalanceArgs, RecordKey,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-rebalance-sim")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for one simulation run.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    rebalance: RebalanceArgs,

    /// Table every generated key belongs to.
    #[arg(long, default_value = "usertable")]
    table: String,

    /// Ids owned by each partition under static range partitioning.
    #[arg(long, default_value_t = 1_000)]
    keys_per_partition: u64,

    /// Partition whose leading ids form the hot set.
    #[arg(long, default_value_t = 0)]
    hot_partition: usize,

    /// Number of hot ids.
    #[arg(long, default_value_t = 40)]
    hot_keys: u64,

    /// Percent of transactions that touch the hot set.
    #[arg(long, default_value_t = 60)]
    hot_pct: u8,

    /// Keys accessed by each transaction.
    #[arg(long, default_value_t = 2)]
    txn_size: usize,

    /// Interval between generated transactions.
    #[arg(long, default_value = "1ms")]
    txn_interval: humantime::Duration,

    /// Time a submitted migration unit takes to commit.
    #[arg(long, default_value = "200ms")]
    migration_delay: humantime::Duration,

    /// Record size reported to the byte-budgeted background push.
    #[arg(long, default_value_t = 1_000)]
    record_bytes: usize,

    /// Interval between load reports.
    #[arg(long, default_value = "5s")]
    report_interval: humantime::Duration,

    /// Total runtime.
    #[arg(long, default_value = "2m")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

/// Hands submitted units back to the simulation loop.
struct LoopbackExecutor {
    submitted: mpsc::UnboundedSender<MigrationRequest>,
}

impl MigrationExecutor for LoopbackExecutor {
    fn submit(&mut self, request: MigrationRequest) -> anyhow::Result<()> {
        self.submitted
            .send(request)
            .map_err(|_| anyhow::anyhow!("simulation loop closed"))
    }
}

/// Acknowledges every background push and counts the records.
struct LoopbackTransport {
    record_bytes: usize,
    pushed: AtomicU64,
}

#[async_trait]
impl PushTransport for LoopbackTransport {
    fn record_size(&self, _table: &str) -> usize {
        self.record_bytes
    }

    async fn push(&self, source: PartitionId, dest: PartitionId, keys: Vec<RecordKey>) -> anyhow::Result<()> {
        tracing::debug!(source, dest, keys = keys.len(), "background push");
        self.pushed.fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Skewed key generator: hot transactions read adjacent hot ids together.
struct Workload {
    rng: SmallRng,
    table: String,
    total_ids: u64,
    hot_start: u64,
    hot_keys: u64,
    hot_pct: u8,
    txn_size: usize,
}

impl Workload {
    fn next_txn(&mut self) -> Vec<RecordKey> {
        let hot = self.rng.gen_range(0..100) < u32::from(self.hot_pct);
        let ids: Vec<u64> = if hot {
            let first = self.rng.gen_range(0..self.hot_keys);
            (0..self.txn_size as u64)
                .map(|offset| self.hot_start + (first + offset) % self.hot_keys)
                .collect()
        } else {
            (0..self.txn_size)
                .map(|_| self.rng.gen_range(0..self.total_ids))
                .collect()
        };
        ids.into_iter()
            .map(|id| RecordKey::new(self.table.clone(), id))
            .collect()
    }
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,holo_rebalance=info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.keys_per_partition > 0, "--keys-per-partition must be > 0");
    anyhow::ensure!(args.hot_keys > 0, "--hot-keys must be > 0");
    anyhow::ensure!(args.hot_pct <= 100, "--hot-pct must be <= 100");
    anyhow::ensure!(args.txn_size > 0, "--txn-size must be > 0");
    anyhow::ensure!(!args.txn_interval.is_zero(), "--txn-interval must be > 0");
    anyhow::ensure!(!args.report_interval.is_zero(), "--report-interval must be > 0");

    let cfg = args.rebalance.coordinator_config();
    anyhow::ensure!(
        args.hot_partition < cfg.num_partitions,
        "--hot-partition must be < --num-partitions"
    );
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let partitioner = RangePartitioner::new(cfg.num_partitions, args.keys_per_partition);
    let hot_start = partitioner.partition_range(args.hot_partition).start;
    let mut workload = Workload {
        rng: SmallRng::seed_from_u64(seed),
        table: args.table.clone(),
        total_ids: cfg.num_partitions as u64 * args.keys_per_partition,
        hot_start,
        hot_keys: args.hot_keys.min(args.keys_per_partition),
        hot_pct: args.hot_pct,
        txn_size: args.txn_size,
    };

    let (submit_tx, mut submit_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(LoopbackTransport {
        record_bytes: args.record_bytes,
        pushed: AtomicU64::new(0),
    });
    let num_partitions = cfg.num_partitions;
    let mut coord = MigrationCoordinator::new(
        cfg,
        partitioner.clone(),
        LoopbackExecutor {
            submitted: submit_tx,
        },
    )
    .with_cold_planner(Box::new(partitioner))
    .with_background_push(transport.clone(), tokio::runtime::Handle::current());

    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let controller = spawn_launch_controller(
        coord.flags(),
        control_tx,
        args.rebalance.launch_controller_config(),
    );

    tracing::info!(seed, num_partitions, hot_partition = args.hot_partition, "simulation started");

    let migration_delay: Duration = args.migration_delay.into();
    let deadline = time::Instant::now() + Duration::from(args.duration);
    let mut txn_ticker = time::interval(args.txn_interval.into());
    let mut report_ticker = time::interval(args.report_interval.into());
    let mut loads = vec![0u64; num_partitions];
    let mut pending: Option<(MigrationRequest, time::Instant)> = None;

    loop {
        tokio::select! {
            _ = time::sleep_until(deadline) => break,
            Some(request) = control_rx.recv() => {
                coord.handle_control(request, std::time::Instant::now())?;
            }
            Some(request) = submit_rx.recv() => {
                pending = Some((request, time::Instant::now() + migration_delay));
            }
            _ = txn_ticker.tick() => {
                let keys = workload.next_txn();
                for key in &keys {
                    loads[coord.current_location(key)] += 1;
                }
                coord
                    .on_transaction_observed(&keys, std::time::Instant::now())
                    .context("observe transaction")?;

                if pending.as_ref().is_some_and(|(_, due)| time::Instant::now() >= *due) {
                    if let Some((request, _)) = pending.take() {
                        commit_unit(&mut coord, &args.table, request)?;
                    }
                }
            }
            _ = report_ticker.tick() => {
                tracing::info!(
                    phase = ?coord.phase(),
                    loads = ?loads,
                    relocated = coord.partitions().directory().len(),
                    "partition load"
                );
                loads.iter_mut().for_each(|load| *load = 0);
            }
        }
        if coord.phase() == CoordinatorPhase::Aborted {
            break;
        }
    }

    controller.abort();
    tracing::info!(
        phase = ?coord.phase(),
        relocated = coord.partitions().directory().len(),
        pushed = transport.pushed.load(Ordering::Relaxed),
        "simulation finished"
    );
    Ok(())
}

/// Play the execution layer for one unit: analyze on the source, move every
/// key, then commit.
fn commit_unit(
    coord: &mut MigrationCoordinator<RangePartitioner, LoopbackExecutor>,
    table: &str,
    request: MigrationRequest,
) -> anyhow::Result<()> {
    let keys = match request.payload {
        MigrationPayload::Keys(keys) => keys,
        MigrationPayload::Range(range) => (range.start..range.end)
            .map(|id| RecordKey::new(table, id))
            .collect(),
    };
    if request.source == coord.config().local_partition {
        coord.analysis_complete(keys.clone())?;
    }
    coord.record_relocated(&keys)?;
    coord
        .on_unit_committed(std::time::Instant::now())
        .context("commit migration unit")
}
