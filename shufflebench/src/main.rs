//! Benchmark driver: runs shuffle rounds over the in-process fabric and
//! reports per-phase timings.

mod report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rankwire::{sim, Communicator};
use shufflecast::aggregators::{self, ElectionPolicy};
use shufflecast::binding::{bind_local, BindMode};
use shufflecast::engine::{shuffle, RoundContext, Variant};
use shufflecast::metrics::{gather_series, reduce_max, RoundMetrics};
use shufflecast::pattern;
use shufflecast::plan::{benchmark_plan, Direction};
use shufflecast::topology::{SyntheticLayout, Topology};

#[derive(Parser)]
#[command(about = "Topology-aware collective shuffle benchmarks")]
struct Args {
    /// World size (ranks of the in-process fabric).
    #[arg(short = 'n', long, default_value_t = 8)]
    ranks: usize,
    /// Number of global aggregators.
    #[arg(short = 'a', long, default_value_t = 1)]
    aggregators: usize,
    /// Processes per node of the static topology.
    #[arg(short = 'p', long, default_value_t = 1)]
    procs_per_node: usize,
    /// Data size unit: a producer ships `1 + rank mod unit` bytes per pair.
    #[arg(short = 'd', long, default_value_t = 1)]
    data_size: usize,
    /// Throttle: maximum concurrent outstanding requests (0 = unlimited).
    #[arg(short = 'c', long, default_value_t = 0)]
    throttle: usize,
    /// Barrier-separated experiments.
    #[arg(short = 'i', long, default_value_t = 1)]
    experiments: usize,
    /// Inner repeats per experiment.
    #[arg(short = 'k', long, default_value_t = 1)]
    repeats: usize,
    /// Aggregator election policy: 0 contiguous, 1 stride,
    /// 2 shifted-stride, 3 node-round-robin.
    #[arg(short = 't', long, default_value_t = 1)]
    policy: usize,
    /// Barrier type for the scattered schedule: 0 none, 1 per block.
    #[arg(short = 'b', long, default_value_t = 0)]
    barrier: usize,
    /// Method selector: 0 runs every variant, 1-based index otherwise.
    #[arg(short = 'm', long, default_value_t = 0)]
    method: usize,
    /// Local aggregators per node for the hierarchical movers.
    #[arg(long, default_value_t = 1)]
    co: usize,
    /// Binder mode: spread or cover.
    #[arg(long, default_value = "cover")]
    bind_mode: String,
    /// Directory receiving the CSV reports.
    #[arg(long, default_value = ".")]
    out: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Two-rank blocking exchange statistics.
    Pingpong {
        /// Message size in bytes.
        #[arg(short = 'd', long, default_value_t = 1024)]
        data_size: usize,
        /// Timed repeats.
        #[arg(short = 'k', long, default_value_t = 16)]
        repeats: usize,
        /// Exchanges per repeat.
        #[arg(short = 'i', long, default_value_t = 64)]
        runs: usize,
    },
}

#[derive(Clone)]
struct BenchConfig {
    ranks: usize,
    aggregator_count: usize,
    procs_per_node: usize,
    data_size: usize,
    throttle: usize,
    experiments: usize,
    repeats: usize,
    policy: ElectionPolicy,
    methods: Vec<Variant>,
    co: usize,
    bind_mode: BindMode,
    out: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    match args.command {
        Some(Command::Pingpong { data_size, repeats, runs }) => {
            pingpong(data_size, repeats, runs, args.out).await
        }
        None => bench(args).await,
    }
}

fn parse_policy(policy: usize, procs_per_node: usize) -> Result<ElectionPolicy> {
    Ok(match policy {
        0 => ElectionPolicy::Contiguous,
        1 => ElectionPolicy::Stride,
        2 => ElectionPolicy::ShiftedStride(procs_per_node),
        3 => ElectionPolicy::NodeRoundRobin,
        other => anyhow::bail!("unknown election policy {other}"),
    })
}

async fn bench(args: Args) -> Result<()> {
    let methods = if args.method == 0 {
        let mut all = Variant::ALL.to_vec();
        if args.barrier != 0 {
            all.retain(|v| *v != Variant::Scattered);
        } else {
            all.retain(|v| *v != Variant::ScatteredBarrier);
        }
        all
    } else {
        let variant = Variant::from_method(args.method)
            .with_context(|| format!("unknown method {}", args.method))?;
        vec![variant]
    };
    let config = BenchConfig {
        ranks: args.ranks,
        aggregator_count: args.aggregators,
        procs_per_node: args.procs_per_node,
        data_size: args.data_size,
        throttle: if args.throttle == 0 { usize::MAX } else { args.throttle },
        experiments: args.experiments,
        repeats: args.repeats,
        policy: parse_policy(args.policy, args.procs_per_node)?,
        methods,
        co: args.co,
        bind_mode: match args.bind_mode.as_str() {
            "spread" => BindMode::Spread,
            "cover" => BindMode::Cover,
            other => anyhow::bail!("unknown bind mode {other}"),
        },
        out: args.out,
    };

    let localities = sim::contiguous_localities(config.ranks, config.procs_per_node);
    let results = sim::run_world(localities, |comm| {
        let config = config.clone();
        async move { run_ranks(comm, config).await }
    })
    .await?;
    for result in results {
        result?;
    }
    Ok(())
}

/// The per-rank benchmark loop: experiments × methods × repeats, with a
/// barrier separating rounds, verification after every round, and rank 0
/// reporting.
async fn run_ranks(comm: Arc<dyn Communicator>, config: BenchConfig) -> Result<()> {
    let n = comm.size();
    let rank = comm.rank();
    let topology = Topology::synthetic(n, rank, config.procs_per_node, SyntheticLayout::Contiguous)?;
    let elected = aggregators::elect(n, config.aggregator_count, &topology, config.policy)?;
    let binding = bind_local(&topology, &elected, config.co, config.bind_mode)?;

    let mut round_id = 0u32;
    for _experiment in 0..config.experiments {
        for &variant in &config.methods {
            let direction =
                if variant.is_scatter() { Direction::Scatter } else { Direction::Gather };
            let mut series = Vec::with_capacity(config.repeats);
            for _repeat in 0..config.repeats {
                let mut plan =
                    benchmark_plan(direction, n, rank, &elected, config.data_size, round_id)?;
                pattern::fill(&mut plan, rank);
                comm.barrier().await?;
                let ctx = RoundContext {
                    comm: &comm,
                    topology: &topology,
                    binding: &binding,
                    throttle: config.throttle,
                };
                let mut metrics = RoundMetrics::default();
                shuffle(variant, &ctx, &mut plan, &mut metrics).await?;
                pattern::verify(&plan, rank)?;

                let max = reduce_max(&comm, &metrics, 0).await?;
                if let Some(max) = max {
                    let row = report::SummaryRow {
                        method: variant.name(),
                        ranks: n,
                        aggregators: elected.len(),
                        data_size: config.data_size,
                        throttle: config.throttle,
                        repeats: config.repeats,
                        policy: config.policy.name(),
                        rank0: metrics,
                        max,
                    };
                    report::print_summary(&row);
                    if let Err(err) = report::append_summary(&config.out.join("shuffle_results.csv"), &row) {
                        tracing::warn!(%err, "failed to append the summary row");
                    }
                }
                series.push(metrics);
                round_id += 1;
            }
            let gathered = gather_series(&comm, &series).await?;
            if rank == 0 {
                if let Err(err) = report::write_details(&config.out, variant.name(), &gathered) {
                    tracing::warn!(%err, "failed to write detail files");
                }
            }
        }
    }
    Ok(())
}

/// Two-rank blocking-exchange statistics, one CSV row per timed repeat.
async fn pingpong(data_size: usize, repeats: usize, runs: usize, out: PathBuf) -> Result<()> {
    anyhow::ensure!(data_size > 0, "message size must be at least 1");
    let results = sim::run_world(vec!["node0".to_owned(); 2], |comm| async move {
        let rank = comm.rank();
        let peer = 1 - rank;
        let payload = bytes::Bytes::from(vec![0x5au8; data_size]);
        let mut timings = Vec::with_capacity(repeats);
        for _ in 0..repeats {
            let started = Instant::now();
            for _ in 0..runs {
                if rank == 0 {
                    let request = comm.irecv(peer, 1, data_size)?;
                    request.wait().await?;
                } else {
                    let request = comm.isend(peer, 1, payload.clone())?;
                    request.wait().await?;
                }
            }
            timings.push(started.elapsed().as_secs_f64());
            comm.barrier().await?;
        }
        Ok::<Vec<f64>, rankwire::CommError>(timings)
    })
    .await?;

    let mut per_rank = Vec::new();
    for result in results {
        per_rank.push(result?);
    }
    let timings = per_rank.swap_remove(0);
    let mean = timings.iter().sum::<f64>() / timings.len() as f64;
    let var = timings.iter().map(|t| t * t).sum::<f64>() / timings.len() as f64 - mean * mean;
    println!(
        "pingpong mean = {:.6}, std = {:.6}, repeats = {}, runs = {}",
        mean,
        var.max(0.0).sqrt(),
        repeats,
        runs
    );
    let path = out.join("sendrecv_results.csv");
    let body: String = timings.iter().map(|t| format!("{t:.6}\n")).collect();
    if let Err(err) = std::fs::write(&path, body) {
        tracing::warn!(%err, "failed to write ping-pong results");
    }
    Ok(())
}
