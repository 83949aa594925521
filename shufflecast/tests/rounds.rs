//! End-to-end shuffle rounds over the in-process fabric: every schedule
//! variant against one verification harness, plus the seeded scenarios.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rankwire::{sim, Communicator};
use shufflecast::binding::{bind_local, BindMode};
use shufflecast::engine::{shuffle, RoundContext, Variant};
use shufflecast::metrics::RoundMetrics;
use shufflecast::plan::{benchmark_plan, exchange_sizes, Direction, ShufflePlan};
use shufflecast::topology::{SyntheticLayout, Topology};
use shufflecast::{aggregators, pattern};

/// All schedules that move producer data toward the aggregators.
const GATHER_VARIANTS: [Variant; 14] = [
    Variant::AllToMany,
    Variant::AllToManyStriped,
    Variant::AllToManyBalanced,
    Variant::AllToManyPresend,
    Variant::AllToManyControl,
    Variant::Scattered,
    Variant::ScatteredBarrier,
    Variant::Pairwise,
    Variant::Sync,
    Variant::HalfSync,
    Variant::Collective,
    Variant::TamGather,
    Variant::TamBound,
    Variant::TamWindowed,
];

struct Setup {
    per_node: usize,
    aggregators: Vec<usize>,
    co: usize,
    mode: BindMode,
    direction: Direction,
    data_size: usize,
    throttle: usize,
}

/// Runs one round under `variant` and returns this rank's verified receive
/// buffer, concatenated by source.
async fn run_round(
    comm: &Arc<dyn Communicator>,
    setup: &Setup,
    variant: Variant,
    round: u32,
) -> Vec<u8> {
    let n = comm.size();
    let rank = comm.rank();
    let topology =
        Topology::synthetic(n, rank, setup.per_node, SyntheticLayout::Contiguous).unwrap();
    let binding = bind_local(&topology, &setup.aggregators, setup.co, setup.mode).unwrap();
    let mut plan =
        benchmark_plan(setup.direction, n, rank, &setup.aggregators, setup.data_size, round)
            .unwrap();
    pattern::fill(&mut plan, rank);
    let ctx = RoundContext {
        comm,
        topology: &topology,
        binding: &binding,
        throttle: setup.throttle,
    };
    let mut metrics = RoundMetrics::default();
    shuffle(variant, &ctx, &mut plan, &mut metrics).await.unwrap();
    pattern::verify(&plan, rank).unwrap();
    assert!(metrics.total >= metrics.barrier);
    (0..n).flat_map(|src| plan.recv_part(src).to_vec()).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn eight_ranks_every_gather_variant_is_byte_identical() {
    // Scenario: 8 ranks, 2 per node, K=4 contiguous, data unit 16,
    // unlimited throttle.
    let outputs = sim::run_world(vec!["n".to_owned(); 8], |comm| async move {
        let setup = Setup {
            per_node: 2,
            aggregators: vec![0, 1, 2, 3],
            co: 1,
            mode: BindMode::Cover,
            direction: Direction::Gather,
            data_size: 16,
            throttle: usize::MAX,
        };
        let mut buffers = Vec::new();
        for (index, &variant) in GATHER_VARIANTS.iter().enumerate() {
            buffers.push(run_round(&comm, &setup, variant, index as u32).await);
        }
        buffers
    })
    .await
    .unwrap();

    for (rank, buffers) in outputs.iter().enumerate() {
        for buffer in &buffers[1..] {
            assert_eq!(&buffers[0], buffer, "variant diverged at rank {rank}");
        }
        // Each aggregator collects 1..=8 bytes over the 8 producers.
        let expected = if rank < 4 { (1..=8).sum::<usize>() } else { 0 };
        assert_eq!(expected, buffers[0].len());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn scatter_direction_variants_agree() {
    let outputs = sim::run_world(vec!["n".to_owned(); 8], |comm| async move {
        let setup = Setup {
            per_node: 2,
            aggregators: vec![0, 4],
            co: 1,
            mode: BindMode::Cover,
            direction: Direction::Scatter,
            data_size: 5,
            throttle: 3,
        };
        let flat = run_round(&comm, &setup, Variant::ManyToAll, 0).await;
        let balanced = run_round(&comm, &setup, Variant::ManyToAllBalanced, 1).await;
        (flat, balanced)
    })
    .await
    .unwrap();
    for (flat, balanced) in &outputs {
        assert_eq!(flat, balanced);
        // Every rank hears one byte from aggregator 0 and five from 4.
        assert_eq!(6, flat.len());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn stride_pair_of_aggregators_under_throttle_two() {
    // Scenario: 16 ranks, 4 per node, K=2 stride elects {0, 8}, one byte
    // per pair, throttle 2.
    let outputs = sim::run_world(vec!["n".to_owned(); 16], |comm| async move {
        let n = comm.size();
        let rank = comm.rank();
        let topology = Topology::synthetic(n, rank, 4, SyntheticLayout::Contiguous).unwrap();
        let elected =
            aggregators::elect(n, 2, &topology, aggregators::ElectionPolicy::Stride).unwrap();
        assert_eq!(vec![0, 8], elected);
        let setup = Setup {
            per_node: 4,
            aggregators: elected,
            co: 1,
            mode: BindMode::Cover,
            direction: Direction::Gather,
            data_size: 1,
            throttle: 2,
        };
        run_round(&comm, &setup, Variant::AllToMany, 0).await
    })
    .await
    .unwrap();

    for (rank, buffer) in outputs.iter().enumerate() {
        // Aggregators complete 16 one-byte receives; everyone else none.
        let expected = if rank == 0 || rank == 8 { 16 } else { 0 };
        assert_eq!(expected, buffer.len(), "rank {rank}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn flat_and_collective_agree_on_all_to_all() {
    // Scenario: 4 ranks, 2 per node, every rank an aggregator (the "all"
    // stripe shape).
    let outputs = sim::run_world(vec!["n".to_owned(); 4], |comm| async move {
        let topology =
            Topology::synthetic(comm.size(), comm.rank(), 2, SyntheticLayout::Contiguous).unwrap();
        let setup = Setup {
            per_node: 2,
            aggregators: shufflecast::plan::stripe_aggregators(
                shufflecast::plan::StripeShape::All,
                &topology,
            ),
            co: 2,
            mode: BindMode::Cover,
            direction: Direction::Gather,
            data_size: 3,
            throttle: usize::MAX,
        };
        let flat = run_round(&comm, &setup, Variant::AllToMany, 0).await;
        let collective = run_round(&comm, &setup, Variant::Collective, 1).await;
        (flat, collective)
    })
    .await
    .unwrap();
    for (flat, collective) in &outputs {
        assert_eq!(flat, collective);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn throttle_of_one_still_completes_every_pair() {
    let outputs = sim::run_world(vec!["n".to_owned(); 8], |comm| async move {
        let setup = Setup {
            per_node: 2,
            aggregators: (0..8).collect(),
            co: 2,
            mode: BindMode::Spread,
            direction: Direction::Gather,
            data_size: 4,
            throttle: 1,
        };
        run_round(&comm, &setup, Variant::AllToMany, 0).await
    })
    .await
    .unwrap();
    for buffer in &outputs {
        assert_eq!((0..8).map(|s| 1 + s % 4).sum::<usize>(), buffer.len());
    }
}

/// The node-boundary size matrix: rank 0 sends {5,0,3,2}, rank 1 nothing,
/// rank 2 one byte everywhere, rank 3 two bytes to rank 1.
fn boundary_send_lens(rank: usize) -> Vec<usize> {
    match rank {
        0 => vec![5, 0, 3, 2],
        1 => vec![0, 0, 0, 0],
        2 => vec![1, 1, 1, 1],
        _ => vec![0, 2, 0, 0],
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn tam_movers_handle_the_node_boundary_matrix() {
    let outputs = sim::run_world(vec!["n".to_owned(); 4], |comm| async move {
        let n = comm.size();
        let rank = comm.rank();
        let topology = Topology::synthetic(n, rank, 2, SyntheticLayout::Contiguous).unwrap();
        let binding = bind_local(&topology, &[0, 1, 2, 3], 1, BindMode::Cover).unwrap();
        let send_len = boundary_send_lens(rank);
        let recv_len = exchange_sizes(&comm, &send_len).await.unwrap();

        let mut buffers = Vec::new();
        for (index, variant) in
            [Variant::TamGather, Variant::TamBound, Variant::TamWindowed].into_iter().enumerate()
        {
            let mut plan =
                ShufflePlan::new(send_len.clone(), recv_len.clone(), index as u32).unwrap();
            pattern::fill(&mut plan, rank);
            let ctx = RoundContext {
                comm: &comm,
                topology: &topology,
                binding: &binding,
                throttle: usize::MAX,
            };
            let mut metrics = RoundMetrics::default();
            shuffle(variant, &ctx, &mut plan, &mut metrics).await.unwrap();
            pattern::verify(&plan, rank).unwrap();
            buffers.push((0..n).flat_map(|src| plan.recv_part(src).to_vec()).collect::<Vec<u8>>());
        }
        buffers
    })
    .await
    .unwrap();

    for (rank, buffers) in outputs.iter().enumerate() {
        assert_eq!(buffers[0], buffers[1], "rank {rank}");
        assert_eq!(buffers[0], buffers[2], "rank {rank}");
    }
    // Column sums of the matrix: rank 0 hears 6 bytes, rank 1 hears 3.
    assert_eq!(6, outputs[0].len());
    assert_eq!(3, outputs[1].len());
}

#[tokio::test(flavor = "multi_thread")]
async fn randomized_sizes_keep_every_variant_equivalent() {
    let outputs = sim::run_world(sim::contiguous_localities(12, 5), |comm| async move {
        let n = comm.size();
        let rank = comm.rank();
        let topology = Topology::synthetic(n, rank, 5, SyntheticLayout::Contiguous).unwrap();
        let elected =
            aggregators::elect(n, 4, &topology, aggregators::ElectionPolicy::Stride).unwrap();
        let binding = bind_local(&topology, &elected, 2, BindMode::Cover).unwrap();

        // Seeded irregular sizes, zero for some pairs; the explicit size
        // exchange derives the receive vector.
        let mut rng = SmallRng::seed_from_u64(rank as u64 * 7 + 13);
        let mut send_len = vec![0usize; n];
        for &agg in &elected {
            send_len[agg] = rng.gen_range(0..5);
        }
        let recv_len = exchange_sizes(&comm, &send_len).await.unwrap();

        let mut reference: Option<Vec<u8>> = None;
        for (index, &variant) in GATHER_VARIANTS.iter().enumerate() {
            let mut plan =
                ShufflePlan::new(send_len.clone(), recv_len.clone(), index as u32).unwrap();
            pattern::fill(&mut plan, rank);
            let ctx = RoundContext {
                comm: &comm,
                topology: &topology,
                binding: &binding,
                throttle: 3,
            };
            let mut metrics = RoundMetrics::default();
            shuffle(variant, &ctx, &mut plan, &mut metrics).await.unwrap();
            pattern::verify(&plan, rank).unwrap();
            let buffer: Vec<u8> = (0..n).flat_map(|src| plan.recv_part(src).to_vec()).collect();
            match &reference {
                None => reference = Some(buffer),
                Some(expected) => assert_eq!(expected, &buffer, "{} diverged", variant.name()),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(12, outputs.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn dynamic_discovery_matches_the_synthetic_map() {
    let outputs = sim::run_world(sim::contiguous_localities(6, 2), |comm| async move {
        let discovered = Topology::discover(&comm).await.unwrap();
        let synthetic =
            Topology::synthetic(comm.size(), comm.rank(), 2, SyntheticLayout::Contiguous).unwrap();
        assert_eq!(synthetic, discovered);
        discovered.proxies().to_vec()
    })
    .await
    .unwrap();
    for proxies in &outputs {
        assert_eq!(&vec![0, 2, 4], proxies);
    }
}
