//! Flat shuffles: direct posts between producers and aggregators, stepped
//! when a throttle is in force.

use std::time::Instant;

use super::{pair_tag, scattered, send_bytes, Batch, RoundContext};
use crate::metrics::RoundMetrics;
use crate::plan::ShufflePlan;
use crate::ShuffleResult;

/// Every rank sends to each aggregator; aggregators receive from everyone.
/// When the throttle allows fewer than `N` outstanding requests, receives
/// run in `⌈N/C⌉` steps over the stable selector `src mod steps == step`,
/// matching the sender's posting order.
pub(super) async fn all_to_many(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();
    let is_agg = ctx.binding.is_global(rank);
    let throttle = ctx.throttle.max(1);

    if throttle >= n {
        let started = Instant::now();
        let mut batch = Batch::new();
        if is_agg {
            for src in 0..n {
                let len = plan.recv_len(src);
                if len > 0 {
                    batch.recv(comm, src, pair_tag(src, rank, round), len);
                }
            }
        }
        for &agg in ctx.binding.global() {
            if plan.send_len(agg) > 0 {
                batch.send(comm, agg, pair_tag(rank, agg, round), send_bytes(plan, agg));
            }
        }
        metrics.post += started.elapsed();
        let started = Instant::now();
        batch.wait_into(plan).await?;
        metrics.wait_recv += started.elapsed();
    } else {
        let started = Instant::now();
        let mut sends = Batch::new();
        for &agg in ctx.binding.global() {
            if plan.send_len(agg) > 0 {
                sends.send(comm, agg, pair_tag(rank, agg, round), send_bytes(plan, agg));
            }
        }
        metrics.post += started.elapsed();

        let steps = n.div_ceil(throttle);
        for step in 0..steps {
            if !is_agg {
                break;
            }
            let started = Instant::now();
            let mut batch = Batch::new();
            let mut src = step;
            while src < n {
                let len = plan.recv_len(src);
                if len > 0 {
                    batch.recv(comm, src, pair_tag(src, rank, round), len);
                }
                src += steps;
            }
            metrics.post += started.elapsed();
            if !batch.is_empty() {
                let started = Instant::now();
                batch.wait_into(plan).await?;
                metrics.wait_recv += started.elapsed();
            }
        }

        let started = Instant::now();
        sends.wait_discard().await?;
        metrics.wait_send += started.elapsed();
    }
    Ok(())
}

/// The symmetric direction: aggregators send to every rank, everyone
/// receives from each aggregator. Receives are posted up front; the
/// aggregator's sends are stepped under a throttle.
pub(super) async fn many_to_all(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();
    let is_agg = ctx.binding.is_global(rank);
    let throttle = ctx.throttle.max(1);

    if throttle >= n {
        let started = Instant::now();
        let mut batch = Batch::new();
        for &agg in ctx.binding.global() {
            let len = plan.recv_len(agg);
            if len > 0 {
                batch.recv(comm, agg, pair_tag(agg, rank, round), len);
            }
        }
        if is_agg {
            for dst in 0..n {
                if plan.send_len(dst) > 0 {
                    batch.send(comm, dst, pair_tag(rank, dst, round), send_bytes(plan, dst));
                }
            }
        }
        metrics.post += started.elapsed();
        let started = Instant::now();
        batch.wait_into(plan).await?;
        metrics.wait_recv += started.elapsed();
    } else {
        let started = Instant::now();
        let mut recvs = Batch::new();
        for &agg in ctx.binding.global() {
            let len = plan.recv_len(agg);
            if len > 0 {
                recvs.recv(comm, agg, pair_tag(agg, rank, round), len);
            }
        }
        metrics.post += started.elapsed();

        let steps = n.div_ceil(throttle);
        for step in 0..steps {
            if !is_agg {
                break;
            }
            let started = Instant::now();
            let mut batch = Batch::new();
            let mut dst = step;
            while dst < n {
                if plan.send_len(dst) > 0 {
                    batch.send(comm, dst, pair_tag(rank, dst, round), send_bytes(plan, dst));
                }
                dst += steps;
            }
            metrics.post += started.elapsed();
            if !batch.is_empty() {
                let started = Instant::now();
                batch.wait_discard().await?;
                metrics.wait_send += started.elapsed();
            }
        }

        let started = Instant::now();
        recvs.wait_into(plan).await?;
        metrics.wait_recv += started.elapsed();
    }
    Ok(())
}

/// Flat with the aggregator's receive order striped by node: sources walk
/// in `nominal_node_size` stripes rotated by the aggregator's own rank, so
/// consecutive receives hit distinct nodes. The throttled path reuses the
/// scattered block loop.
pub(super) async fn all_to_many_striped(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();
    let throttle = ctx.throttle.max(1);

    if throttle < n {
        return scattered::run(ctx, plan, metrics, false).await;
    }

    let stripe = ctx.topology.nominal_node_size();
    let started = Instant::now();
    let mut batch = Batch::new();
    if ctx.binding.is_global(rank) {
        for lane in 0..stripe {
            let mut x = lane;
            while x < n {
                let src = (x + rank) % n;
                let len = plan.recv_len(src);
                if len > 0 {
                    batch.recv(comm, src, pair_tag(src, rank, round), len);
                }
                x += stripe;
            }
        }
    }
    for &agg in ctx.binding.global() {
        if plan.send_len(agg) > 0 {
            batch.send(comm, agg, pair_tag(rank, agg, round), send_bytes(plan, agg));
        }
    }
    metrics.post += started.elapsed();
    let started = Instant::now();
    batch.wait_into(plan).await?;
    metrics.wait_recv += started.elapsed();
    Ok(())
}
