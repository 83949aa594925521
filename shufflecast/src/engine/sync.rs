//! Fully and half synchronous flat schedules.

use std::time::Instant;

use super::{pair_tag, send_bytes, Batch, RoundContext};
use crate::metrics::RoundMetrics;
use crate::plan::ShufflePlan;
use crate::ShuffleResult;

/// One post plus an immediate wait per message on both sides, walking peers
/// in stable ascending order. Sends run first; buffered delivery keeps the
/// ordering deadlock-free.
pub(super) async fn run(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();

    for &agg in ctx.binding.global() {
        if plan.send_len(agg) > 0 {
            let started = Instant::now();
            let request = comm.isend(agg, pair_tag(rank, agg, round), send_bytes(plan, agg))?;
            metrics.post += started.elapsed();
            let started = Instant::now();
            request.wait().await?;
            metrics.wait_send += started.elapsed();
        }
    }
    if ctx.binding.is_global(rank) {
        for src in 0..n {
            let len = plan.recv_len(src);
            if len > 0 {
                let started = Instant::now();
                let request = comm.irecv(src, pair_tag(src, rank, round), len)?;
                metrics.post += started.elapsed();
                let started = Instant::now();
                let bytes = request.wait().await?.expect("receives deliver a payload");
                metrics.wait_recv += started.elapsed();
                plan.deliver(src, &bytes)?;
            }
        }
    }
    Ok(())
}

/// Receives all posted up front; sends issued blocking one at a time; one
/// wait-all closes the receive side.
pub(super) async fn half_sync(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();

    let started = Instant::now();
    let mut recvs = Batch::new();
    if ctx.binding.is_global(rank) {
        for src in 0..n {
            let len = plan.recv_len(src);
            if len > 0 {
                recvs.recv(comm, src, pair_tag(src, rank, round), len);
            }
        }
    }
    metrics.post += started.elapsed();

    for &agg in ctx.binding.global() {
        if plan.send_len(agg) > 0 {
            let started = Instant::now();
            let request = comm.isend(agg, pair_tag(rank, agg, round), send_bytes(plan, agg))?;
            metrics.post += started.elapsed();
            let started = Instant::now();
            request.wait().await?;
            metrics.wait_send += started.elapsed();
        }
    }

    let started = Instant::now();
    recvs.wait_into(plan).await?;
    metrics.wait_recv += started.elapsed();
    Ok(())
}
