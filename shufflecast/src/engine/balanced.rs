//! Balanced rotation schedules.
//!
//! Each aggregator walks the producer space starting from its stride home
//! position, so no two aggregators pull from the same producer in the same
//! step. Producers derive their dual turn by inverting the home-position
//! table. Self pairs are served by an in-memory copy instead of the
//! substrate.

use std::time::Instant;

use bytes::Bytes;
use rankwire::Request;

use super::{pair_tag, send_bytes, Batch, RoundContext};
use crate::aggregators::stride_positions;
use crate::metrics::RoundMetrics;
use crate::plan::ShufflePlan;
use crate::ShuffleResult;

/// Home positions of the aggregator list and the inverse lookup from a
/// position back to the aggregator index scheduled there.
fn rotation_tables(n: usize, aggregators: usize) -> (Vec<usize>, Vec<Option<usize>>) {
    let homes = stride_positions(n, aggregators);
    let mut inverse = vec![None; n];
    for (index, &home) in homes.iter().enumerate() {
        inverse[home] = Some(index);
    }
    (homes, inverse)
}

/// Producers to aggregators under the rotation, chunked by the throttle.
pub(super) async fn all_to_many(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();
    let aggs = ctx.binding.global();
    let my_index = aggs.iter().position(|&a| a == rank);
    let (homes, inverse) = rotation_tables(n, aggs.len());
    let chunk = ctx.throttle.max(1).min(n);

    let mut base = 0;
    while base < n {
        let width = chunk.min(n - base);
        let started = Instant::now();
        let mut batch = Batch::new();
        for step in base..base + width {
            if let Some(m) = my_index {
                let src = (homes[m] + step) % n;
                if src == rank {
                    if plan.send_len(rank) > 0 {
                        plan.copy_self(rank)?;
                    }
                } else if plan.recv_len(src) > 0 {
                    batch.recv(comm, src, pair_tag(src, rank, round), plan.recv_len(src));
                }
            }
            if let Some(m) = inverse[(rank + n - step) % n] {
                let dst = aggs[m];
                if dst != rank && plan.send_len(dst) > 0 {
                    batch.send(comm, dst, pair_tag(rank, dst, round), send_bytes(plan, dst));
                }
            }
        }
        metrics.post += started.elapsed();
        if !batch.is_empty() {
            let started = Instant::now();
            batch.wait_into(plan).await?;
            metrics.wait_recv += started.elapsed();
        }
        base += width;
    }
    Ok(())
}

/// Aggregators to everyone under the same rotation.
pub(super) async fn many_to_all(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();
    let aggs = ctx.binding.global();
    let my_index = aggs.iter().position(|&a| a == rank);
    let (homes, inverse) = rotation_tables(n, aggs.len());
    let chunk = ctx.throttle.max(1).min(n);

    let mut base = 0;
    while base < n {
        let width = chunk.min(n - base);
        let started = Instant::now();
        let mut batch = Batch::new();
        for step in base..base + width {
            if let Some(m) = inverse[(rank + n - step) % n] {
                let src = aggs[m];
                if src != rank && plan.recv_len(src) > 0 {
                    batch.recv(comm, src, pair_tag(src, rank, round), plan.recv_len(src));
                }
            }
            if let Some(m) = my_index {
                let dst = (homes[m] + step) % n;
                if dst == rank {
                    if plan.send_len(rank) > 0 {
                        plan.copy_self(rank)?;
                    }
                } else if plan.send_len(dst) > 0 {
                    batch.send(comm, dst, pair_tag(rank, dst, round), send_bytes(plan, dst));
                }
            }
        }
        metrics.post += started.elapsed();
        if !batch.is_empty() {
            let started = Instant::now();
            batch.wait_into(plan).await?;
            metrics.wait_recv += started.elapsed();
        }
        base += width;
    }
    Ok(())
}

/// Balanced with every send posted up front; only the receives are chunked.
pub(super) async fn all_to_many_presend(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();
    let aggs = ctx.binding.global();
    let my_index = aggs.iter().position(|&a| a == rank);
    let (homes, inverse) = rotation_tables(n, aggs.len());
    let chunk = ctx.throttle.max(1).min(n);

    let started = Instant::now();
    let mut sends = Batch::new();
    for step in 0..n {
        if let Some(m) = inverse[(rank + n - step) % n] {
            let dst = aggs[m];
            if dst == rank {
                if plan.send_len(rank) > 0 {
                    plan.copy_self(rank)?;
                }
            } else if plan.send_len(dst) > 0 {
                sends.send(comm, dst, pair_tag(rank, dst, round), send_bytes(plan, dst));
            }
        }
    }
    metrics.post += started.elapsed();

    if let Some(m) = my_index {
        let mut base = 0;
        while base < n {
            let width = chunk.min(n - base);
            let started = Instant::now();
            let mut batch = Batch::new();
            for step in base..base + width {
                let src = (homes[m] + step) % n;
                if src != rank && plan.recv_len(src) > 0 {
                    batch.recv(comm, src, pair_tag(src, rank, round), plan.recv_len(src));
                }
            }
            metrics.post += started.elapsed();
            if !batch.is_empty() {
                let started = Instant::now();
                batch.wait_into(plan).await?;
                metrics.wait_recv += started.elapsed();
            }
            base += width;
        }
    }

    let started = Instant::now();
    sends.wait_discard().await?;
    metrics.wait_send += started.elapsed();
    Ok(())
}

/// Balanced where the aggregator announces each turn with a one-byte ready
/// token and the producer posts its data send only after the token arrives,
/// keeping unexpected messages away from high-fan-in aggregators.
pub(super) async fn all_to_many_control(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();
    let aggs = ctx.binding.global();
    let my_index = aggs.iter().position(|&a| a == rank);
    let (homes, inverse) = rotation_tables(n, aggs.len());
    let chunk = ctx.throttle.max(1).min(n);

    let mut base = 0;
    while base < n {
        let width = chunk.min(n - base);
        let started = Instant::now();
        let mut batch = Batch::new();
        // Aggregator side: hand out tokens and post the data receives.
        for step in base..base + width {
            if let Some(m) = my_index {
                let src = (homes[m] + step) % n;
                if src == rank {
                    if plan.send_len(rank) > 0 {
                        plan.copy_self(rank)?;
                    }
                } else if plan.recv_len(src) > 0 {
                    batch.send(comm, src, pair_tag(src, rank, round), Bytes::from_static(&[1]));
                    batch.recv(comm, src, pair_tag(src, rank, round), plan.recv_len(src));
                }
            }
        }
        // Producer side: collect this chunk's tokens.
        let mut tokens: Vec<(usize, Request)> = Vec::new();
        for step in base..base + width {
            if let Some(m) = inverse[(rank + n - step) % n] {
                let dst = aggs[m];
                if dst != rank && plan.send_len(dst) > 0 {
                    match comm.irecv(dst, pair_tag(rank, dst, round), 1) {
                        Ok(request) => tokens.push((dst, request)),
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        metrics.post += started.elapsed();
        // Hold each data send until its token has arrived.
        let started = Instant::now();
        for (dst, token) in tokens {
            token.wait().await?;
            batch.send(comm, dst, pair_tag(rank, dst, round), send_bytes(plan, dst));
        }
        metrics.wait_recv += started.elapsed();
        if !batch.is_empty() {
            let started = Instant::now();
            batch.wait_into(plan).await?;
            metrics.wait_recv += started.elapsed();
        }
        base += width;
    }
    Ok(())
}
