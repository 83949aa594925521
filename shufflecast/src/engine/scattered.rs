//! Pairwise-block schedule at ring offsets, the closest hand-rolled
//! relative of the substrate's own all-to-all.

use std::time::Instant;

use super::{pair_tag, send_bytes, Batch, RoundContext};
use crate::metrics::RoundMetrics;
use crate::plan::ShufflePlan;
use crate::ShuffleResult;

/// Blocks of `C` offsets: in the block starting at `s`, a rank receives
/// from `(rank + s + i) mod N` and sends to `(rank - s - i) mod N`, then
/// waits the block. Both sides of a pair reach the pair at the same ring
/// offset, so every block's posts match exactly. Optionally a barrier
/// closes each block.
pub(super) async fn run(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
    per_block_barrier: bool,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();
    let block = ctx.throttle.max(1).min(n);

    let mut base = 0;
    while base < n {
        let width = block.min(n - base);
        let started = Instant::now();
        let mut batch = Batch::new();
        for i in 0..width {
            let offset = base + i;
            let from = (rank + offset) % n;
            if plan.recv_len(from) > 0 {
                batch.recv(comm, from, pair_tag(from, rank, round), plan.recv_len(from));
            }
            let to = (rank + n - offset) % n;
            if plan.send_len(to) > 0 {
                batch.send(comm, to, pair_tag(rank, to, round), send_bytes(plan, to));
            }
        }
        metrics.post += started.elapsed();
        if !batch.is_empty() {
            let started = Instant::now();
            batch.wait_into(plan).await?;
            metrics.wait_recv += started.elapsed();
        }
        if per_block_barrier {
            let started = Instant::now();
            comm.barrier().await?;
            metrics.barrier += started.elapsed();
        }
        base += width;
    }
    Ok(())
}
