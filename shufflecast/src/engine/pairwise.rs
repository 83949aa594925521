//! Pairwise exchange: one blocking exchange per partner.

use std::time::Instant;

use super::{pair_tag, send_bytes, RoundContext};
use crate::metrics::RoundMetrics;
use crate::plan::ShufflePlan;
use crate::ShuffleResult;

/// Partners are `rank XOR i` when the world is a power of two, else the
/// ring pair `(rank + i, rank - i)`. Either direction of an exchange is
/// omitted when its length is zero, mirroring a NULL buffer.
pub(super) async fn run(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();

    for i in 0..n {
        let (to, from) = if n.is_power_of_two() {
            (rank ^ i, rank ^ i)
        } else {
            ((rank + i) % n, (rank + n - i) % n)
        };
        let send = (plan.send_len(to) > 0)
            .then(|| (to, pair_tag(rank, to, round), send_bytes(plan, to)));
        let recv =
            (plan.recv_len(from) > 0).then(|| (from, pair_tag(from, rank, round), plan.recv_len(from)));
        if send.is_none() && recv.is_none() {
            continue;
        }
        let started = Instant::now();
        let delivered = comm.send_recv(send, recv).await?;
        metrics.wait_recv += started.elapsed();
        if let Some(bytes) = delivered {
            plan.deliver(from, &bytes)?;
        }
    }
    Ok(())
}
