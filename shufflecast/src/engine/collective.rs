//! The reference path: pack the plan into the substrate's vectorized
//! all-to-all and compare the hand-rolled schedules against it.

use std::time::Instant;

use bytes::Bytes;

use super::RoundContext;
use crate::metrics::RoundMetrics;
use crate::plan::ShufflePlan;
use crate::{ShuffleError, ShuffleResult};

pub(super) async fn run(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let n = ctx.size();

    let started = Instant::now();
    let parts = (0..n).map(|peer| Bytes::copy_from_slice(plan.send_part(peer))).collect();
    metrics.post += started.elapsed();

    let started = Instant::now();
    let arrived = ctx.comm.all_to_all(parts).await?;
    metrics.wait_recv += started.elapsed();

    for (src, part) in arrived.iter().enumerate() {
        if part.len() != plan.recv_len(src) {
            return Err(ShuffleError::InvalidConfig(format!(
                "all-to-all part from rank {src} carries {} bytes, plan expects {}",
                part.len(),
                plan.recv_len(src)
            )));
        }
        if !part.is_empty() {
            plan.deliver(src, part)?;
        }
    }
    Ok(())
}
