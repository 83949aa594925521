//! The shuffle engine: one round, many interchangeable schedules.
//!
//! Every variant consumes the same inputs (topology, aggregator binding,
//! payload plan, throttle) and produces byte-identical receive buffers; the
//! variants differ only in how requests are scheduled and therefore in
//! timing. No variant posts a zero-length message; the direct variants
//! never exceed the throttle in concurrently outstanding requests per rank,
//! while the hierarchical movers bound concurrency by client-group and node
//! counts. Any substrate failure drains the pending requests before the
//! round aborts; requests are futures, so an early exit releases whatever
//! was still posted.
//!
//! Tags are `sender + receiver + 100·round`, which keeps concurrent rounds
//! disjoint for up to 100 pending rounds; matching is per `(source, tag)`
//! so the two directions of a pair may share a tag value.

mod balanced;
mod collective;
mod flat;
mod pairwise;
mod scattered;
mod sync;
mod tam;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rankwire::{wait_all, CommError, Communicator, Request};

use crate::binding::Binding;
use crate::metrics::RoundMetrics;
use crate::plan::ShufflePlan;
use crate::topology::Topology;
use crate::{ShuffleError, ShuffleResult};

/// The schedule variants. All of them deliver the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Producers post straight to every aggregator; receives stepped when
    /// throttled.
    AllToMany,
    /// Aggregators post straight to every rank; sends stepped when
    /// throttled.
    ManyToAll,
    /// Flat with the aggregator's receive order striped by node.
    AllToManyStriped,
    /// Rotation schedule: aggregators walk producers from their stride home
    /// position.
    AllToManyBalanced,
    /// The balanced rotation in the aggregator-to-all direction.
    ManyToAllBalanced,
    /// Balanced with all sends posted up front, receives chunked.
    AllToManyPresend,
    /// Balanced where producers hold each send until the aggregator's
    /// ready token arrives.
    AllToManyControl,
    /// Pairwise-block schedule at ring offsets, wait per block.
    Scattered,
    /// Scattered with a barrier after every block.
    ScatteredBarrier,
    /// One blocking exchange per partner (XOR or ring order).
    Pairwise,
    /// Fully blocking flat schedule.
    Sync,
    /// Receives posted up front, sends blocking one at a time.
    HalfSync,
    /// The substrate's own vectorized all-to-all.
    Collective,
    /// Two-phase mover through per-node proxies.
    TamGather,
    /// Two-phase mover through the binder's local aggregators.
    TamBound,
    /// Two-phase mover with the intra-node leg in a shared window.
    TamWindowed,
}

impl Variant {
    /// Every variant, in method-selector order.
    pub const ALL: [Variant; 16] = [
        Variant::AllToMany,
        Variant::ManyToAll,
        Variant::AllToManyStriped,
        Variant::AllToManyBalanced,
        Variant::ManyToAllBalanced,
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

    /// Resolves a 1-based method selector.
    pub fn from_method(method: usize) -> Option<Variant> {
        (method >= 1).then(|| Self::ALL.get(method - 1).copied()).flatten()
    }

    /// The report name.
    pub fn name(&self) -> &'static str {
        match self {
            Variant::AllToMany => "all_to_many",
            Variant::ManyToAll => "many_to_all",
            Variant::AllToManyStriped => "all_to_many_striped",
            Variant::AllToManyBalanced => "all_to_many_balanced",
            Variant::ManyToAllBalanced => "many_to_all_balanced",
            Variant::AllToManyPresend => "all_to_many_presend",
            Variant::AllToManyControl => "all_to_many_control",
            Variant::Scattered => "scattered",
            Variant::ScatteredBarrier => "scattered_barrier",
            Variant::Pairwise => "pairwise",
            Variant::Sync => "sync",
            Variant::HalfSync => "half_sync",
            Variant::Collective => "alltoallv",
            Variant::TamGather => "tam_gather",
            Variant::TamBound => "tam_bound",
            Variant::TamWindowed => "tam_windowed",
        }
    }

    /// Whether the schedule sends data in the aggregator-to-all direction.
    pub fn is_scatter(&self) -> bool {
        matches!(self, Variant::ManyToAll | Variant::ManyToAllBalanced)
    }
}

/// The per-round inputs shared by every variant.
pub struct RoundContext<'a> {
    /// The substrate endpoint of this rank.
    pub comm: &'a Arc<dyn Communicator>,
    /// The node map.
    pub topology: &'a Topology,
    /// Aggregator sets and client binding.
    pub binding: &'a Binding,
    /// Maximum concurrently outstanding requests per rank.
    pub throttle: usize,
}

impl RoundContext<'_> {
    fn rank(&self) -> usize {
        self.comm.rank()
    }

    fn size(&self) -> usize {
        self.comm.size()
    }
}

/// Executes one shuffle round under `variant`. On success the receive
/// buffer of `plan` is fully populated; on failure every pending request
/// has been drained and the error names the failing layer.
pub async fn shuffle(
    variant: Variant,
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    if plan.size() != ctx.size() || ctx.topology.size() != ctx.size() {
        return Err(ShuffleError::InvalidConfig(format!(
            "plan covers {} ranks, topology {}, world {}",
            plan.size(),
            ctx.topology.size(),
            ctx.size()
        )));
    }
    tracing::debug!(variant = variant.name(), round = plan.round(), "starting shuffle round");
    let started = Instant::now();
    match variant {
        Variant::AllToMany => flat::all_to_many(ctx, plan, metrics).await?,
        Variant::ManyToAll => flat::many_to_all(ctx, plan, metrics).await?,
        Variant::AllToManyStriped => flat::all_to_many_striped(ctx, plan, metrics).await?,
        Variant::AllToManyBalanced => balanced::all_to_many(ctx, plan, metrics).await?,
        Variant::ManyToAllBalanced => balanced::many_to_all(ctx, plan, metrics).await?,
        Variant::AllToManyPresend => balanced::all_to_many_presend(ctx, plan, metrics).await?,
        Variant::AllToManyControl => balanced::all_to_many_control(ctx, plan, metrics).await?,
        Variant::Scattered => scattered::run(ctx, plan, metrics, false).await?,
        Variant::ScatteredBarrier => scattered::run(ctx, plan, metrics, true).await?,
        Variant::Pairwise => pairwise::run(ctx, plan, metrics).await?,
        Variant::Sync => sync::run(ctx, plan, metrics).await?,
        Variant::HalfSync => sync::half_sync(ctx, plan, metrics).await?,
        Variant::Collective => collective::run(ctx, plan, metrics).await?,
        Variant::TamGather => tam::node_proxy(ctx, plan, metrics).await?,
        Variant::TamBound => tam::bound(ctx, plan, metrics).await?,
        Variant::TamWindowed => tam::windowed(ctx, plan, metrics).await?,
    }
    metrics.total += started.elapsed();
    Ok(())
}

/// The tag of the `a → b` data message in `round`. Both directions of a
/// pair share the value; source matching keeps them apart.
pub(crate) fn pair_tag(a: usize, b: usize, round: u32) -> u64 {
    (a + b) as u64 + 100 * u64::from(round)
}

/// An owned copy of the outgoing bytes for `peer`.
pub(crate) fn send_bytes(plan: &ShufflePlan, peer: usize) -> Bytes {
    Bytes::copy_from_slice(plan.send_part(peer))
}

/// Requests posted for one step and waited together. Receives remember
/// which source they deliver for, so completion can write straight into the
/// plan. A posting failure poisons the batch: later posts are skipped and
/// the wait drains whatever was already posted before reporting it.
pub(crate) struct Batch {
    requests: Vec<Request>,
    sources: Vec<Option<usize>>,
    poisoned: Option<CommError>,
}

impl Batch {
    pub(crate) fn new() -> Self {
        Batch { requests: Vec::new(), sources: Vec::new(), poisoned: None }
    }

    pub(crate) fn send(&mut self, comm: &dyn Communicator, peer: usize, tag: u64, payload: Bytes) {
        if self.poisoned.is_some() {
            return;
        }
        match comm.isend(peer, tag, payload) {
            Ok(request) => {
                self.requests.push(request);
                self.sources.push(None);
            }
            Err(err) => self.poisoned = Some(err),
        }
    }

    pub(crate) fn recv(&mut self, comm: &dyn Communicator, peer: usize, tag: u64, len: usize) {
        if self.poisoned.is_some() {
            return;
        }
        match comm.irecv(peer, tag, len) {
            Ok(request) => {
                self.requests.push(request);
                self.sources.push(Some(peer));
            }
            Err(err) => self.poisoned = Some(err),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.poisoned.is_none()
    }

    /// Waits every request, then copies each delivered payload into the
    /// plan's segment for its source.
    pub(crate) async fn wait_into(self, plan: &mut ShufflePlan) -> ShuffleResult<()> {
        let waited = wait_all(self.requests).await;
        if let Some(err) = self.poisoned {
            return Err(err.into());
        }
        for (source, payload) in self.sources.iter().zip(waited?) {
            if let (Some(src), Some(bytes)) = (source, payload) {
                plan.deliver(*src, &bytes)?;
            }
        }
        Ok(())
    }

    /// Waits every request, discarding payloads (send-only batches).
    pub(crate) async fn wait_discard(self) -> ShuffleResult<()> {
        let waited = wait_all(self.requests).await;
        if let Some(err) = self.poisoned {
            return Err(err.into());
        }
        waited?;
        Ok(())
    }
}
