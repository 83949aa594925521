//! Per-round payload plans: sizes, buffers, and the explicit size agreement.
//!
//! The jagged pointer-array layout of classic collective I/O code is
//! replaced by one contiguous allocation per direction plus an
//! exclusive-prefix displacement table, so per-peer views are slices and no
//! per-element free loops exist.

use std::sync::Arc;

use bytes::Bytes;
use rankwire::Communicator;

use crate::binding::Binding;
use crate::topology::Topology;
use crate::{ShuffleError, ShuffleResult};

/// Orientation of a benchmark round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Every rank sends to the aggregators (all-to-many).
    Gather,
    /// The aggregators send to every rank (many-to-all).
    Scatter,
}

/// One rank's view of a shuffle round: how many bytes go to and come from
/// every peer, and the flat buffers holding them. `send` is concatenated by
/// destination rank, `recv` by source rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShufflePlan {
    send_len: Vec<usize>,
    recv_len: Vec<usize>,
    send_displs: Vec<usize>,
    recv_displs: Vec<usize>,
    send: Vec<u8>,
    recv: Vec<u8>,
    round: u32,
}

fn displacements(lens: &[usize]) -> Vec<usize> {
    let mut displs = Vec::with_capacity(lens.len() + 1);
    let mut acc = 0;
    displs.push(0);
    for &len in lens {
        acc += len;
        displs.push(acc);
    }
    displs
}

impl ShufflePlan {
    /// A plan with zeroed buffers sized from the two length vectors.
    pub fn new(send_len: Vec<usize>, recv_len: Vec<usize>, round: u32) -> ShuffleResult<Self> {
        if send_len.len() != recv_len.len() {
            return Err(ShuffleError::InvalidConfig(format!(
                "send vector covers {} ranks, recv vector {}",
                send_len.len(),
                recv_len.len()
            )));
        }
        let send_displs = displacements(&send_len);
        let recv_displs = displacements(&recv_len);
        let send = vec![0u8; *send_displs.last().expect("displacement table non-empty")];
        let recv = vec![0u8; *recv_displs.last().expect("displacement table non-empty")];
        Ok(ShufflePlan { send_len, recv_len, send_displs, recv_displs, send, recv, round })
    }

    /// World size.
    pub fn size(&self) -> usize {
        self.send_len.len()
    }

    /// Round identifier, feeding the tag space and the data pattern.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Bytes this rank sends to `peer`.
    pub fn send_len(&self, peer: usize) -> usize {
        self.send_len[peer]
    }

    /// Bytes this rank receives from `peer`.
    pub fn recv_len(&self, peer: usize) -> usize {
        self.recv_len[peer]
    }

    /// The full send-length vector.
    pub fn send_lens(&self) -> &[usize] {
        &self.send_len
    }

    /// The full recv-length vector.
    pub fn recv_lens(&self) -> &[usize] {
        &self.recv_len
    }

    /// Total outgoing bytes.
    pub fn total_send(&self) -> usize {
        self.send_displs[self.size()]
    }

    /// Total incoming bytes.
    pub fn total_recv(&self) -> usize {
        self.recv_displs[self.size()]
    }

    /// Offset of `peer`'s segment within the receive buffer.
    pub fn recv_displ(&self, peer: usize) -> usize {
        self.recv_displs[peer]
    }

    /// The outgoing bytes for `peer`.
    pub fn send_part(&self, peer: usize) -> &[u8] {
        &self.send[self.send_displs[peer]..self.send_displs[peer + 1]]
    }

    /// Mutable view of the outgoing bytes for `peer` (pattern fill).
    pub fn send_part_mut(&mut self, peer: usize) -> &mut [u8] {
        &mut self.send[self.send_displs[peer]..self.send_displs[peer + 1]]
    }

    /// The entire send buffer, concatenated by destination rank.
    pub fn send_all(&self) -> &[u8] {
        &self.send
    }

    /// The received bytes from `peer`.
    pub fn recv_part(&self, peer: usize) -> &[u8] {
        &self.recv[self.recv_displs[peer]..self.recv_displs[peer + 1]]
    }

    /// Stores an arrived message from `src`. The length must agree exactly
    /// with the plan; a disagreement means the size matrices were
    /// asymmetric.
    pub fn deliver(&mut self, src: usize, payload: &[u8]) -> ShuffleResult<()> {
        if payload.len() != self.recv_len[src] {
            return Err(ShuffleError::InvalidConfig(format!(
                "message from rank {src} carries {} bytes, plan expects {}",
                payload.len(),
                self.recv_len[src]
            )));
        }
        let start = self.recv_displs[src];
        self.recv[start..start + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Stores a whole delivery that is already concatenated by source rank
    /// (the intra-node scatter leg of the hierarchical movers).
    pub fn deliver_all(&mut self, payload: &[u8]) -> ShuffleResult<()> {
        if payload.len() != self.total_recv() {
            return Err(ShuffleError::InvalidConfig(format!(
                "aggregate delivery carries {} bytes, plan expects {}",
                payload.len(),
                self.total_recv()
            )));
        }
        self.recv.copy_from_slice(payload);
        Ok(())
    }

    /// Local delivery for the self pair, bypassing the substrate.
    pub fn copy_self(&mut self, rank: usize) -> ShuffleResult<()> {
        if self.send_len[rank] != self.recv_len[rank] {
            return Err(ShuffleError::InvalidConfig(format!(
                "self pair asymmetric at rank {rank}: sends {}, expects {}",
                self.send_len[rank], self.recv_len[rank]
            )));
        }
        let from = self.send_displs[rank]..self.send_displs[rank + 1];
        let to = self.recv_displs[rank];
        let len = from.len();
        self.recv[to..to + len].copy_from_slice(&self.send[from]);
        Ok(())
    }
}

/// Performs the explicit per-pair size agreement: every rank contributes its
/// send-length vector and learns its receive-length vector, so
/// `send_len[i][j] == recv_len[j][i]` holds by construction.
pub async fn exchange_sizes(
    comm: &Arc<dyn Communicator>,
    send_len: &[usize],
) -> ShuffleResult<Vec<usize>> {
    let parts = send_len
        .iter()
        .map(|&len| {
            Bytes::from(bincode::serialize(&(len as u64)).expect("fixed-width integers serialize"))
        })
        .collect();
    let exchanged = comm.all_to_all(parts).await?;
    exchanged
        .iter()
        .map(|raw| {
            bincode::deserialize::<u64>(raw)
                .map(|len| len as usize)
                .map_err(|err| ShuffleError::InvalidConfig(format!("malformed size exchange: {err}")))
        })
        .collect()
}

/// Builds the benchmark size matrix of the original driver: a sender ships
/// `1 + sender mod data_size` bytes to each of its targets.
pub fn benchmark_plan(
    direction: Direction,
    size: usize,
    rank: usize,
    aggregators: &[usize],
    data_size: usize,
    round: u32,
) -> ShuffleResult<ShufflePlan> {
    if data_size == 0 {
        return Err(ShuffleError::InvalidConfig("data size unit must be at least 1".to_owned()));
    }
    let unit = |sender: usize| 1 + sender % data_size;
    let is_agg = aggregators.binary_search(&rank).is_ok();
    let mut send_len = vec![0; size];
    let mut recv_len = vec![0; size];
    match direction {
        Direction::Gather => {
            for &agg in aggregators {
                send_len[agg] = unit(rank);
            }
            if is_agg {
                for (src, len) in recv_len.iter_mut().enumerate() {
                    *len = unit(src);
                }
            }
        }
        Direction::Scatter => {
            if is_agg {
                send_len.fill(unit(rank));
            }
            for &agg in aggregators {
                recv_len[agg] = unit(agg);
            }
        }
    }
    ShufflePlan::new(send_len, recv_len, round)
}

/// Aggregator shapes of the original striped-I/O driver, kept as workload
/// presets: `Same` picks the node proxies, `Greater` the odd ranks, `Less`
/// the first half, `All` every rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripeShape {
    Same,
    Greater,
    Less,
    All,
}

/// Elects the aggregator set of a stripe workload.
pub fn stripe_aggregators(shape: StripeShape, topology: &Topology) -> Vec<usize> {
    let size = topology.size();
    match shape {
        StripeShape::Same => topology.proxies().to_vec(),
        StripeShape::Greater => (0..size).filter(|r| r % 2 == 1).collect(),
        StripeShape::Less => (0..size / 2).collect(),
        StripeShape::All => (0..size).collect(),
    }
}

/// The receive-side layout of a hierarchical round at a global aggregator:
/// for every local aggregator, the ordered `(source, offset, length)`
/// segments of the final receive buffer owned by that aggregator's clients.
/// This is the buffer+offset rendition of a compound receive datatype,
/// built once per round.
#[derive(Debug, Clone)]
pub struct RecvLayout {
    segments: Vec<Vec<(usize, usize, usize)>>,
}

impl RecvLayout {
    /// Builds the layout from the plan's receive table and the binding.
    pub fn new(plan: &ShufflePlan, binding: &Binding) -> Self {
        let segments = binding
            .local()
            .iter()
            .map(|&agg| {
                binding
                    .clients_of(agg)
                    .expect("local list entries have client groups")
                    .iter()
                    .map(|&src| (src, plan.recv_displ(src), plan.recv_len(src)))
                    .collect()
            })
            .collect();
        RecvLayout { segments }
    }

    /// Total bytes expected from the local aggregator at `local_index`.
    pub fn expected_from(&self, local_index: usize) -> usize {
        self.segments[local_index].iter().map(|&(_, _, len)| len).sum()
    }

    /// Scatters one arrived proxy message into the final receive buffer.
    pub fn scatter(
        &self,
        local_index: usize,
        payload: &[u8],
        plan: &mut ShufflePlan,
    ) -> ShuffleResult<()> {
        let expected = self.expected_from(local_index);
        if payload.len() != expected {
            return Err(ShuffleError::InvalidConfig(format!(
                "proxy message carries {} bytes, layout expects {expected}",
                payload.len()
            )));
        }
        let mut cursor = 0;
        for &(src, _, len) in &self.segments[local_index] {
            if len > 0 {
                plan.deliver(src, &payload[cursor..cursor + len])?;
                cursor += len;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displacements_are_exclusive_prefix_sums() {
        let plan = ShufflePlan::new(vec![3, 0, 2], vec![1, 1, 0], 0).unwrap();
        assert_eq!(5, plan.total_send());
        assert_eq!(2, plan.total_recv());
        assert_eq!(3, plan.send_part(0).len());
        assert_eq!(0, plan.send_part(1).len());
        assert_eq!(1, plan.recv_displ(1));
    }

    #[test]
    fn deliver_rejects_asymmetric_sizes() {
        let mut plan = ShufflePlan::new(vec![1, 1], vec![2, 0], 0).unwrap();
        assert!(plan.deliver(0, b"ab").is_ok());
        assert!(plan.deliver(0, b"abc").is_err());
        assert!(plan.deliver(1, b"x").is_err());
    }

    #[test]
    fn gather_plan_shapes_sizes() {
        let plan = benchmark_plan(Direction::Gather, 8, 3, &[0, 4], 16, 0).unwrap();
        assert_eq!(4, plan.send_len(0));
        assert_eq!(4, plan.send_len(4));
        assert_eq!(0, plan.send_len(1));
        assert_eq!(0, plan.total_recv());

        let agg = benchmark_plan(Direction::Gather, 8, 4, &[0, 4], 16, 0).unwrap();
        assert_eq!((0..8).map(|s| 1 + s % 16).sum::<usize>(), agg.total_recv());
    }

    #[test]
    fn stripe_shapes_pick_their_aggregator_sets() {
        let topology =
            Topology::synthetic(8, 0, 2, crate::topology::SyntheticLayout::Contiguous).unwrap();
        assert_eq!(vec![0, 2, 4, 6], stripe_aggregators(StripeShape::Same, &topology));
        assert_eq!(vec![1, 3, 5, 7], stripe_aggregators(StripeShape::Greater, &topology));
        assert_eq!(vec![0, 1, 2, 3], stripe_aggregators(StripeShape::Less, &topology));
        assert_eq!(8, stripe_aggregators(StripeShape::All, &topology).len());
    }

    #[test]
    fn scatter_plan_mirrors_gather() {
        let agg = benchmark_plan(Direction::Scatter, 6, 0, &[0, 3], 4, 0).unwrap();
        assert_eq!(6, agg.total_send());
        assert_eq!(1, agg.recv_len(0));
        assert_eq!(1 + 3 % 4, agg.recv_len(3));
        let other = benchmark_plan(Direction::Scatter, 6, 1, &[0, 3], 4, 0).unwrap();
        assert_eq!(0, other.total_send());
        assert_eq!(agg.recv_lens(), other.recv_lens());
    }
}
